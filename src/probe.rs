use std::ffi::OsString;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::toolchain::{Tool, Toolchain};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub fps: Option<f64>,
    pub has_video: bool,
    pub has_audio: bool,
    pub audio_duration_seconds: Option<f64>,
    pub video_duration_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
}

pub fn probe_media(toolchain: &Toolchain, path: &Path) -> Result<MediaInfo> {
    let mut args = ["-v", "error", "-show_streams", "-show_format", "-print_format", "json"]
        .into_iter()
        .map(OsString::from)
        .collect::<Vec<_>>();
    args.push(path.as_os_str().to_owned());
    let output = toolchain
        .run(Tool::Ffprobe, args)
        .with_context(|| format!("ffprobe failed for {}", path.display()))?;

    parse_ffprobe_json(&output.stdout)
        .with_context(|| format!("failed to read ffprobe output for {}", path.display()))
}

/// Measured duration of an audio or video file in seconds.
pub fn probe_duration(toolchain: &Toolchain, path: &Path) -> Result<f64> {
    Ok(probe_media(toolchain, path)?.duration_seconds)
}

pub(crate) fn parse_ffprobe_json(raw: &str) -> Result<MediaInfo> {
    let parsed: FfprobeOutput =
        serde_json::from_str(raw).context("failed to parse ffprobe JSON")?;

    let video = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"));
    let audio = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("audio"));

    let fps = video.and_then(|stream| {
        stream
            .r_frame_rate
            .as_deref()
            .and_then(parse_ffprobe_rate)
            .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_ffprobe_rate))
    });
    let video_duration = video.and_then(|stream| stream.duration.as_deref().and_then(parse_ffprobe_float));
    let audio_duration = audio.and_then(|stream| stream.duration.as_deref().and_then(parse_ffprobe_float));

    let duration = parsed
        .format
        .as_ref()
        .and_then(|format| format.duration.as_deref())
        .and_then(parse_ffprobe_float)
        .or(video_duration)
        .or(audio_duration)
        .ok_or_else(|| anyhow!("ffprobe did not report a duration"))?;

    Ok(MediaInfo {
        duration_seconds: duration,
        fps,
        has_video: video.is_some(),
        has_audio: audio.is_some(),
        audio_duration_seconds: audio_duration,
        video_duration_seconds: video_duration,
    })
}

fn parse_ffprobe_rate(raw: &str) -> Option<f64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Some((numerator, denominator)) = value.split_once('/') {
        let numerator = numerator.trim().parse::<f64>().ok()?;
        let denominator = denominator.trim().parse::<f64>().ok()?;
        if denominator.abs() <= f64::EPSILON {
            return None;
        }
        let result = numerator / denominator;
        return (result.is_finite() && result > 0.0).then_some(result);
    }

    let parsed = value.parse::<f64>().ok()?;
    (parsed.is_finite() && parsed > 0.0).then_some(parsed)
}

fn parse_ffprobe_float(raw: &str) -> Option<f64> {
    let parsed = raw.trim().parse::<f64>().ok()?;
    (parsed.is_finite() && parsed >= 0.0).then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_video_with_audio() {
        let raw = r#"{
            "streams": [
                {"codec_type": "video", "r_frame_rate": "30/1", "avg_frame_rate": "30/1", "duration": "4.000000"},
                {"codec_type": "audio", "duration": "4.010000"}
            ],
            "format": {"duration": "4.010000"}
        }"#;
        let info = parse_ffprobe_json(raw).expect("should parse");
        assert_eq!(info.fps, Some(30.0));
        assert!(info.has_video && info.has_audio);
        assert!((info.duration_seconds - 4.01).abs() < 1e-9);
        assert_eq!(info.video_duration_seconds, Some(4.0));
    }

    #[test]
    fn audio_only_falls_back_to_stream_duration() {
        let raw = r#"{"streams": [{"codec_type": "audio", "duration": "1.5"}], "format": {}}"#;
        let info = parse_ffprobe_json(raw).expect("should parse");
        assert_eq!(info.fps, None);
        assert!(!info.has_video);
        assert!((info.duration_seconds - 1.5).abs() < 1e-9);
    }

    #[test]
    fn ntsc_rate_is_fractional() {
        let rate = parse_ffprobe_rate("30000/1001").expect("rate");
        assert!((rate - 29.97).abs() < 0.01);
        assert_eq!(parse_ffprobe_rate("0/0"), None);
    }

    #[test]
    fn missing_duration_is_an_error() {
        let raw = r#"{"streams": [], "format": {}}"#;
        assert!(parse_ffprobe_json(raw).is_err());
    }
}
