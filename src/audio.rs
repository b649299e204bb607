//! Scene audio preparation: every clip that enters the timeline is normalized
//! to the same PCM WAV layout so concatenation never re-encodes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::SoundConfig;
use crate::script::Side;
use crate::toolchain::{seconds_arg, Tool, Toolchain};

pub const SAMPLE_RATE: u32 = 44_100;
pub const CHANNELS: u32 = 2;
const OUTGOING_TONE_HZ: u32 = 1320;
const INCOMING_TONE_HZ: u32 = 880;
const TONE_SECONDS: f64 = 0.35;

fn base_args() -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
    ]
}

fn pcm_output_args(output: &Path) -> Vec<String> {
    vec![
        "-vn".to_owned(),
        "-ar".to_owned(),
        SAMPLE_RATE.to_string(),
        "-ac".to_owned(),
        CHANNELS.to_string(),
        "-c:a".to_owned(),
        "pcm_s16le".to_owned(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Decodes any input ffmpeg understands into the timeline WAV layout.
pub fn normalize_to_wav(toolchain: &Toolchain, input: &Path, output: &Path) -> Result<()> {
    let mut args = base_args();
    args.extend(["-i".to_owned(), input.to_string_lossy().into_owned()]);
    args.extend(pcm_output_args(output));
    toolchain
        .run(Tool::Ffmpeg, args)
        .with_context(|| format!("failed to normalize audio {}", input.display()))?;
    Ok(())
}

pub fn generate_silence(toolchain: &Toolchain, seconds: f64, output: &Path) -> Result<()> {
    if !seconds.is_finite() || seconds < 0.0 {
        bail!("silence duration must be a non-negative number, got {seconds}");
    }
    let mut args = base_args();
    args.extend([
        "-f".to_owned(),
        "lavfi".to_owned(),
        "-i".to_owned(),
        format!("anullsrc=r={SAMPLE_RATE}:cl=stereo"),
        "-t".to_owned(),
        seconds_arg(seconds),
    ]);
    args.extend(pcm_output_args(output));
    toolchain
        .run(Tool::Ffmpeg, args)
        .with_context(|| format!("failed to generate {seconds:.3}s of silence"))?;
    Ok(())
}

pub fn generate_tone(
    toolchain: &Toolchain,
    frequency_hz: u32,
    seconds: f64,
    output: &Path,
) -> Result<()> {
    let mut args = base_args();
    args.extend([
        "-f".to_owned(),
        "lavfi".to_owned(),
        "-i".to_owned(),
        format!("sine=frequency={frequency_hz}:sample_rate={SAMPLE_RATE}"),
        "-t".to_owned(),
        seconds_arg(seconds),
        "-af".to_owned(),
        format!("volume=0.4,afade=t=out:st={}:d=0.15", seconds_arg((seconds - 0.15).max(0.0))),
    ]);
    args.extend(pcm_output_args(output));
    toolchain
        .run(Tool::Ffmpeg, args)
        .context("failed to generate notification tone")?;
    Ok(())
}

/// Body of an ffmpeg concat-demuxer list file.
pub fn concat_list_contents(clips: &[PathBuf]) -> String {
    clips
        .iter()
        .map(|clip| {
            let escaped = clip.to_string_lossy().replace('\'', "'\\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

/// Concatenates already-normalized WAV clips without re-encoding.
pub fn concat_clips(
    toolchain: &Toolchain,
    clips: &[PathBuf],
    list_path: &Path,
    output: &Path,
) -> Result<()> {
    if clips.is_empty() {
        bail!("no audio clips to concatenate");
    }
    fs::write(list_path, concat_list_contents(clips))
        .with_context(|| format!("failed to write concat list {}", list_path.display()))?;
    let mut args = base_args();
    args.extend([
        "-f".to_owned(),
        "concat".to_owned(),
        "-safe".to_owned(),
        "0".to_owned(),
        "-i".to_owned(),
        list_path.to_string_lossy().into_owned(),
        "-c".to_owned(),
        "copy".to_owned(),
        output.to_string_lossy().into_owned(),
    ]);
    toolchain
        .run(Tool::Ffmpeg, args)
        .with_context(|| format!("failed to concatenate {} audio clips", clips.len()))?;
    Ok(())
}

/// Normalized notification sounds used for images, dots and audio-only turns.
#[derive(Debug, Clone)]
pub struct NotificationSounds {
    pub outgoing: PathBuf,
    pub incoming: PathBuf,
}

impl NotificationSounds {
    /// Normalizes custom sounds when given; a missing or undecodable custom
    /// sound falls back to a generated tone.
    pub fn prepare(toolchain: &Toolchain, sounds: &SoundConfig, dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create sounds dir {}", dir.display()))?;
        let outgoing = prepare_one(
            toolchain,
            sounds.outgoing.as_deref(),
            OUTGOING_TONE_HZ,
            &dir.join("notify_outgoing.wav"),
        )?;
        let incoming = prepare_one(
            toolchain,
            sounds.incoming.as_deref(),
            INCOMING_TONE_HZ,
            &dir.join("notify_incoming.wav"),
        )?;
        Ok(Self { outgoing, incoming })
    }

    pub fn for_side(&self, side: Side) -> &Path {
        match side {
            Side::Outgoing => &self.outgoing,
            Side::Incoming => &self.incoming,
        }
    }
}

fn prepare_one(
    toolchain: &Toolchain,
    custom: Option<&Path>,
    tone_hz: u32,
    output: &Path,
) -> Result<PathBuf> {
    if let Some(custom) = custom {
        match normalize_to_wav(toolchain, custom, output) {
            Ok(()) => return Ok(output.to_path_buf()),
            Err(error) => tracing::warn!(
                file = %custom.display(),
                error = %format!("{error:#}"),
                "custom notification sound unusable; using generated tone"
            ),
        }
    }
    generate_tone(toolchain, tone_hz, TONE_SECONDS, output)?;
    Ok(output.to_path_buf())
}
