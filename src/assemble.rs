use std::ffi::OsString;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use image::{imageops, Rgba, RgbaImage};

use crate::audio::concat_clips;
use crate::config::Canvas;
use crate::pipeline::CancelFlag;
use crate::probe::probe_media;
use crate::render::load_rgba;
use crate::timeline::{Scene, Timeline};
use crate::toolchain::{last_n_chars, spawn_error, Tool, Toolchain};

const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyReport {
    pub output: PathBuf,
    pub frames_written: u64,
    pub video_seconds: Option<f64>,
    pub audio_seconds: Option<f64>,
}

/// Scratch directory removed on drop, whatever the outcome.
pub struct AssemblyScratch {
    dir: PathBuf,
}

impl AssemblyScratch {
    pub fn create(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create assembly dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for AssemblyScratch {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_dir_all(&self.dir) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.dir.display(), %error, "failed to remove assembly scratch");
            }
        }
    }
}

/// Raw RGBA frames piped into an encoder child on a dedicated writer thread.
pub struct FrameStreamWriter {
    sender: Option<mpsc::SyncSender<Arc<Vec<u8>>>>,
    worker: Option<JoinHandle<Result<()>>>,
    frame_size: usize,
}

impl FrameStreamWriter {
    pub fn spawn(toolchain: &Toolchain, canvas: Canvas, fps: u32, output: &Path) -> Result<Self> {
        let frame_size = usize::try_from(canvas.width)
            .ok()
            .and_then(|w| {
                usize::try_from(canvas.height)
                    .ok()
                    .map(|h| w.saturating_mul(h).saturating_mul(4))
            })
            .context("frame size overflow")?;
        let args = encoder_args(canvas, fps, output);
        let binary = toolchain.binary(Tool::Ffmpeg).to_path_buf();
        let (sender, receiver) = mpsc::sync_channel::<Arc<Vec<u8>>>(4);

        let worker = thread::Builder::new()
            .name("chatreel-frame-writer".to_owned())
            .spawn(move || run_encoder(&binary, &args, receiver))
            .context("failed to spawn frame writer thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            frame_size,
        })
    }

    pub fn write_frame(&self, frame: Arc<Vec<u8>>) -> Result<()> {
        if frame.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                frame.len()
            );
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("encoder has already been finalized"))?;
        sender
            .send(frame)
            .map_err(|_| anyhow!("encoder stopped accepting frames"))
    }

    pub fn finish(mut self) -> Result<()> {
        drop(self.sender.take());
        let handle = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("frame writer thread missing"))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("frame writer thread panicked")),
        }
    }
}

fn encoder_args(canvas: Canvas, fps: u32, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgba".to_owned(),
        "-s:v".to_owned(),
        format!("{}x{}", canvas.width, canvas.height),
        "-r".to_owned(),
        fps.to_string(),
        "-i".to_owned(),
        "-".to_owned(),
        "-an".to_owned(),
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-preset".to_owned(),
        "medium".to_owned(),
        "-crf".to_owned(),
        "18".to_owned(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
        "-r".to_owned(),
        fps.to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

fn run_encoder(binary: &Path, args: &[String], receiver: mpsc::Receiver<Arc<Vec<u8>>>) -> Result<()> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            let os_args = args.iter().map(OsString::from).collect::<Vec<_>>();
            spawn_error(Tool::Ffmpeg, binary, "pipe", &os_args, error)
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
    let mut stderr_pipe = child.stderr.take();

    let mut write_error = None;
    while let Ok(frame) = receiver.recv() {
        if let Err(error) = stdin.write_all(&frame) {
            write_error = Some(error);
            break;
        }
    }
    let _ = stdin.flush();
    drop(stdin);

    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let mut stderr = String::new();
    if let Some(pipe) = stderr_pipe.as_mut() {
        let _ = pipe.read_to_string(&mut stderr);
    }
    if !status.success() {
        bail!(
            "ffmpeg frame encode failed with status {status} (stderr_tail='{}')",
            last_n_chars(&stderr, STDERR_TAIL_CHARS)
        );
    }
    if let Some(error) = write_error {
        return Err(anyhow!(error).context("failed to write frame to ffmpeg stdin"));
    }
    Ok(())
}

/// Scales `frame` to fit the canvas, centered on black.
pub fn letterbox(frame: &RgbaImage, canvas: Canvas) -> RgbaImage {
    if frame.dimensions() == (canvas.width, canvas.height) {
        return frame.clone();
    }
    let mut target = RgbaImage::from_pixel(canvas.width, canvas.height, Rgba([0, 0, 0, 255]));
    let scale = (canvas.width as f32 / frame.width().max(1) as f32)
        .min(canvas.height as f32 / frame.height().max(1) as f32);
    let w = ((frame.width() as f32 * scale).round() as u32).clamp(1, canvas.width);
    let h = ((frame.height() as f32 * scale).round() as u32).clamp(1, canvas.height);
    let scaled = imageops::resize(frame, w, h, imageops::FilterType::Triangle);
    imageops::overlay(
        &mut target,
        &scaled,
        i64::from((canvas.width - w) / 2),
        i64::from((canvas.height - h) / 2),
    );
    target
}

fn materialize(scene: &Scene, canvas: Canvas) -> Result<Option<Arc<Vec<u8>>>> {
    let Some(frame) = scene.frame.as_ref() else {
        return Ok(None);
    };
    let image = load_rgba(&frame.path)
        .with_context(|| format!("scene {} frame could not be loaded", scene.index))?;
    Ok(Some(Arc::new(letterbox(&image, canvas).into_raw())))
}

/// Streams every scene's frame `frame_count` times into a silent CFR video.
pub fn encode_video(
    toolchain: &Toolchain,
    scenes: &[Scene],
    fps: u32,
    canvas: Canvas,
    output: &Path,
    cancel: &CancelFlag,
) -> Result<u64> {
    // Leading carry-forward scenes borrow the first materialized frame.
    let first = scenes
        .iter()
        .find(|scene| scene.frame.is_some())
        .ok_or_else(|| anyhow!("timeline has no frames to encode"))?;
    let mut current = materialize(first, canvas)?
        .ok_or_else(|| anyhow!("first materialized scene lost its frame"))?;

    let writer = FrameStreamWriter::spawn(toolchain, canvas, fps, output)?;
    let mut written = 0_u64;
    let streamed = (|| -> Result<()> {
        for scene in scenes {
            cancel.check()?;
            if let Some(frame) = materialize(scene, canvas)? {
                current = frame;
            }
            for _ in 0..scene.frame_count {
                writer.write_frame(Arc::clone(&current))?;
                written += 1;
            }
        }
        Ok(())
    })();
    // The encoder's own failure explains a rejected frame better than the send error.
    writer.finish()?;
    streamed?;
    Ok(written)
}

fn mux(toolchain: &Toolchain, video: &Path, audio: &Path, output: &Path) -> Result<()> {
    let mut args = ["-hide_banner", "-loglevel", "error", "-y"]
        .into_iter()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    args.extend([
        "-i".to_owned(),
        video.to_string_lossy().into_owned(),
        "-i".to_owned(),
        audio.to_string_lossy().into_owned(),
    ]);
    args.extend(
        [
            "-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac", "-b:a", "192k",
            "-movflags", "+faststart",
        ]
        .into_iter()
        .map(str::to_owned),
    );
    args.push(output.to_string_lossy().into_owned());
    toolchain
        .run(Tool::Ffmpeg, args)
        .with_context(|| format!("failed to mux {}", output.display()))?;
    Ok(())
}

pub fn duration_tolerance(fps: u32) -> f64 {
    2.0 / f64::from(fps.max(1)) + 0.05
}

/// Encodes frames, concatenates scene audio, and muxes both into `output`.
pub fn assemble(
    toolchain: &Toolchain,
    timeline: &Timeline,
    canvas: Canvas,
    work_dir: &Path,
    output: &Path,
    cancel: &CancelFlag,
) -> Result<AssemblyReport> {
    if timeline.scenes.is_empty() {
        bail!("timeline has no scenes");
    }
    let scratch = AssemblyScratch::create(work_dir.join("assembly"))?;
    let video = scratch.path().join("video.mp4");
    let audio = scratch.path().join("audio.wav");

    let frames_written = encode_video(
        toolchain,
        &timeline.scenes,
        timeline.fps,
        canvas,
        &video,
        cancel,
    )
    .context("frame encode failed")?;
    tracing::info!(stage = "assembly", frames = frames_written, "video stream encoded");

    cancel.check()?;
    let clips = timeline
        .scenes
        .iter()
        .map(|scene| scene.audio_clip.clone())
        .collect::<Vec<_>>();
    concat_clips(toolchain, &clips, &scratch.path().join("audio.txt"), &audio)
        .context("audio concat failed")?;

    cancel.check()?;
    mux(toolchain, &video, &audio, output)?;

    let info = probe_media(toolchain, output)?;
    let (video_seconds, audio_seconds) = (info.video_duration_seconds, info.audio_duration_seconds);
    if let (Some(v), Some(a)) = (video_seconds, audio_seconds) {
        let gap = (v - a).abs();
        if gap > duration_tolerance(timeline.fps) {
            tracing::warn!(
                stage = "assembly",
                video = v,
                audio = a,
                gap,
                "audio and video durations diverge"
            );
        }
    }

    Ok(AssemblyReport {
        output: output.to_path_buf(),
        frames_written,
        video_seconds,
        audio_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_centers_smaller_frames() {
        let frame = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]));
        let boxed = letterbox(
            &frame,
            Canvas {
                width: 200,
                height: 400,
            },
        );
        assert_eq!(boxed.dimensions(), (200, 400));
        assert_eq!(boxed.get_pixel(100, 200).0, [255, 255, 255, 255]);
        assert_eq!(boxed.get_pixel(100, 10).0, [0, 0, 0, 255]);
    }

    #[test]
    fn tolerance_scales_with_fps() {
        assert!((duration_tolerance(30) - (2.0 / 30.0 + 0.05)).abs() < 1e-12);
        assert!(duration_tolerance(60) < duration_tolerance(24));
    }

    #[test]
    fn scratch_dir_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assembly");
        {
            let scratch = AssemblyScratch::create(path.clone()).unwrap();
            fs::write(scratch.path().join("frame.raw"), b"x").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn encoder_args_are_cfr_h264() {
        let args = encoder_args(
            Canvas {
                width: 1080,
                height: 1920,
            },
            30,
            Path::new("out.mp4"),
        );
        assert!(args.windows(2).any(|pair| pair == ["-s:v", "1080x1920"]));
        assert!(args.windows(2).any(|pair| pair == ["-pix_fmt", "yuv420p"]));
        assert!(args.contains(&"-an".to_owned()));
    }
}
