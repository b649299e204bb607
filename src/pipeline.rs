//! One render job, end to end.
//!
//! Parse and speech prefetch run on the async side; timeline, assembly and
//! trimming run together on a blocking thread. The job's working directory
//! is a `TempDir` and is removed on every exit path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::assemble::assemble;
use crate::audio::NotificationSounds;
use crate::cards::{PlaceholderCardGenerator, ReactionCardGenerator, TimeoutCardGenerator};
use crate::config::{JobConfig, SoundConfig};
use crate::render::{resolve_theme, FrameRenderer, SchematicRenderer};
use crate::sandbox::AssetSandbox;
use crate::script::{parse_script, Script};
use crate::speech::{
    collect_speech_requests, prefetch_speech, HttpSpeechClient, SpeechBook, SpeechCache,
    SpeechSynthesizer, VoiceMap, VoiceSettings,
};
use crate::stage_error::{Stage, StageError, StageResultExt};
use crate::timeline::{MessageSpan, TimelineBuilder, TimelineInputs};
use crate::toolchain::Toolchain;
use crate::trim::{trim_silence, TrimReport};

/// Shared cancellation switch for one job.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StageError::cancelled().into());
        }
        Ok(())
    }
}

/// Cancels the job when dropped while still armed, so a blocking stage
/// outliving a dropped `run_job` future stops before publishing.
struct CancelOnDrop {
    flag: CancelFlag,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: CancelFlag) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub script_path: PathBuf,
    pub work_root: PathBuf,
    pub output_path: PathBuf,
    pub theme: String,
    pub sounds: SoundConfig,
    pub config: JobConfig,
    pub cancel: CancelFlag,
}

/// External collaborators, injectable for tests and alternate backends.
#[derive(Clone)]
pub struct Collaborators {
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub renderer: Arc<dyn FrameRenderer>,
    pub cards: Arc<dyn ReactionCardGenerator>,
}

impl Collaborators {
    /// HTTP synthesis, schematic frames and placeholder cards.
    pub fn defaults(config: &JobConfig, theme: &str, api_key: Option<String>) -> Result<Self> {
        let theme = resolve_theme(theme)?;
        let synthesizer = HttpSpeechClient::new(&config.speech, api_key)?;
        let (width, height) = (config.canvas.width, config.canvas.height);
        Ok(Self {
            synthesizer: Arc::new(synthesizer),
            renderer: Arc::new(SchematicRenderer::new(theme, width, height)),
            cards: Arc::new(PlaceholderCardGenerator::new(theme, width, height)),
        })
    }

    /// Routes cards through `generator`, bounded by the configured timeout.
    pub fn with_card_generator(
        mut self,
        generator: Arc<dyn ReactionCardGenerator>,
        config: &JobConfig,
        theme: &str,
    ) -> Result<Self> {
        let theme = resolve_theme(theme)?;
        let fallback =
            PlaceholderCardGenerator::new(theme, config.canvas.width, config.canvas.height);
        self.cards = Arc::new(TimeoutCardGenerator::new(
            generator,
            fallback,
            Duration::from_secs(config.card_timeout_secs),
        ));
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutput {
    pub video_path: PathBuf,
    pub message_timeline: Vec<MessageSpan>,
    pub duration_seconds: f64,
    pub scenes: usize,
    pub frames: u64,
    pub trim: TrimReport,
}

pub async fn run_job(ctx: JobContext, collaborators: Collaborators) -> Result<JobOutput> {
    let raw = fs::read_to_string(&ctx.script_path)
        .with_context(|| format!("failed to read script {}", ctx.script_path.display()))
        .stage(Stage::Input)?;
    let script = parse_script(&raw);
    if script.threads.is_empty() {
        return Err(StageError::new(Stage::Input, "script contains no threads").into());
    }
    resolve_theme(&ctx.theme).stage(Stage::Input)?;
    let toolchain = Toolchain::resolve(ctx.config.ffmpeg).stage(Stage::Assembly)?;
    tracing::info!(
        script = %ctx.script_path.display(),
        threads = script.threads.len(),
        "job started"
    );

    fs::create_dir_all(&ctx.work_root)
        .with_context(|| format!("failed to create work root {}", ctx.work_root.display()))
        .stage(Stage::Output)?;
    let work = tempfile::Builder::new()
        .prefix("chatreel-job-")
        .tempdir_in(&ctx.work_root)
        .context("failed to create job working directory")
        .stage(Stage::Output)?;

    let guard = CancelOnDrop::new(ctx.cancel.clone());
    ctx.cancel.check()?;
    let book = synthesize_speech(&ctx, &script, &collaborators, work.path())
        .await
        .stage(Stage::Synthesis)?;

    ctx.cancel.check()?;
    let work_dir = work.path().to_path_buf();
    let output = tokio::task::spawn_blocking(move || {
        render_stages(&ctx, &script, &book, &collaborators, &toolchain, &work_dir)
    })
    .await
    .map_err(|error| anyhow!("render stage panicked: {error}"))
    .stage(Stage::Assembly)?;

    guard.disarm();
    drop(work);
    output
}

async fn synthesize_speech(
    ctx: &JobContext,
    script: &Script,
    collaborators: &Collaborators,
    work_dir: &Path,
) -> Result<SpeechBook> {
    let cache_dir = ctx
        .config
        .cache_dir
        .clone()
        .unwrap_or_else(|| ctx.work_root.join("speech-cache"));
    let cache = SpeechCache::new(
        cache_dir,
        work_dir.join("speech"),
        Arc::clone(&collaborators.synthesizer),
        VoiceMap::from_config(&ctx.config.speech),
        VoiceSettings {
            stability: ctx.config.speech.stability,
            similarity_boost: ctx.config.speech.similarity_boost,
        },
    )?;
    let lines = collect_speech_requests(&script.threads);
    prefetch_speech(Arc::new(cache), lines, ctx.config.speech.max_concurrency).await
}

fn render_stages(
    ctx: &JobContext,
    script: &Script,
    book: &SpeechBook,
    collaborators: &Collaborators,
    toolchain: &Toolchain,
    work_dir: &Path,
) -> Result<JobOutput> {
    let sounds = NotificationSounds::prepare(toolchain, &ctx.sounds, &work_dir.join("sounds"))
        .stage(Stage::Timeline)?;
    let assets = ctx
        .script_path
        .parent()
        .map(|dir| if dir.as_os_str().is_empty() { Path::new(".") } else { dir })
        .and_then(|dir| match AssetSandbox::new(dir) {
            Ok(sandbox) => Some(sandbox),
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "asset root unavailable");
                None
            }
        });

    let scene_dir = work_dir.join("scenes");
    let timeline = TimelineBuilder::new(TimelineInputs {
        toolchain,
        speech: book,
        renderer: collaborators.renderer.as_ref(),
        cards: collaborators.cards.as_ref(),
        assets: assets.as_ref(),
        sounds: &sounds,
        directives: script.directives,
        fps: ctx.config.fps,
        window_size: ctx.config.window_size,
        image_window_size: ctx.config.image_window_size,
        scene_dir: &scene_dir,
        cancel: &ctx.cancel,
    })
    .and_then(|builder| builder.build(&script.threads))
    .stage(Stage::Timeline)?;

    ctx.cancel.check()?;
    let assembled = work_dir.join("assembled.mp4");
    let report = assemble(
        toolchain,
        &timeline,
        ctx.config.canvas,
        work_dir,
        &assembled,
        &ctx.cancel,
    )
    .stage(Stage::Assembly)?;

    ctx.cancel.check()?;
    let trimmed = work_dir.join("final.mp4");
    let trim = trim_silence(
        toolchain,
        &assembled,
        &trimmed,
        &timeline.protected_ranges,
        &ctx.config.trim,
        timeline.total_seconds,
    )
    .stage(Stage::Trim)?;

    ctx.cancel.check()?;
    publish(&trimmed, &ctx.output_path).stage(Stage::Output)?;
    tracing::info!(
        output = %ctx.output_path.display(),
        seconds = trim.kept_seconds,
        "job finished"
    );

    Ok(JobOutput {
        video_path: ctx.output_path.clone(),
        message_timeline: trim.keep_ranges.remap_spans(&timeline.message_spans),
        duration_seconds: trim.kept_seconds,
        scenes: timeline.scenes.len(),
        frames: report.frames_written,
        trim: TrimReport {
            output: ctx.output_path.clone(),
            ..trim
        },
    })
}

/// Moves the finished file into place. Across filesystems the copy lands in
/// a sibling temp file first, so `to` is either complete or untouched.
fn publish(from: &Path, to: &Path) -> Result<()> {
    let parent = match to.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create output dir {}", parent.display()))?;
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    publish_by_copy(from, to, parent)
}

fn publish_by_copy(from: &Path, to: &Path, parent: &Path) -> Result<()> {
    let staged = tempfile::Builder::new()
        .prefix(".chatreel-publish-")
        .tempfile_in(parent)
        .with_context(|| format!("failed to stage output in {}", parent.display()))?;
    fs::copy(from, staged.path())
        .with_context(|| format!("failed to write output {}", to.display()))?;
    staged
        .persist(to)
        .map_err(|error| anyhow!("failed to publish {}: {}", to.display(), error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage_error::find_stage_error;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(flag.check().is_ok());
        clone.cancel();
        let error = flag.check().unwrap_err();
        assert_eq!(
            find_stage_error(&error).map(|stage| stage.stage),
            Some(Stage::Cancelled)
        );
    }

    #[test]
    fn dropping_an_armed_guard_cancels_the_job() {
        let flag = CancelFlag::new();
        drop(CancelOnDrop::new(flag.clone()));
        assert!(flag.is_cancelled());

        let flag = CancelFlag::new();
        CancelOnDrop::new(flag.clone()).disarm();
        assert!(!flag.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_job_future_cancels_its_flag() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("chat.txt");
        fs::write(&script, "sms: Sam\nSam: hi\n").unwrap();
        let flag = CancelFlag::new();
        let ctx = JobContext {
            script_path: script,
            work_root: dir.path().join("work"),
            output_path: dir.path().join("out.mp4"),
            theme: "light".to_owned(),
            sounds: SoundConfig::default(),
            config: JobConfig::default(),
            cancel: flag.clone(),
        };
        let collaborators = Collaborators {
            synthesizer: Arc::new(StalledSynth),
            renderer: Arc::new(SchematicRenderer::new(
                resolve_theme("light").unwrap(),
                64,
                64,
            )),
            cards: Arc::new(PlaceholderCardGenerator::new(
                resolve_theme("light").unwrap(),
                64,
                64,
            )),
        };
        let outcome =
            tokio::time::timeout(Duration::from_millis(50), run_job(ctx, collaborators)).await;
        // Without ffmpeg the job fails before the guard exists and nothing is cancelled.
        assert_eq!(outcome.is_err(), flag.is_cancelled());
        assert!(!dir.path().join("out.mp4").exists());
    }

    struct StalledSynth;

    #[async_trait::async_trait]
    impl SpeechSynthesizer for StalledSynth {
        async fn synthesize(
            &self,
            _request: &crate::speech::SpeechRequest,
        ) -> Result<Vec<u8>> {
            std::future::pending().await
        }
    }

    #[test]
    fn failed_copy_leaves_destination_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("clip.mp4");
        fs::write(&to, b"previous").unwrap();
        assert!(publish_by_copy(&dir.path().join("missing.mp4"), &to, dir.path()).is_err());
        assert_eq!(fs::read(&to).unwrap(), b"previous");

        let from = dir.path().join("final.mp4");
        fs::write(&from, b"video").unwrap();
        publish_by_copy(&from, &to, dir.path()).unwrap();
        assert_eq!(fs::read(&to).unwrap(), b"video");
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".chatreel-publish-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn publish_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("final.mp4");
        fs::write(&from, b"video").unwrap();
        let to = dir.path().join("out/nested/clip.mp4");
        publish(&from, &to).unwrap();
        assert_eq!(fs::read(&to).unwrap(), b"video");
    }
}
