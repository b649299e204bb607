//! Scene timeline: resolves every message to an audio clip and a frame, and
//! schedules frame counts against the cumulative audio clock.

use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::audio::{concat_clips, generate_silence, normalize_to_wav, NotificationSounds};
use crate::cards::{CardKind, CardRequest, ReactionCardGenerator};
use crate::pipeline::CancelFlag;
use crate::probe::probe_duration;
use crate::render::{BubbleContent, BubbleSpec, FrameRenderer, FrameRequest, HeaderSpec, RenderedFrame};
use crate::sandbox::AssetSandbox;
use crate::script::{CardLine, CardMessage, Message, ScriptDirectives, Side, TextMessage, Thread};
use crate::speech::SpeechBook;
use crate::toolchain::Toolchain;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub start_frame: u64,
    pub frame_count: u64,
}

/// Assigns frame counts from the running audio clock so rounding error never
/// accumulates: the frames emitted so far always equal `round(T * fps)`.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    fps: u32,
    cursor_seconds: f64,
    frames_emitted: u64,
}

impl FrameScheduler {
    pub fn new(fps: u32) -> Self {
        Self {
            fps,
            cursor_seconds: 0.0,
            frames_emitted: 0,
        }
    }

    pub fn advance(&mut self, duration_seconds: f64) -> ScheduledSpan {
        let duration = if duration_seconds.is_finite() {
            duration_seconds.max(0.0)
        } else {
            0.0
        };
        let start_seconds = self.cursor_seconds;
        let start_frame = self.frames_emitted;
        self.cursor_seconds += duration;
        let cumulative = (self.cursor_seconds * f64::from(self.fps)).round() as u64;
        let frame_count = cumulative.saturating_sub(start_frame);
        self.frames_emitted = start_frame + frame_count;
        ScheduledSpan {
            start_seconds,
            end_seconds: self.cursor_seconds,
            start_frame,
            frame_count,
        }
    }

    pub fn cursor_seconds(&self) -> f64 {
        self.cursor_seconds
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }
}

pub fn schedule_frames(durations: &[f64], fps: u32) -> Vec<u64> {
    let mut scheduler = FrameScheduler::new(fps);
    durations
        .iter()
        .map(|duration| scheduler.advance(*duration).frame_count)
        .collect()
}

/// Groups bubble positions into pages. A page that would contain an image
/// shrinks to `image_window`.
pub fn paginate_bubbles(is_image: &[bool], window: usize, image_window: usize) -> Vec<Range<usize>> {
    let window = window.max(1);
    let image_window = image_window.clamp(1, window);
    let mut pages = Vec::new();
    let mut start = 0;
    while start < is_image.len() {
        let mut end = (start + window).min(is_image.len());
        if is_image[start..end].iter().any(|image| *image) {
            end = (start + image_window).min(is_image.len());
        }
        pages.push(start..end);
        start = end;
    }
    pages
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    Text,
    Image,
    Dots,
    AudioOnly,
    Break,
    PlugIntro,
    PlugReply,
    RizzIntro,
    RizzReply,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub index: usize,
    pub kind: SceneKind,
    /// `None` repeats the previous materialized frame.
    pub frame: Option<RenderedFrame>,
    pub audio_clip: PathBuf,
    pub duration_seconds: f64,
    pub start_seconds: f64,
    pub frame_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProtectedRange {
    pub start_seconds: f64,
    pub end_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSpan {
    pub text: String,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub fps: u32,
    pub scenes: Vec<Scene>,
    pub protected_ranges: Vec<ProtectedRange>,
    pub message_spans: Vec<MessageSpan>,
    pub total_seconds: f64,
}

impl Timeline {
    pub fn total_frames(&self) -> u64 {
        self.scenes.iter().map(|scene| scene.frame_count).sum()
    }
}

/// Everything the builder consults while resolving scenes.
pub struct TimelineInputs<'a> {
    pub toolchain: &'a Toolchain,
    pub speech: &'a SpeechBook,
    pub renderer: &'a dyn FrameRenderer,
    pub cards: &'a dyn ReactionCardGenerator,
    pub assets: Option<&'a AssetSandbox>,
    pub sounds: &'a NotificationSounds,
    pub directives: ScriptDirectives,
    pub fps: u32,
    pub window_size: usize,
    pub image_window_size: usize,
    pub scene_dir: &'a Path,
    pub cancel: &'a CancelFlag,
}

enum AudioPart {
    Normalized(PathBuf),
    Raw(PathBuf),
}

pub struct TimelineBuilder<'a> {
    inputs: TimelineInputs<'a>,
    scheduler: FrameScheduler,
    scenes: Vec<Scene>,
    protected: Vec<ProtectedRange>,
    spans: Vec<MessageSpan>,
    /// Header poster waiting for the first carry-forward scene.
    pending_poster: Option<RenderedFrame>,
    last_frame: Option<PathBuf>,
    measured: HashMap<PathBuf, f64>,
    counter: usize,
}

impl<'a> TimelineBuilder<'a> {
    pub fn new(inputs: TimelineInputs<'a>) -> Result<Self> {
        fs::create_dir_all(inputs.scene_dir).with_context(|| {
            format!("failed to create scene dir {}", inputs.scene_dir.display())
        })?;
        let fps = inputs.fps;
        Ok(Self {
            inputs,
            scheduler: FrameScheduler::new(fps),
            scenes: Vec::new(),
            protected: Vec::new(),
            spans: Vec::new(),
            pending_poster: None,
            last_frame: None,
            measured: HashMap::new(),
            counter: 0,
        })
    }

    pub fn build(mut self, threads: &[Thread]) -> Result<Timeline> {
        for (thread_index, thread) in threads.iter().enumerate() {
            self.add_thread(thread)
                .with_context(|| format!("thread {} ('{}')", thread_index, thread.contact_name))?;
        }
        let total_seconds = self.scheduler.cursor_seconds();
        tracing::info!(
            scenes = self.scenes.len(),
            frames = self.scheduler.frames_emitted(),
            seconds = total_seconds,
            protected = self.protected.len(),
            "timeline built"
        );
        Ok(Timeline {
            fps: self.inputs.fps,
            scenes: self.scenes,
            protected_ranges: self.protected,
            message_spans: self.spans,
            total_seconds,
        })
    }

    fn add_thread(&mut self, thread: &Thread) -> Result<()> {
        let header = HeaderSpec {
            contact_name: thread.contact_name.clone(),
            avatar: thread
                .avatar_ref
                .as_deref()
                .and_then(|reference| self.resolve_asset(reference, "avatar")),
            unread_count: self.inputs.directives.unread_count,
        };
        let poster = self.render(Some(&header), &[])?;
        self.last_frame = Some(poster.path.clone());
        self.pending_poster = Some(poster);

        let bubble_flags = thread
            .messages
            .iter()
            .filter_map(|message| match message {
                Message::Text(text) if !text.audio_only => Some(false),
                Message::Image(_) => Some(true),
                _ => None,
            })
            .collect::<Vec<_>>();
        let pages = paginate_bubbles(
            &bubble_flags,
            self.inputs.window_size,
            self.inputs.image_window_size,
        );

        let mut visible: Vec<BubbleSpec> = Vec::new();
        let mut ordinal = 0_usize;
        for message in &thread.messages {
            self.inputs.cancel.check()?;
            match message {
                Message::Break(pause) => self.add_break(pause.duration_seconds)?,
                Message::Plug(card) => self.add_card(CardKind::Plug, card, &thread.contact_name)?,
                Message::Rizz(card) => self.add_card(CardKind::Rizz, card, &thread.contact_name)?,
                Message::Text(text) if text.audio_only => self.add_audio_only(text)?,
                Message::Text(text) | Message::Image(text) => {
                    let page = pages
                        .iter()
                        .position(|page| page.contains(&ordinal))
                        .ok_or_else(|| anyhow!("bubble {ordinal} fell outside every page"))?;
                    if pages[page].start == ordinal {
                        visible.clear();
                    }
                    ordinal += 1;
                    let is_image = matches!(message, Message::Image(_));
                    visible.push(self.bubble_for(text, is_image));
                    let show_header = page == 0;
                    self.add_bubble(text, is_image, show_header.then_some(&header), &visible)?;
                }
            }
        }
        Ok(())
    }

    fn bubble_for(&self, text: &TextMessage, is_image: bool) -> BubbleSpec {
        let content = if is_image {
            BubbleContent::Image(self.resolve_asset(&text.display_text, "image"))
        } else if text.is_dots_only() {
            BubbleContent::Dots
        } else {
            BubbleContent::Text(text.display_text.clone())
        };
        BubbleSpec {
            side: text.sender,
            content,
        }
    }

    fn add_bubble(
        &mut self,
        text: &TextMessage,
        is_image: bool,
        header: Option<&HeaderSpec>,
        visible: &[BubbleSpec],
    ) -> Result<()> {
        let frame = self.render(header, visible)?;
        let (kind, mut parts) = if is_image {
            (SceneKind::Image, vec![self.notification(text.sender)])
        } else if text.is_dots_only() {
            (SceneKind::Dots, vec![self.notification(text.sender)])
        } else {
            let speech = self
                .inputs
                .speech
                .require(&text.speaker, &text.speech_text)?
                .to_path_buf();
            (SceneKind::Text, vec![AudioPart::Raw(speech)])
        };
        if let Some(sfx) = text.sfx_ref.as_deref().and_then(|name| self.resolve_sfx(name)) {
            parts.push(AudioPart::Raw(sfx));
        }
        let span = self.push_scene(kind, Some(frame), parts)?;
        self.record_span(&text.display_text, span);
        Ok(())
    }

    fn add_audio_only(&mut self, text: &TextMessage) -> Result<()> {
        let part = text
            .sfx_ref
            .as_deref()
            .and_then(|name| self.resolve_sfx(name))
            .map(AudioPart::Raw)
            .unwrap_or_else(|| self.notification(text.sender));
        self.push_scene(SceneKind::AudioOnly, None, vec![part])?;
        Ok(())
    }

    fn add_break(&mut self, seconds: f64) -> Result<()> {
        let clip = self.next_path("break", "wav");
        generate_silence(self.inputs.toolchain, seconds, &clip)?;
        let span = self.push_scene(SceneKind::Break, None, vec![AudioPart::Normalized(clip)])?;
        self.protected.push(ProtectedRange {
            start_seconds: span.start_seconds,
            end_seconds: span.end_seconds,
        });
        Ok(())
    }

    fn add_card(&mut self, kind: CardKind, card: &CardMessage, contact: &str) -> Result<()> {
        let (intro_kind, reply_kind) = match kind {
            CardKind::Plug => (SceneKind::PlugIntro, SceneKind::PlugReply),
            CardKind::Rizz => (SceneKind::RizzIntro, SceneKind::RizzReply),
        };

        if let Some(intro) = card.intro.as_ref().filter(|intro| !intro.silent) {
            let parts = self.card_line_audio(intro)?;
            let span = self.push_scene(intro_kind, None, parts)?;
            self.record_span(&intro.display_text, span);
        }

        let reply = &card.reply;
        let request = CardRequest {
            kind,
            context_frame: self.last_frame.clone(),
            speaker: reply.speaker.clone(),
            reply_text: reply.display_text.clone(),
            output: self.next_path("card", "png"),
        };
        let frame = self.inputs.cards.generate(&request)?;
        self.last_frame = Some(frame.path.clone());
        let parts = if reply.silent {
            let side = if reply.speaker.trim().eq_ignore_ascii_case(contact.trim()) {
                Side::Incoming
            } else {
                Side::Outgoing
            };
            vec![self.notification(side)]
        } else {
            self.card_line_audio(reply)?
        };
        let span = self.push_scene(reply_kind, Some(frame), parts)?;
        self.record_span(&reply.display_text, span);
        Ok(())
    }

    fn card_line_audio(&self, line: &CardLine) -> Result<Vec<AudioPart>> {
        let speech = self
            .inputs
            .speech
            .require(&line.speaker, &line.speech_text)?
            .to_path_buf();
        let mut parts = vec![AudioPart::Raw(speech)];
        if let Some(sfx) = line.sfx_ref.as_deref().and_then(|name| self.resolve_sfx(name)) {
            parts.push(AudioPart::Raw(sfx));
        }
        Ok(parts)
    }

    fn notification(&self, side: Side) -> AudioPart {
        AudioPart::Normalized(self.inputs.sounds.for_side(side).to_path_buf())
    }

    fn render(&mut self, header: Option<&HeaderSpec>, bubbles: &[BubbleSpec]) -> Result<RenderedFrame> {
        let output = self.next_path("frame", "png");
        let frame = self.inputs.renderer.render(&FrameRequest {
            header,
            bubbles,
            corner_radius: self.inputs.directives.corner_radius,
            output: &output,
        })?;
        self.last_frame = Some(frame.path.clone());
        Ok(frame)
    }

    fn push_scene(
        &mut self,
        kind: SceneKind,
        frame: Option<RenderedFrame>,
        parts: Vec<AudioPart>,
    ) -> Result<ScheduledSpan> {
        let index = self.scenes.len();
        let clip = self
            .scene_clip(parts)
            .with_context(|| format!("failed to prepare audio for scene {index}"))?;
        let duration = self.measure(&clip)?;
        let frame = frame.or_else(|| self.pending_poster.take());

        let span = self.scheduler.advance(duration);
        tracing::debug!(
            stage = "timeline",
            scene = index,
            kind = ?kind,
            duration,
            frames = span.frame_count,
            "scene scheduled"
        );
        self.scenes.push(Scene {
            index,
            kind,
            frame,
            audio_clip: clip,
            duration_seconds: duration,
            start_seconds: span.start_seconds,
            frame_count: span.frame_count,
        });
        Ok(span)
    }

    /// Normalizes every part and joins them into one WAV for the scene.
    fn scene_clip(&mut self, parts: Vec<AudioPart>) -> Result<PathBuf> {
        let mut normalized = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                AudioPart::Normalized(path) => normalized.push(path),
                AudioPart::Raw(path) => {
                    let output = self.next_path("clip", "wav");
                    normalize_to_wav(self.inputs.toolchain, &path, &output)?;
                    normalized.push(output);
                }
            }
        }
        match normalized.len() {
            0 => Err(anyhow!("scene has no audio")),
            1 => Ok(normalized.remove(0)),
            _ => {
                let output = self.next_path("scene", "wav");
                let list = output.with_extension("txt");
                concat_clips(self.inputs.toolchain, &normalized, &list, &output)?;
                Ok(output)
            }
        }
    }

    fn measure(&mut self, clip: &Path) -> Result<f64> {
        if let Some(duration) = self.measured.get(clip) {
            return Ok(*duration);
        }
        let duration = probe_duration(self.inputs.toolchain, clip)?;
        self.measured.insert(clip.to_path_buf(), duration);
        Ok(duration)
    }

    fn record_span(&mut self, text: &str, span: ScheduledSpan) {
        if text.trim().is_empty() {
            return;
        }
        self.spans.push(MessageSpan {
            text: text.to_owned(),
            start_seconds: span.start_seconds,
            end_seconds: span.end_seconds,
        });
    }

    fn resolve_asset(&self, reference: &str, what: &str) -> Option<PathBuf> {
        let Some(assets) = self.inputs.assets else {
            tracing::warn!(file = reference, "no asset root for {}; using placeholder", what);
            return None;
        };
        match assets.resolve(reference) {
            Ok(path) => Some(path),
            Err(error) => {
                tracing::warn!(
                    stage = "timeline",
                    scene = self.scenes.len(),
                    file = reference,
                    error = %format!("{error:#}"),
                    "{} unavailable; using placeholder",
                    what
                );
                None
            }
        }
    }

    fn resolve_sfx(&self, name: &str) -> Option<PathBuf> {
        let assets = self.inputs.assets?;
        match assets.resolve_sfx(name) {
            Ok(path) => Some(path),
            Err(error) => {
                tracing::warn!(
                    stage = "timeline",
                    scene = self.scenes.len(),
                    file = name,
                    error = %format!("{error:#}"),
                    "sound effect skipped"
                );
                None
            }
        }
    }

    fn next_path(&mut self, prefix: &str, ext: &str) -> PathBuf {
        self.counter += 1;
        self.inputs
            .scene_dir
            .join(format!("{prefix}_{:05}.{ext}", self.counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_second_scenes_get_exact_counts() {
        assert_eq!(schedule_frames(&[1.0, 1.0, 1.0], 30), vec![30, 30, 30]);
    }

    #[test]
    fn fractional_scenes_conserve_total() {
        let counts = schedule_frames(&[0.333, 0.333, 0.334], 30);
        assert_eq!(counts.iter().sum::<u64>(), 30);
        assert_eq!(counts, vec![10, 10, 10]);
    }

    #[test]
    fn long_scripts_do_not_drift() {
        let durations = vec![0.517; 400];
        let counts = schedule_frames(&durations, 30);
        let total: f64 = durations.iter().sum();
        assert_eq!(counts.iter().sum::<u64>(), (total * 30.0).round() as u64);
    }

    #[test]
    fn tiny_scenes_can_get_zero_frames() {
        let counts = schedule_frames(&[0.01, 0.01, 1.0], 30);
        assert_eq!(counts[0], 0);
        assert_eq!(counts.iter().sum::<u64>(), 31);
    }

    #[test]
    fn scheduler_reports_spans() {
        let mut scheduler = FrameScheduler::new(24);
        let first = scheduler.advance(1.5);
        let second = scheduler.advance(f64::NAN);
        assert_eq!(first.frame_count, 36);
        assert_eq!(second.start_frame, 36);
        assert_eq!(second.frame_count, 0);
        assert_eq!(scheduler.cursor_seconds(), 1.5);
    }

    #[test]
    fn pages_shrink_around_images() {
        let flags = [false, false, false, false, false, false, false, false];
        assert_eq!(paginate_bubbles(&flags, 6, 3), vec![0..6, 6..8]);

        let flags = [false, false, true, false, false, false, false];
        assert_eq!(paginate_bubbles(&flags, 6, 3), vec![0..3, 3..7]);
        assert!(paginate_bubbles(&[], 6, 3).is_empty());
    }

    #[test]
    fn pages_always_make_progress() {
        assert_eq!(paginate_bubbles(&[true, true], 0, 0), vec![0..1, 1..2]);
    }
}
