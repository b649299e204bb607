//! Reaction-card collaborators for plug/rizz replies.

use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use image::RgbaImage;
use serde::Serialize;

use crate::render::{
    dim, fill_rect, fill_rounded_rect, load_rgba, paste_fit, vertical_gradient, RenderedFrame,
    Theme,
};

const CARD_LINE_CHARS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Plug,
    Rizz,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardRequest {
    pub kind: CardKind,
    /// Most recent conversation frame, used as the card backdrop.
    pub context_frame: Option<PathBuf>,
    pub speaker: String,
    pub reply_text: String,
    pub output: PathBuf,
}

pub trait ReactionCardGenerator: Send + Sync {
    fn generate(&self, request: &CardRequest) -> Result<RenderedFrame>;
}

/// Dims the context frame and overlays a card panel.
#[derive(Debug, Clone)]
pub struct PlaceholderCardGenerator {
    theme: Theme,
    width: u32,
    height: u32,
}

impl PlaceholderCardGenerator {
    pub fn new(theme: Theme, width: u32, height: u32) -> Self {
        Self {
            theme,
            width,
            height,
        }
    }

    fn backdrop(&self, context: Option<&PathBuf>) -> RgbaImage {
        let mut canvas = RgbaImage::new(self.width, self.height);
        vertical_gradient(&mut canvas, self.theme.bg_top, self.theme.bg_bottom);
        if let Some(path) = context {
            match load_rgba(path) {
                Ok(source) => paste_fit(&mut canvas, &source, 0, 0, self.width, self.height),
                Err(error) => tracing::warn!(
                    file = %path.display(),
                    error = %format!("{error:#}"),
                    "card context frame unreadable"
                ),
            }
        }
        canvas
    }
}

impl ReactionCardGenerator for PlaceholderCardGenerator {
    fn generate(&self, request: &CardRequest) -> Result<RenderedFrame> {
        let mut canvas = self.backdrop(request.context_frame.as_ref());
        dim(&mut canvas, self.theme.scrim);

        let unit = self.width as f32 / 1080.0;
        let px = |value: f32| (value * unit).round() as u32;
        let line_count = request.reply_text.chars().count().div_ceil(CARD_LINE_CHARS).clamp(1, 8) as u32;
        let panel_w = self.width.saturating_sub(px(160.0)).max(px(80.0) + 1);
        let panel_h = px(180.0) + line_count * px(52.0);
        let panel_x = px(80.0);
        let panel_y = self.height.saturating_sub(panel_h) / 2;
        fill_rounded_rect(
            &mut canvas,
            panel_x,
            panel_y,
            panel_w,
            panel_h,
            px(40.0),
            self.theme.card_panel,
        );

        let accent = match request.kind {
            CardKind::Plug => [52, 199, 89, 255],
            CardKind::Rizz => [255, 55, 135, 255],
        };
        fill_rounded_rect(
            &mut canvas,
            panel_x + px(40.0),
            panel_y + px(40.0),
            px(220.0),
            px(56.0),
            px(28.0),
            accent,
        );

        let mut remaining = request.reply_text.chars().count();
        for line in 0..line_count {
            let chars = remaining.clamp(1, CARD_LINE_CHARS);
            remaining = remaining.saturating_sub(CARD_LINE_CHARS);
            let bar_w = ((panel_w - px(80.0)) as usize * chars / CARD_LINE_CHARS) as u32;
            fill_rect(
                &mut canvas,
                panel_x + px(40.0),
                panel_y + px(130.0) + line * px(52.0),
                bar_w,
                px(20.0),
                self.theme.card_ink,
            );
        }

        canvas
            .save_with_format(&request.output, image::ImageFormat::Png)
            .with_context(|| format!("failed to write card {}", request.output.display()))?;
        Ok(RenderedFrame {
            path: request.output.clone(),
            width: self.width,
            height: self.height,
        })
    }
}

/// Runs another generator on a worker thread. Errors, panics and timeouts
/// fall back to the placeholder card; the job never fails here.
pub struct TimeoutCardGenerator {
    inner: Arc<dyn ReactionCardGenerator>,
    fallback: PlaceholderCardGenerator,
    timeout: Duration,
}

impl TimeoutCardGenerator {
    pub fn new(
        inner: Arc<dyn ReactionCardGenerator>,
        fallback: PlaceholderCardGenerator,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            fallback,
            timeout,
        }
    }
}

impl ReactionCardGenerator for TimeoutCardGenerator {
    fn generate(&self, request: &CardRequest) -> Result<RenderedFrame> {
        // A late worker must not overwrite the fallback, so it gets its own path.
        let mut remote = request.clone();
        remote.output = request.output.with_extension("remote.png");

        let (sender, receiver) = mpsc::sync_channel(1);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("chatreel-card-worker".to_owned())
            .spawn(move || {
                let _ = sender.send(inner.generate(&remote));
            });

        let failure = match spawned {
            Err(error) => format!("failed to spawn card worker: {error}"),
            Ok(_) => match receiver.recv_timeout(self.timeout) {
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(error)) => format!("{error:#}"),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    format!("timed out after {:.1}s", self.timeout.as_secs_f64())
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => "card worker panicked".to_owned(),
            },
        };
        tracing::warn!(
            kind = ?request.kind,
            file = %request.output.display(),
            reason = %failure,
            "reaction card generator failed; using placeholder"
        );
        self.fallback.generate(request)
    }
}
