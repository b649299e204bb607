//! Frame renderer seam.
//!
//! The timeline only needs a path and pixel dimensions back from a renderer;
//! [`SchematicRenderer`] is the built-in implementation.

mod draw;
mod schematic;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::script::Side;

pub(crate) use draw::{dim, fill_rect, fill_rounded_rect, paste_fit, vertical_gradient};
pub(crate) use schematic::load_rgba;
pub use schematic::SchematicRenderer;

#[derive(Debug, Clone, PartialEq)]
pub enum BubbleContent {
    Text(String),
    Dots,
    /// A resolved image, or `None` when the reference could not be loaded.
    Image(Option<PathBuf>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BubbleSpec {
    pub side: Side,
    pub content: BubbleContent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderSpec {
    pub contact_name: String,
    pub avatar: Option<PathBuf>,
    pub unread_count: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FrameRequest<'a> {
    pub header: Option<&'a HeaderSpec>,
    pub bubbles: &'a [BubbleSpec],
    /// Bubble corner radius in pixels; the renderer default applies when unset.
    pub corner_radius: Option<f32>,
    pub output: &'a Path,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedFrame {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

pub trait FrameRenderer: Send + Sync {
    fn render(&self, request: &FrameRequest<'_>) -> Result<RenderedFrame>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Theme {
    pub name: &'static str,
    pub bg_top: [u8; 4],
    pub bg_bottom: [u8; 4],
    pub header_bg: [u8; 4],
    pub header_ink: [u8; 4],
    pub outgoing_bubble: [u8; 4],
    pub incoming_bubble: [u8; 4],
    pub outgoing_ink: [u8; 4],
    pub incoming_ink: [u8; 4],
    pub redaction: [u8; 4],
    pub badge: [u8; 4],
    pub placeholder: [u8; 4],
    pub card_panel: [u8; 4],
    pub card_ink: [u8; 4],
    pub scrim: [u8; 4],
}

pub fn resolve_theme(raw: &str) -> Result<Theme> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "" | "light" | "default" => Ok(Theme {
            name: "light",
            bg_top: [255, 255, 255, 255],
            bg_bottom: [244, 244, 247, 255],
            header_bg: [246, 246, 248, 255],
            header_ink: [28, 28, 30, 255],
            outgoing_bubble: [10, 132, 255, 255],
            incoming_bubble: [229, 229, 234, 255],
            outgoing_ink: [255, 255, 255, 230],
            incoming_ink: [28, 28, 30, 200],
            redaction: [120, 120, 128, 255],
            badge: [255, 59, 48, 255],
            placeholder: [200, 200, 206, 255],
            card_panel: [255, 255, 255, 245],
            card_ink: [28, 28, 30, 210],
            scrim: [0, 0, 0, 110],
        }),
        "dark" => Ok(Theme {
            name: "dark",
            bg_top: [0, 0, 0, 255],
            bg_bottom: [14, 14, 18, 255],
            header_bg: [28, 28, 30, 255],
            header_ink: [242, 242, 247, 255],
            outgoing_bubble: [10, 132, 255, 255],
            incoming_bubble: [44, 44, 46, 255],
            outgoing_ink: [255, 255, 255, 230],
            incoming_ink: [242, 242, 247, 210],
            redaction: [90, 90, 96, 255],
            badge: [255, 69, 58, 255],
            placeholder: [72, 72, 78, 255],
            card_panel: [36, 36, 40, 245],
            card_ink: [242, 242, 247, 210],
            scrim: [0, 0, 0, 150],
        }),
        _ => bail!("unknown theme '{}'. Supported: light, dark", raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn themes_resolve_case_insensitively() {
        assert_eq!(resolve_theme("Dark").unwrap().name, "dark");
        assert_eq!(resolve_theme("").unwrap().name, "light");
        assert!(resolve_theme("neon").is_err());
    }
}
