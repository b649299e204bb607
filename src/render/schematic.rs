use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops, Rgba, RgbaImage};

use super::draw::{
    fill_circle, fill_rect, fill_rounded_rect, paste_fit, placeholder_tile, vertical_gradient,
};
use super::{BubbleContent, BubbleSpec, FrameRenderer, FrameRequest, HeaderSpec, RenderedFrame, Theme};
use crate::script::Side;

const BASE_WIDTH: f32 = 1080.0;
const DEFAULT_CORNER_RADIUS: f32 = 36.0;
const MAX_LINE_CHARS: usize = 28;

/// Draws chat frames as solid shapes: text lines become ink bars and
/// redacted spans become opaque blocks.
#[derive(Debug, Clone)]
pub struct SchematicRenderer {
    theme: Theme,
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    len: usize,
    redacted: bool,
}

struct Placed<'a> {
    bubble: &'a BubbleSpec,
    y: u32,
    w: u32,
    h: u32,
    lines: Vec<Vec<Segment>>,
}

impl SchematicRenderer {
    pub fn new(theme: Theme, width: u32, height: u32) -> Self {
        Self {
            theme,
            width,
            height,
        }
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    fn px(&self, value: f32) -> u32 {
        (value * self.width as f32 / BASE_WIDTH).round().max(0.0) as u32
    }

    pub(crate) fn compose(&self, request: &FrameRequest<'_>) -> RgbaImage {
        let mut canvas = RgbaImage::new(self.width, self.height);
        vertical_gradient(&mut canvas, self.theme.bg_top, self.theme.bg_bottom);

        let mut top = self.px(110.0);
        if let Some(header) = request.header {
            top = self.draw_header(&mut canvas, header) + self.px(28.0);
        }

        let radius = self.px(request.corner_radius.unwrap_or(DEFAULT_CORNER_RADIUS));
        let gap = self.px(18.0);
        let mut placed = Vec::with_capacity(request.bubbles.len());
        let mut cursor = top;
        for bubble in request.bubbles {
            let (w, h, lines) = self.measure(bubble);
            placed.push(Placed {
                bubble,
                y: cursor,
                w,
                h,
                lines,
            });
            cursor += h + gap;
        }

        // Scroll so the newest bubble stays on screen.
        let floor = self.height.saturating_sub(self.px(60.0));
        let overflow = cursor.saturating_sub(gap).saturating_sub(floor);
        for item in &placed {
            let Some(y) = item.y.checked_sub(overflow) else {
                continue;
            };
            self.draw_bubble(&mut canvas, item, y, radius);
        }
        canvas
    }

    fn measure(&self, bubble: &BubbleSpec) -> (u32, u32, Vec<Vec<Segment>>) {
        let pad_x = self.px(30.0);
        let pad_y = self.px(22.0);
        match &bubble.content {
            BubbleContent::Text(text) => {
                let lines = layout_lines(text, MAX_LINE_CHARS);
                let longest = lines
                    .iter()
                    .map(|line| line.iter().map(|segment| segment.len).sum::<usize>())
                    .max()
                    .unwrap_or(1)
                    .max(1);
                let w = self.px(20.0) * longest as u32 + pad_x * 2;
                let h = self.px(46.0) * lines.len().max(1) as u32 + pad_y * 2;
                (w, h, lines)
            }
            BubbleContent::Dots => (self.px(150.0), self.px(84.0), Vec::new()),
            BubbleContent::Image(_) => (self.px(520.0), self.px(390.0), Vec::new()),
        }
    }

    fn bubble_x(&self, side: Side, w: u32) -> u32 {
        let margin = self.px(36.0);
        match side {
            Side::Incoming => margin,
            Side::Outgoing => self.width.saturating_sub(margin + w),
        }
    }

    fn draw_bubble(&self, canvas: &mut RgbaImage, item: &Placed<'_>, y: u32, radius: u32) {
        let side = item.bubble.side;
        let x = self.bubble_x(side, item.w);
        let (fill, ink) = match side {
            Side::Outgoing => (self.theme.outgoing_bubble, self.theme.outgoing_ink),
            Side::Incoming => (self.theme.incoming_bubble, self.theme.incoming_ink),
        };

        match &item.bubble.content {
            BubbleContent::Text(_) => {
                fill_rounded_rect(canvas, x, y, item.w, item.h, radius, fill);
                let char_w = self.px(20.0);
                let line_h = self.px(46.0);
                let mut line_y = y + self.px(22.0);
                for line in &item.lines {
                    let mut line_x = x + self.px(30.0);
                    for segment in line {
                        let seg_w = char_w * segment.len as u32;
                        if segment.redacted {
                            fill_rounded_rect(
                                canvas,
                                line_x,
                                line_y + self.px(6.0),
                                seg_w,
                                line_h - self.px(12.0),
                                self.px(8.0),
                                self.theme.redaction,
                            );
                        } else {
                            fill_rect(
                                canvas,
                                line_x,
                                line_y + line_h / 2 - self.px(7.0),
                                seg_w,
                                self.px(14.0),
                                ink,
                            );
                        }
                        line_x += seg_w;
                    }
                    line_y += line_h;
                }
            }
            BubbleContent::Dots => {
                fill_rounded_rect(canvas, x, y, item.w, item.h, radius, fill);
                let dot_r = self.px(10.0);
                let cy = y + item.h / 2;
                for index in 0..3 {
                    let cx = x + self.px(43.0) + index * self.px(32.0);
                    fill_circle(canvas, cx, cy, dot_r, ink);
                }
            }
            BubbleContent::Image(path) => {
                fill_rounded_rect(canvas, x, y, item.w, item.h, radius, fill);
                let inset = self.px(8.0);
                let (ix, iy) = (x + inset, y + inset);
                let (iw, ih) = (item.w - inset * 2, item.h - inset * 2);
                match path.as_deref().map(load_rgba) {
                    Some(Ok(source)) => paste_fit(canvas, &source, ix, iy, iw, ih),
                    Some(Err(error)) => {
                        tracing::warn!(error = %format!("{error:#}"), "image bubble unreadable; drawing placeholder");
                        placeholder_tile(canvas, ix, iy, iw, ih, self.theme.placeholder);
                    }
                    None => placeholder_tile(canvas, ix, iy, iw, ih, self.theme.placeholder),
                }
            }
        }
    }

    /// Returns the header's bottom edge.
    fn draw_header(&self, canvas: &mut RgbaImage, header: &HeaderSpec) -> u32 {
        let height = self.px(250.0);
        fill_rect(canvas, 0, 0, self.width, height, self.theme.header_bg);

        let avatar_d = self.px(120.0);
        let ax = (self.width - avatar_d) / 2;
        let ay = self.px(40.0);
        let avatar = header.avatar.as_deref().map(load_rgba);
        match avatar {
            Some(Ok(source)) => {
                let mut tile = RgbaImage::new(avatar_d, avatar_d);
                paste_fit(&mut tile, &source, 0, 0, avatar_d, avatar_d);
                mask_circle(&mut tile);
                imageops::overlay(canvas, &tile, i64::from(ax), i64::from(ay));
            }
            other => {
                if let Some(Err(error)) = other {
                    tracing::warn!(
                        contact = %header.contact_name,
                        error = %format!("{error:#}"),
                        "avatar unreadable; drawing initial block"
                    );
                }
                fill_circle(
                    canvas,
                    ax + avatar_d / 2,
                    ay + avatar_d / 2,
                    avatar_d / 2,
                    self.theme.placeholder,
                );
                let initial = self.px(44.0);
                fill_rounded_rect(
                    canvas,
                    ax + (avatar_d - initial) / 2,
                    ay + (avatar_d - initial) / 2,
                    initial,
                    initial,
                    self.px(6.0),
                    self.theme.header_ink,
                );
            }
        }

        let name_chars = header.contact_name.chars().count().clamp(1, 24) as u32;
        let name_w = self.px(18.0) * name_chars;
        fill_rect(
            canvas,
            (self.width.saturating_sub(name_w)) / 2,
            ay + avatar_d + self.px(28.0),
            name_w,
            self.px(18.0),
            self.theme.header_ink,
        );

        if let Some(unread) = header.unread_count.filter(|count| *count > 0) {
            let digits = unread.to_string().len() as u32;
            let badge_h = self.px(56.0);
            let badge_w = badge_h + self.px(20.0) * digits.saturating_sub(1);
            fill_rounded_rect(
                canvas,
                self.px(96.0),
                ay + (avatar_d - badge_h) / 2,
                badge_w,
                badge_h,
                badge_h / 2,
                self.theme.badge,
            );
        }
        height
    }
}

impl FrameRenderer for SchematicRenderer {
    fn render(&self, request: &FrameRequest<'_>) -> Result<RenderedFrame> {
        let canvas = self.compose(request);
        canvas
            .save_with_format(request.output, image::ImageFormat::Png)
            .with_context(|| format!("failed to write frame {}", request.output.display()))?;
        Ok(RenderedFrame {
            path: request.output.to_path_buf(),
            width: self.width,
            height: self.height,
        })
    }
}

pub(crate) fn load_rgba(path: &Path) -> Result<RgbaImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to decode image {}", path.display()))?
        .to_rgba8())
}

fn mask_circle(tile: &mut RgbaImage) {
    let r = tile.width().min(tile.height()) as f32 / 2.0;
    for (x, y, pixel) in tile.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - r;
        let dy = y as f32 + 0.5 - r;
        if dx * dx + dy * dy > r * r {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }
}

/// Greedy word wrap over display text with `{...}` spans flagged as redacted.
fn layout_lines(display: &str, max_chars: usize) -> Vec<Vec<Segment>> {
    let mut glyphs = Vec::new();
    let mut depth = 0_usize;
    for ch in display.chars() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            _ => glyphs.push((ch, depth > 0)),
        }
    }

    let mut lines: Vec<Vec<(char, bool)>> = Vec::new();
    let mut current: Vec<(char, bool)> = Vec::new();
    for word in glyphs
        .split(|(ch, _)| ch.is_whitespace())
        .filter(|word| !word.is_empty())
    {
        for chunk in word.chunks(max_chars.max(1)) {
            if !current.is_empty() && current.len() + 1 + chunk.len() > max_chars {
                lines.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push((' ', false));
            }
            current.extend_from_slice(chunk);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }

    lines
        .into_iter()
        .map(|line| {
            let mut segments: Vec<Segment> = Vec::new();
            for (_, redacted) in line {
                match segments.last_mut() {
                    Some(last) if last.redacted == redacted => last.len += 1,
                    _ => segments.push(Segment { len: 1, redacted }),
                }
            }
            segments
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::resolve_theme;
    use std::path::PathBuf;

    fn renderer() -> SchematicRenderer {
        SchematicRenderer::new(resolve_theme("light").unwrap(), 540, 960)
    }

    #[test]
    fn wraps_long_text_and_marks_redactions() {
        let lines = layout_lines("my pin is {1234} ok", 28);
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            vec![
                Segment { len: 10, redacted: false },
                Segment { len: 4, redacted: true },
                Segment { len: 3, redacted: false },
            ]
        );

        let long = "word ".repeat(20);
        let wrapped = layout_lines(&long, 28);
        assert!(wrapped.len() > 1);
        assert!(wrapped
            .iter()
            .all(|line| line.iter().map(|s| s.len).sum::<usize>() <= 28));
    }

    #[test]
    fn outgoing_bubbles_sit_on_the_right() {
        let renderer = renderer();
        let bubbles = [
            BubbleSpec {
                side: Side::Outgoing,
                content: BubbleContent::Text("hey".into()),
            },
            BubbleSpec {
                side: Side::Incoming,
                content: BubbleContent::Image(Some(PathBuf::from("/nonexistent.png"))),
            },
        ];
        let output = PathBuf::from("unused.png");
        let canvas = renderer.compose(&FrameRequest {
            header: None,
            bubbles: &bubbles,
            corner_radius: None,
            output: &output,
        });
        assert_eq!(canvas.dimensions(), (540, 960));
        let theme = renderer.theme();
        let (w, h, _) = renderer.measure(&bubbles[0]);
        let x = renderer.bubble_x(Side::Outgoing, w);
        assert!(x > 540 / 2);
        let probe = canvas.get_pixel(x + w / 2, renderer.px(110.0) + h - 4);
        assert_eq!(probe.0, theme.outgoing_bubble);
    }

    #[test]
    fn render_writes_png_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("frame.png");
        let header = HeaderSpec {
            contact_name: "Bob".into(),
            avatar: None,
            unread_count: Some(3),
        };
        let frame = renderer()
            .render(&FrameRequest {
                header: Some(&header),
                bubbles: &[BubbleSpec {
                    side: Side::Incoming,
                    content: BubbleContent::Dots,
                }],
                corner_radius: Some(24.0),
                output: &output,
            })
            .unwrap();
        assert_eq!((frame.width, frame.height), (540, 960));
        let decoded = image::open(&frame.path).unwrap();
        assert_eq!(decoded.width(), 540);
    }
}
