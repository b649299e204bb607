use image::{imageops, Rgba, RgbaImage};

pub(crate) type Color = [u8; 4];

pub(crate) fn lerp_u8(a: u8, b: u8, t: f32) -> u8 {
    let a = a as f32;
    let b = b as f32;
    (a + (b - a) * t.clamp(0.0, 1.0)).round() as u8
}

pub(crate) fn vertical_gradient(canvas: &mut RgbaImage, top: Color, bottom: Color) {
    let height = canvas.height().max(1);
    for y in 0..canvas.height() {
        let t = y as f32 / height as f32;
        let color = [
            lerp_u8(top[0], bottom[0], t),
            lerp_u8(top[1], bottom[1], t),
            lerp_u8(top[2], bottom[2], t),
            255,
        ];
        for x in 0..canvas.width() {
            canvas.put_pixel(x, y, Rgba(color));
        }
    }
}

pub(crate) fn blend_pixel(canvas: &mut RgbaImage, x: u32, y: u32, src: Color) {
    let alpha = u16::from(src[3]);
    if alpha == 0 || x >= canvas.width() || y >= canvas.height() {
        return;
    }
    let inv_alpha = 255_u16.saturating_sub(alpha);
    let dst = canvas.get_pixel_mut(x, y);
    for channel in 0..3 {
        let d = u16::from(dst.0[channel]);
        let s = u16::from(src[channel]);
        dst.0[channel] = ((s * alpha + d * inv_alpha + 127) / 255) as u8;
    }
    dst.0[3] = 255;
}

pub(crate) fn fill_rect(canvas: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Color) {
    let x1 = x.saturating_add(w).min(canvas.width());
    let y1 = y.saturating_add(h).min(canvas.height());
    for yy in y.min(y1)..y1 {
        for xx in x.min(x1)..x1 {
            blend_pixel(canvas, xx, yy, color);
        }
    }
}

/// Fills a rectangle whose corners are cut to `radius`.
pub(crate) fn fill_rounded_rect(
    canvas: &mut RgbaImage,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    radius: u32,
    color: Color,
) {
    let radius = radius.min(w / 2).min(h / 2);
    if radius == 0 {
        fill_rect(canvas, x, y, w, h, color);
        return;
    }
    let r = radius as f32;
    for dy in 0..h {
        for dx in 0..w {
            let cx = if dx < radius {
                Some(r - dx as f32 - 0.5)
            } else if dx >= w - radius {
                Some(dx as f32 + 0.5 - (w - radius) as f32)
            } else {
                None
            };
            let cy = if dy < radius {
                Some(r - dy as f32 - 0.5)
            } else if dy >= h - radius {
                Some(dy as f32 + 0.5 - (h - radius) as f32)
            } else {
                None
            };
            if let (Some(cx), Some(cy)) = (cx, cy) {
                if cx * cx + cy * cy > r * r {
                    continue;
                }
            }
            blend_pixel(canvas, x + dx, y + dy, color);
        }
    }
}

pub(crate) fn fill_circle(canvas: &mut RgbaImage, cx: u32, cy: u32, radius: u32, color: Color) {
    fill_rounded_rect(
        canvas,
        cx.saturating_sub(radius),
        cy.saturating_sub(radius),
        radius * 2,
        radius * 2,
        radius,
        color,
    );
}

/// Grey tile with a diagonal cross, used wherever an asset failed to load.
pub(crate) fn placeholder_tile(canvas: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Color) {
    fill_rect(canvas, x, y, w, h, color);
    let mark = [color[0] / 2, color[1] / 2, color[2] / 2, 255];
    let steps = w.max(h);
    for step in 0..steps {
        let px = x + step * w / steps.max(1);
        let py = y + step * h / steps.max(1);
        fill_rect(canvas, px, py, 3, 3, mark);
        fill_rect(canvas, px, (y + h).saturating_sub(py - y + 3), 3, 3, mark);
    }
}

/// Pastes `source` scaled to fit inside `w`x`h`, centered.
pub(crate) fn paste_fit(canvas: &mut RgbaImage, source: &RgbaImage, x: u32, y: u32, w: u32, h: u32) {
    if source.width() == 0 || source.height() == 0 || w == 0 || h == 0 {
        return;
    }
    let scale = (w as f32 / source.width() as f32).min(h as f32 / source.height() as f32);
    let sw = ((source.width() as f32 * scale).round() as u32).max(1);
    let sh = ((source.height() as f32 * scale).round() as u32).max(1);
    let scaled = imageops::resize(source, sw, sh, imageops::FilterType::Triangle);
    let ox = x + (w - sw.min(w)) / 2;
    let oy = y + (h - sh.min(h)) / 2;
    imageops::overlay(canvas, &scaled, i64::from(ox), i64::from(oy));
}

/// Darkens the whole canvas by blending `color` over every pixel.
pub(crate) fn dim(canvas: &mut RgbaImage, color: Color) {
    let (w, h) = canvas.dimensions();
    fill_rect(canvas, 0, 0, w, h, color);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounded_rect_leaves_corners_untouched() {
        let mut canvas = RgbaImage::from_pixel(40, 40, Rgba([0, 0, 0, 255]));
        fill_rounded_rect(&mut canvas, 0, 0, 40, 40, 12, [255, 255, 255, 255]);
        assert_eq!(canvas.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(20, 20).0, [255, 255, 255, 255]);
        assert_eq!(canvas.get_pixel(20, 0).0, [255, 255, 255, 255]);
    }

    #[test]
    fn fill_rect_clips_to_canvas() {
        let mut canvas = RgbaImage::new(10, 10);
        fill_rect(&mut canvas, 8, 8, 50, 50, [10, 20, 30, 255]);
        assert_eq!(canvas.get_pixel(9, 9).0, [10, 20, 30, 255]);
        assert_eq!(canvas.get_pixel(7, 7).0, [0, 0, 0, 0]);
    }

    #[test]
    fn paste_fit_centers_source() {
        let mut canvas = RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 255]));
        let source = RgbaImage::from_pixel(10, 5, Rgba([255, 0, 0, 255]));
        paste_fit(&mut canvas, &source, 0, 0, 100, 100);
        assert_eq!(canvas.get_pixel(50, 50).0, [255, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(50, 5).0, [0, 0, 0, 255]);
    }
}
