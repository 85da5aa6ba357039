use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};
use thiserror::Error;

use super::color::OPAQUE_WHITE;

pub const BACKGROUND_FIT_MARGIN: u32 = 20;

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("failed to decode subject image: {0}")]
    DecodeSubject(#[source] image::ImageError),
    #[error("failed to open background '{path}': {source}")]
    OpenBackground {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to encode PNG: {0}")]
    EncodePng(#[source] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

/// Size and offset of a subject pasted over a background of `background`
/// dimensions. Subjects exceeding the margin-reduced box are shrunk with
/// their aspect ratio kept, then centered with integer division.
pub fn plan_placement(subject: (u32, u32), background: (u32, u32)) -> Placement {
    let (bg_w, bg_h) = background;
    let box_w = bg_w.saturating_sub(BACKGROUND_FIT_MARGIN).max(1);
    let box_h = bg_h.saturating_sub(BACKGROUND_FIT_MARGIN).max(1);
    let (width, height) = fit_within(subject, (box_w, box_h));
    Placement {
        width,
        height,
        x: bg_w.saturating_sub(width) / 2,
        y: bg_h.saturating_sub(height) / 2,
    }
}

fn fit_within(size: (u32, u32), bounds: (u32, u32)) -> (u32, u32) {
    let (w, h) = (size.0.max(1), size.1.max(1));
    let (max_w, max_h) = bounds;
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let ratio = (f64::from(max_w) / f64::from(w)).min(f64::from(max_h) / f64::from(h));
    let scaled_w = ((f64::from(w) * ratio).round() as u32).clamp(1, max_w);
    let scaled_h = ((f64::from(h) * ratio).round() as u32).clamp(1, max_h);
    (scaled_w, scaled_h)
}

/// Places the subject onto the background image when one is given, else onto
/// a subject-sized canvas filled with `background_color` (white by default).
pub fn composite(
    subject_bytes: &[u8],
    background_path: Option<&Path>,
    background_color: Option<Rgba<u8>>,
) -> Result<RgbaImage, CompositeError> {
    let subject = image::load_from_memory(subject_bytes)
        .map_err(CompositeError::DecodeSubject)?
        .to_rgba8();

    if let Some(path) = background_path {
        let mut background = image::open(path)
            .map_err(|source| CompositeError::OpenBackground {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgba8();
        let placement = plan_placement(subject.dimensions(), background.dimensions());
        let subject = if (placement.width, placement.height) == subject.dimensions() {
            subject
        } else {
            imageops::resize(
                &subject,
                placement.width,
                placement.height,
                FilterType::Lanczos3,
            )
        };
        paste_with_alpha_mask(&mut background, &subject, placement.x, placement.y);
        return Ok(background);
    }

    let (width, height) = subject.dimensions();
    let mut canvas = RgbaImage::from_pixel(width, height, background_color.unwrap_or(OPAQUE_WHITE));
    paste_with_alpha_mask(&mut canvas, &subject, 0, 0);
    Ok(canvas)
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, CompositeError> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(CompositeError::EncodePng)?;
    Ok(out.into_inner())
}

// Every channel, alpha included, is interpolated by the subject's alpha.
fn paste_with_alpha_mask(dst: &mut RgbaImage, src: &RgbaImage, x: u32, y: u32) {
    let (dst_w, dst_h) = dst.dimensions();
    for (sx, sy, src_px) in src.enumerate_pixels() {
        let (dx, dy) = (x + sx, y + sy);
        if dx >= dst_w || dy >= dst_h {
            continue;
        }
        let mask = u32::from(src_px[3]);
        if mask == 0 {
            continue;
        }
        let dst_px = dst.get_pixel_mut(dx, dy);
        for channel in 0..4 {
            let s = u32::from(src_px[channel]);
            let d = u32::from(dst_px[channel]);
            dst_px[channel] = ((s * mask + d * (255 - mask) + 127) / 255) as u8;
        }
    }
}
