//! Flattens a user-painted highlight layer onto the source image.
//!
//! The source raster is never drawn on. Strokes live on a separate
//! [`HighlightLayer`]; erasing clears that layer only, and the two are merged
//! once, when the user confirms the selection.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::models::job::ImagePayload;
use crate::services::validation::writable_format;

pub const MIN_BRUSH_SIZE: f32 = 5.0;
pub const MAX_BRUSH_SIZE: f32 = 100.0;

/// Semi-transparent red used when no color is configured.
pub const DEFAULT_HIGHLIGHT: Rgba<u8> = Rgba([255, 0, 0, 204]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrushMode {
    Draw,
    Erase,
}

/// A polyline painted with a round brush, in source pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub mode: BrushMode,
    pub width: f32,
    pub points: Vec<(f32, f32)>,
}

#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    #[error("overlay is {overlay:?} but source is {source_dims:?}")]
    DimensionMismatch {
        source_dims: (u32, u32),
        overlay: (u32, u32),
    },

    #[error("failed to decode source image: {0}")]
    Decode(image::ImageError),

    #[error("failed to encode guide image: {0}")]
    Encode(image::ImageError),
}

/// Transparent raster holding only the user's highlight strokes.
#[derive(Debug, Clone)]
pub struct HighlightLayer {
    pixels: RgbaImage,
    color: Rgba<u8>,
}

impl HighlightLayer {
    pub fn new(width: u32, height: u32, color: Rgba<u8>) -> Self {
        Self {
            pixels: RgbaImage::new(width, height),
            color,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn is_blank(&self) -> bool {
        self.pixels.pixels().all(|p| p[3] == 0)
    }

    pub fn clear(&mut self) {
        self.pixels.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
    }

    /// Render one stroke with round caps and joins.
    ///
    /// A pixel is covered when its centre lies within half the brush width of
    /// any segment. Each covered pixel is touched once per stroke.
    pub fn paint(&mut self, stroke: &Stroke) {
        let Some(&first) = stroke.points.first() else {
            return;
        };
        let radius = stroke.width.clamp(MIN_BRUSH_SIZE, MAX_BRUSH_SIZE) / 2.0;
        let (width, height) = self.pixels.dimensions();

        let segments: Vec<((f32, f32), (f32, f32))> = if stroke.points.len() == 1 {
            vec![(first, first)]
        } else {
            stroke.points.windows(2).map(|w| (w[0], w[1])).collect()
        };

        let (min_x, min_y, max_x, max_y) = stroke.points.iter().fold(
            (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
            |(x0, y0, x1, y1), &(x, y)| (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        );
        let x_range = pixel_span(min_x - radius, max_x + radius, width);
        let y_range = pixel_span(min_y - radius, max_y + radius, height);

        for y in y_range {
            for x in x_range.clone() {
                let centre = (x as f32 + 0.5, y as f32 + 0.5);
                let covered = segments
                    .iter()
                    .any(|&(a, b)| distance_to_segment(centre, a, b) <= radius);
                if !covered {
                    continue;
                }
                let px = self.pixels.get_pixel_mut(x, y);
                *px = match stroke.mode {
                    BrushMode::Draw => source_over(self.color, *px),
                    BrushMode::Erase => Rgba([0, 0, 0, 0]),
                };
            }
        }
    }
}

/// Merge `layer` over the decoded source and encode the guide image.
///
/// PNG and JPEG sources keep their format; anything else is written as PNG.
pub fn composite(
    source: &ImagePayload,
    layer: &HighlightLayer,
) -> Result<ImagePayload, CompositeError> {
    let decoded = image::load_from_memory(&source.bytes).map_err(CompositeError::Decode)?;
    let flattened = flatten(&decoded.to_rgba8(), layer)?;

    let format = writable_format(&source.mime_type).unwrap_or(ImageFormat::Png);
    let mut out = Cursor::new(Vec::new());
    match format {
        // JPEG has no alpha channel.
        ImageFormat::Jpeg => DynamicImage::ImageRgba8(flattened)
            .to_rgb8()
            .write_to(&mut out, format),
        _ => flattened.write_to(&mut out, format),
    }
    .map_err(CompositeError::Encode)?;

    Ok(ImagePayload::new(out.into_inner(), format.to_mime_type()))
}

/// Source-over composite of `layer` onto a copy of `base`.
pub fn flatten(base: &RgbaImage, layer: &HighlightLayer) -> Result<RgbaImage, CompositeError> {
    if base.dimensions() != layer.dimensions() {
        return Err(CompositeError::DimensionMismatch {
            source_dims: base.dimensions(),
            overlay: layer.dimensions(),
        });
    }

    let mut merged = base.clone();
    for (dst, src) in merged.pixels_mut().zip(layer.pixels().pixels()) {
        *dst = source_over(*src, *dst);
    }
    Ok(merged)
}

/// Standard non-premultiplied "source-over" blend.
fn source_over(src: Rgba<u8>, dst: Rgba<u8>) -> Rgba<u8> {
    let sa = f32::from(src[3]) / 255.0;
    if sa <= 0.0 {
        return dst;
    }
    let da = f32::from(dst[3]) / 255.0;
    let out_a = sa + da * (1.0 - sa);

    let mut out = [0u8; 4];
    for ch in 0..3 {
        let value = (f32::from(src[ch]) * sa + f32::from(dst[ch]) * da * (1.0 - sa)) / out_a;
        out[ch] = to_channel(value);
    }
    out[3] = to_channel(out_a * 255.0);
    Rgba(out)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn pixel_span(lo: f32, hi: f32, limit: u32) -> std::ops::Range<u32> {
    let start = lo.floor().max(0.0) as u32;
    let end = (hi.ceil().max(0.0) as u32).min(limit);
    start.min(end)..end
}

fn distance_to_segment(p: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a.0 + t * dx, a.1 + t * dy);
    ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt()
}
