//! Mosaic geometry and tile assembly.
//!
//! A mosaic is the ordered concatenation of a sequence's frames along one
//! axis. Vertical orientation stacks frames as captured; horizontal rotates
//! each frame 90 degrees clockwise and stacks along the width. Level-L tiles
//! cover `tile_size * 2^L` mosaic pixels per axis and are downsampled by
//! `2^L` so every emitted tile is `tile_size` square (edge tiles excepted).

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImage, ImageFormat, RgbImage};

use crate::error::{TileError, TileResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    Vertical,
    Horizontal,
}

impl Orientation {
    pub fn parse(value: &str) -> TileResult<Self> {
        match value {
            "vertical" => Ok(Self::Vertical),
            "horizontal" => Ok(Self::Horizontal),
            other => Err(TileError::BadRequest(format!(
                "unknown orientation: {other}"
            ))),
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vertical => write!(f, "vertical"),
            Self::Horizontal => write!(f, "horizontal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn parse(value: &str) -> TileResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            other => Err(TileError::BadRequest(format!("unknown format: {other}"))),
        }
    }
}

/// Axis-aligned pixel rectangle in mosaic coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Geometry of one sequence's mosaic for a given orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MosaicLayout {
    /// Width and height of one frame after orientation is applied.
    pub stripe_width: u32,
    pub stripe_height: u32,
    pub frame_count: u32,
    pub orientation: Orientation,
}

impl MosaicLayout {
    pub fn new(
        frame_width: u32,
        frame_height: u32,
        frame_count: u32,
        orientation: Orientation,
    ) -> Self {
        let (stripe_width, stripe_height) = match orientation {
            Orientation::Vertical => (frame_width, frame_height),
            Orientation::Horizontal => (frame_height, frame_width),
        };
        Self {
            stripe_width,
            stripe_height,
            frame_count,
            orientation,
        }
    }

    /// Full mosaic extent in pixels.
    pub fn mosaic_size(&self) -> (u32, u32) {
        match self.orientation {
            Orientation::Vertical => (self.stripe_width, self.stripe_height * self.frame_count),
            Orientation::Horizontal => (self.stripe_width * self.frame_count, self.stripe_height),
        }
    }

    /// Tile grid dimensions (columns, rows) at `level`.
    pub fn tile_grid(&self, tile_size: u32, level: u32) -> (u32, u32) {
        let (mosaic_w, mosaic_h) = self.mosaic_size();
        let span = tile_span(tile_size, level);
        (mosaic_w.div_ceil(span), mosaic_h.div_ceil(span))
    }

    /// Source rectangle in mosaic coordinates covered by tile (x, y) at
    /// `level`, clipped to the mosaic extent. Absent when the tile origin
    /// lies entirely beyond the mosaic.
    pub fn tile_rect(&self, tile_size: u32, level: u32, tile_x: u32, tile_y: u32) -> Option<Rect> {
        let (mosaic_w, mosaic_h) = self.mosaic_size();
        let span = tile_span(tile_size, level) as u64;
        let x = tile_x as u64 * span;
        let y = tile_y as u64 * span;
        if x >= mosaic_w as u64 || y >= mosaic_h as u64 {
            return None;
        }
        let width = span.min(mosaic_w as u64 - x);
        let height = span.min(mosaic_h as u64 - y);
        Some(Rect {
            x: x as u32,
            y: y as u32,
            width: width as u32,
            height: height as u32,
        })
    }

    /// Inclusive range of frame indices overlapping `rect` along the
    /// stacking axis.
    pub fn frame_range(&self, rect: Rect) -> (u32, u32) {
        let (start, end, stripe) = match self.orientation {
            Orientation::Vertical => (rect.y, rect.y + rect.height - 1, self.stripe_height),
            Orientation::Horizontal => (rect.x, rect.x + rect.width - 1, self.stripe_width),
        };
        let first = start / stripe;
        let last = (end / stripe).min(self.frame_count - 1);
        (first, last)
    }

    /// Offset of frame `index` along the stacking axis, in mosaic pixels.
    fn frame_offset(&self, index: u32) -> u32 {
        match self.orientation {
            Orientation::Vertical => index * self.stripe_height,
            Orientation::Horizontal => index * self.stripe_width,
        }
    }
}

fn tile_span(tile_size: u32, level: u32) -> u32 {
    tile_size << level
}

/// Deepest useful pyramid level for the given frame geometry.
pub fn max_level(frame_width: u32, frame_height: u32) -> u32 {
    if frame_width == 0 || frame_height == 0 {
        return 0;
    }
    let ratio = frame_width as f64 / frame_height as f64;
    if ratio <= 1.0 {
        return 0;
    }
    ratio.log2().ceil() as u32
}

/// Assemble one tile: paste the overlapping parts of each contributing frame
/// into the clipped source rectangle, then downsample by `2^level`.
///
/// `fetch` loads a decoded frame by index; the result already has the
/// layout's orientation applied by the caller or is rotated here when the
/// layout is horizontal.
pub fn assemble_tile<F>(
    layout: &MosaicLayout,
    rect: Rect,
    level: u32,
    fetch: F,
) -> TileResult<RgbImage>
where
    F: Fn(u32) -> TileResult<Arc<DynamicImage>>,
{
    let mut canvas = RgbImage::new(rect.width, rect.height);
    let (first, last) = layout.frame_range(rect);
    for index in first..=last {
        let frame = fetch(index)?;
        let frame = match layout.orientation {
            Orientation::Vertical => frame.to_rgb8(),
            Orientation::Horizontal => frame.rotate90().to_rgb8(),
        };
        paste_overlap(&mut canvas, rect, &frame, layout, index);
    }
    if level == 0 {
        return Ok(canvas);
    }
    let scale = 1u32 << level;
    let out_w = (rect.width / scale).max(1);
    let out_h = (rect.height / scale).max(1);
    Ok(image::imageops::resize(
        &canvas,
        out_w,
        out_h,
        FilterType::Triangle,
    ))
}

fn paste_overlap(
    canvas: &mut RgbImage,
    rect: Rect,
    frame: &RgbImage,
    layout: &MosaicLayout,
    index: u32,
) {
    let offset = layout.frame_offset(index);
    // Frame bounds in mosaic coordinates.
    let (fx, fy) = match layout.orientation {
        Orientation::Vertical => (0, offset),
        Orientation::Horizontal => (offset, 0),
    };
    let overlap_x0 = rect.x.max(fx);
    let overlap_y0 = rect.y.max(fy);
    let overlap_x1 = (rect.x + rect.width).min(fx + frame.width());
    let overlap_y1 = (rect.y + rect.height).min(fy + frame.height());
    if overlap_x0 >= overlap_x1 || overlap_y0 >= overlap_y1 {
        return;
    }
    let view = image::imageops::crop_imm(
        frame,
        overlap_x0 - fx,
        overlap_y0 - fy,
        overlap_x1 - overlap_x0,
        overlap_y1 - overlap_y0,
    )
    .to_image();
    let _ = canvas.copy_from(&view, overlap_x0 - rect.x, overlap_y0 - rect.y);
}

/// First `count` tile coordinates at `level` in row-major order.
pub fn first_tile_coords(
    layout: &MosaicLayout,
    tile_size: u32,
    level: u32,
    count: usize,
) -> Vec<(u32, u32)> {
    let (cols, rows) = layout.tile_grid(tile_size, level);
    let mut coords = Vec::with_capacity(count.min((cols as usize) * (rows as usize)));
    'outer: for row in 0..rows {
        for col in 0..cols {
            if coords.len() >= count {
                break 'outer;
            }
            coords.push((col, row));
        }
    }
    coords
}

/// Pixel box `[left, top, right, bottom)` used by defect crops. Signed so
/// that expansion can temporarily run past the origin before clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl PixelBox {
    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    pub fn height(&self) -> i64 {
        self.bottom - self.top
    }
}

/// Grow the box by `expand` pixels on every side.
pub fn expand_box(b: PixelBox, expand: u32) -> PixelBox {
    let e = expand as i64;
    PixelBox {
        left: b.left - e,
        top: b.top - e,
        right: b.right + e,
        bottom: b.bottom + e,
    }
}

/// Clamp the box to `[0, width) x [0, height)`, widening degenerate spans to
/// at least one pixel.
pub fn clamp_box(b: PixelBox, width: u32, height: u32) -> PixelBox {
    let w = width as i64;
    let h = height as i64;
    let mut left = b.left.clamp(0, w.saturating_sub(1));
    let mut top = b.top.clamp(0, h.saturating_sub(1));
    let mut right = b.right.clamp(0, w);
    let mut bottom = b.bottom.clamp(0, h);
    if right <= left {
        right = (left + 1).min(w);
        left = right - 1;
    }
    if bottom <= top {
        bottom = (top + 1).min(h);
        top = bottom - 1;
    }
    PixelBox {
        left,
        top,
        right,
        bottom,
    }
}

/// Aspect-preserving resize. When both target dimensions are given the image
/// is fit within them; a single dimension scales the other proportionally.
pub fn resize_to(img: &RgbImage, width: Option<u32>, height: Option<u32>) -> RgbImage {
    let (w, h) = (img.width(), img.height());
    let (target_w, target_h) = match (width, height) {
        (None, None) => return img.clone(),
        (Some(tw), None) => (tw.max(1), ((tw as u64 * h as u64) / w as u64).max(1) as u32),
        (None, Some(th)) => (((th as u64 * w as u64) / h as u64).max(1) as u32, th.max(1)),
        (Some(tw), Some(th)) => {
            let scale = (tw as f64 / w as f64).min(th as f64 / h as f64);
            (
                ((w as f64 * scale).round() as u32).max(1),
                ((h as f64 * scale).round() as u32).max(1),
            )
        }
    };
    if (target_w, target_h) == (w, h) {
        return img.clone();
    }
    image::imageops::resize(img, target_w, target_h, FilterType::Lanczos3)
}

/// Encode to the requested container. JPEG quality is fixed so repeated
/// encodes of the same pixels are byte-identical.
pub fn encode_image(img: &RgbImage, format: OutputFormat) -> TileResult<Bytes> {
    let mut out = std::io::Cursor::new(Vec::new());
    match format {
        OutputFormat::Jpeg => {
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90);
            encoder
                .encode_image(img)
                .map_err(|e| TileError::Encode(e.to_string()))?;
        }
        OutputFormat::Png => {
            img.write_to(&mut out, ImageFormat::Png)
                .map_err(|e| TileError::Encode(e.to_string()))?;
        }
    }
    Ok(Bytes::from(out.into_inner()))
}

/// Decode raw frame bytes.
pub fn decode_image(payload: &[u8]) -> TileResult<DynamicImage> {
    image::load_from_memory(payload).map_err(|e| TileError::Decode(e.to_string()))
}
