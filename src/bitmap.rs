//! Image staging: converts raw pixel buffers into the canonical RGB layout
//! the vision encoder consumes, and holds them until the next turn is
//! tokenized.
//!
//! Staging does no resizing or cropping; file decoding lives in
//! [`crate::images`].

use std::collections::VecDeque;

use thiserror::Error;

/// Channel order of a source pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb,
    Bgr,
    Rgba,
    Bgra,
    Argb,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Rgb | PixelLayout::Bgr => 3,
            PixelLayout::Rgba | PixelLayout::Bgra | PixelLayout::Argb => 4,
        }
    }

    /// Byte offsets of (r, g, b) within one source pixel.
    fn rgb_offsets(self) -> [usize; 3] {
        match self {
            PixelLayout::Rgb | PixelLayout::Rgba => [0, 1, 2],
            PixelLayout::Bgr | PixelLayout::Bgra => [2, 1, 0],
            PixelLayout::Argb => [1, 2, 3],
        }
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(
        "pixel buffer length {actual} does not match {width}x{height} {layout:?} ({expected} bytes)"
    )]
    LengthMismatch {
        width: u32,
        height: u32,
        layout: PixelLayout,
        expected: usize,
        actual: usize,
    },
    #[error("zero-sized bitmap ({width}x{height})")]
    EmptyBitmap { width: u32, height: u32 },
}

/// An owned RGB8 image, row-major, 3 bytes per pixel, no padding.
///
/// Ownership transfers to the [`PendingImageQueue`] on submission; the
/// tokenizer consumes the bytes during the next turn.
#[derive(Debug, Clone)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Bitmap {
    /// Wrap an already-canonical RGB8 buffer, checking its length.
    pub fn from_rgb8(width: u32, height: u32, data: Vec<u8>) -> Result<Self, StageError> {
        if width == 0 || height == 0 {
            return Err(StageError::EmptyBitmap { width, height });
        }
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(StageError::LengthMismatch {
                width,
                height,
                layout: PixelLayout::Rgb,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }
}

/// Remap a raw pixel buffer of the given layout into a canonical RGB bitmap.
///
/// The buffer length must equal `width * height * bytes_per_pixel(layout)`
/// exactly; a mismatch is a caller error and no partial bitmap is produced.
/// Alpha channels are discarded.
pub fn stage_from_buffer(
    raw: &[u8],
    width: u32,
    height: u32,
    layout: PixelLayout,
) -> Result<Bitmap, StageError> {
    if width == 0 || height == 0 {
        return Err(StageError::EmptyBitmap { width, height });
    }
    let bpp = layout.bytes_per_pixel();
    let expected = width as usize * height as usize * bpp;
    if raw.len() != expected {
        return Err(StageError::LengthMismatch {
            width,
            height,
            layout,
            expected,
            actual: raw.len(),
        });
    }

    let [r, g, b] = layout.rgb_offsets();
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    for pixel in raw.chunks_exact(bpp) {
        data.push(pixel[r]);
        data.push(pixel[g]);
        data.push(pixel[b]);
    }

    Ok(Bitmap {
        width,
        height,
        data,
    })
}

/// Insertion-ordered queue of bitmaps awaiting the next turn.
///
/// Images are single-use: [`PendingImageQueue::drain`] empties the queue
/// atomically and is called before tokenization, success or failure, so a
/// failed turn can never replay stale images into the next one.
#[derive(Debug, Default)]
pub struct PendingImageQueue {
    entries: VecDeque<Bitmap>,
}

impl PendingImageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bitmap: Bitmap) {
        self.entries.push_back(bitmap);
    }

    /// Remove and return every queued bitmap, oldest first.
    pub fn drain(&mut self) -> Vec<Bitmap> {
        self.entries.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
