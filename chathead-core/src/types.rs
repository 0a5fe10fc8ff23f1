//! Shared types for the capture/display pipeline.
//!
//! These are **internal** frame representations passed between pipeline
//! stages. They are distinct from [`crate::wire::VideoChunkHeader`],
//! which describes frames as they travel over the network.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ChatheadError;

/// Media clock units: 100 ns ticks, ten million per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Convert a duration into media ticks, saturating at `i64::MAX`.
pub fn duration_to_ticks(d: Duration) -> i64 {
    i64::try_from(d.as_nanos() / 100).unwrap_or(i64::MAX)
}

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for captured and decoded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha. Segmented camera
    /// images arrive in this layout.
    #[default]
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }

    /// Whether the fourth byte of every pixel is alpha.
    pub const fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Bgra8 | PixelFormat::Rgba8)
    }

    /// Size in bytes of a tightly packed `width` x `height` image.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

// ── Resolution ───────────────────────────────────────────────────

/// A capture resolution offered by a source.
///
/// Ordering is by width, then height, matching how resolution pickers
/// list them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pack into a single `u64` (`width << 32 | height`).
    pub(crate) const fn pack(self) -> u64 {
        ((self.width as u64) << 32) | self.height as u64
    }

    /// Inverse of [`pack`](Self::pack).
    pub(crate) const fn unpack(v: u64) -> Self {
        Self {
            width: (v >> 32) as u32,
            height: v as u32,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── CapturedFrame ────────────────────────────────────────────────

/// A raw, uncompressed frame obtained from the capture source.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may be larger than `width * bytes_per_pixel` when the
/// device pads rows.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes** (may exceed `width * bpp`).
    pub stride: usize,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data, at least `stride * (height - 1) + width * bpp` bytes.
    pub data: Vec<u8>,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
}

impl CapturedFrame {
    /// Build a tightly packed frame (`stride == width * bpp`).
    pub fn packed(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            stride: width as usize * format.bytes_per_pixel(),
            format,
            data,
            timestamp: Instant::now(),
        }
    }

    /// Bytes in one row of visible pixels (no padding).
    pub fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Whether rows carry padding beyond the visible pixels.
    pub fn is_padded(&self) -> bool {
        self.stride != self.row_len()
    }

    /// Check that `data` holds every visible row at `stride`.
    pub fn check_layout(&self) -> Result<(), ChatheadError> {
        let rows = self.height as usize;
        let row_len = self.row_len();
        if rows == 0 || row_len == 0 {
            return Err(ChatheadError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.stride < row_len {
            return Err(ChatheadError::InvalidHeader("row stride shorter than row"));
        }
        let needed = self.stride * (rows - 1) + row_len;
        if self.data.len() < needed {
            return Err(ChatheadError::FrameSizeMismatch {
                expected: needed,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Returns a row slice without the padding bytes.
    ///
    /// # Panics
    ///
    /// Panics if `y` is out of bounds.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.row_len()]
    }

    /// Copy the visible pixels into `out` as tightly packed rows.
    pub fn pack_into(&self, out: &mut Vec<u8>) -> Result<(), ChatheadError> {
        out.clear();
        out.resize(self.row_len() * self.height as usize, 0);
        copy_rows(out, self.row_len(), &self.data, self.stride, self.row_len(), self.height)
    }
}

/// Copy `rows` rows of `row_len` bytes from `src` (pitch `src_stride`)
/// into `dst` (pitch `dst_stride`).
///
/// Falls back to a single `memcpy` when both pitches equal `row_len`.
pub fn copy_rows(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    row_len: usize,
    rows: u32,
) -> Result<(), ChatheadError> {
    let rows = rows as usize;
    if rows == 0 || row_len == 0 {
        return Ok(());
    }
    if src_stride < row_len || dst_stride < row_len {
        return Err(ChatheadError::InvalidHeader("row stride shorter than row"));
    }

    let src_needed = src_stride * (rows - 1) + row_len;
    let dst_needed = dst_stride * (rows - 1) + row_len;
    if src.len() < src_needed {
        return Err(ChatheadError::FrameSizeMismatch {
            expected: src_needed,
            actual: src.len(),
        });
    }
    if dst.len() < dst_needed {
        return Err(ChatheadError::FrameSizeMismatch {
            expected: dst_needed,
            actual: dst.len(),
        });
    }

    if src_stride == row_len && dst_stride == row_len {
        let n = row_len * rows;
        dst[..n].copy_from_slice(&src[..n]);
        return Ok(());
    }

    for y in 0..rows {
        let s = y * src_stride;
        let d = y * dst_stride;
        dst[d..d + row_len].copy_from_slice(&src[s..s + row_len]);
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
