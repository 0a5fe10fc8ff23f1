//! Frame encoder / decoder seams and the zstd reference pair.
//!
//! The hardware video codec lives outside this crate. The engine only
//! needs three things from it:
//!
//! - [`FrameEncoder`]: turn tightly packed pixels into an opaque unit,
//!   possibly returning nothing while the encoder buffers.
//! - [`FrameDecoder`]: turn a unit back into `width * height * bpp` bytes.
//! - [`DecoderFactory`]: build a decoder for a given resolution. A new
//!   decoder is created whenever a peer changes resolution.
//!
//! [`ZstdEncoder`] / [`ZstdDecoder`] compress raw rows losslessly and are
//! good enough for LAN sessions and tests.
//!
//! Segmented frames carry a lot of background. Before encoding, pixels
//! whose alpha is at or below the encoding threshold are zeroed so they
//! compress away; after decoding, pixels whose channels all sit below
//! the decoding threshold are cleared to transparent.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use crate::error::ChatheadError;
use crate::types::{PixelFormat, duration_to_ticks};

// ── EncodedUnit ──────────────────────────────────────────────────

/// One complete output of the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    /// Opaque encoded bytes.
    pub data: Vec<u8>,
    /// Presentation time in 100 ns ticks.
    pub timestamp_ticks: i64,
    /// Frame duration in 100 ns ticks.
    pub duration_ticks: i64,
}

// ── Traits ───────────────────────────────────────────────────────

/// Compresses local frames before they go on the wire.
pub trait FrameEncoder: Send {
    /// Feed one tightly packed frame.
    ///
    /// `Ok(None)` means the encoder accepted the frame but has no
    /// complete unit to hand out yet; that is not an error.
    fn encode(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<EncodedUnit>, ChatheadError>;

    /// Key out background pixels (alpha at or below `threshold`) before
    /// encoding; `None` sends every pixel as captured. Encoders that
    /// cannot key ignore this.
    fn set_alpha_threshold(&mut self, threshold: Option<u8>) {
        let _ = threshold;
    }
}

/// Decodes units from one remote peer at one fixed resolution.
pub trait FrameDecoder: Send {
    /// Decode `unit` into a fresh pixel buffer.
    fn decode(&mut self, unit: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ChatheadError>;
}

/// Builds decoders; shared with the network thread.
pub trait DecoderFactory: Send + Sync {
    fn create(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Box<dyn FrameDecoder>, ChatheadError>;
}

// ── Background keying ────────────────────────────────────────────

/// Keying threshold used in both directions unless configured.
pub const DEFAULT_KEY_THRESHOLD: u8 = 12;

/// An `Option<u8>` threshold readable from any thread.
#[derive(Debug)]
pub(crate) struct ThresholdCell(AtomicU16);

impl ThresholdCell {
    const OFF: u16 = 0x100;

    pub(crate) fn new(threshold: Option<u8>) -> Self {
        Self(AtomicU16::new(threshold.map_or(Self::OFF, u16::from)))
    }

    pub(crate) fn get(&self) -> Option<u8> {
        u8::try_from(self.0.load(Ordering::Relaxed)).ok()
    }

    pub(crate) fn set(&self, threshold: Option<u8>) {
        self.0.store(threshold.map_or(Self::OFF, u16::from), Ordering::Relaxed);
    }
}

/// Zero every 4-byte pixel whose alpha is at most `threshold`.
///
/// Returns the number of pixels keyed out.
pub fn key_out_background(pixels: &mut [u8], threshold: u8) -> usize {
    let mut keyed = 0;
    for px in pixels.chunks_exact_mut(4) {
        if px[3] <= threshold {
            px.fill(0);
            keyed += 1;
        }
    }
    keyed
}

/// Zero every 4-byte pixel whose channels are all below `threshold`,
/// making near-black codec residue fully transparent.
///
/// Returns the number of pixels cleared.
pub fn clear_faint_pixels(pixels: &mut [u8], threshold: u8) -> usize {
    let mut cleared = 0;
    for px in pixels.chunks_exact_mut(4) {
        if px.iter().all(|&c| c < threshold) {
            px.fill(0);
            cleared += 1;
        }
    }
    cleared
}

// ── ZstdEncoder ──────────────────────────────────────────────────

/// Lossless zstd compression of raw pixel rows.
///
/// Expects 4-byte pixels with alpha last when keying is enabled; other
/// layouts are sent unkeyed.
pub struct ZstdEncoder {
    /// 1 = fastest. Real-time video wants the low end.
    compression_level: i32,
    frame_duration: Duration,
    frame_count: u64,
    alpha_threshold: Option<u8>,
    keyed: Vec<u8>,
}

impl ZstdEncoder {
    /// Create an encoder stamping frames at `fps`.
    pub fn new(fps: u32) -> Self {
        Self {
            compression_level: 1,
            frame_duration: Duration::from_secs(1) / fps.max(1),
            frame_count: 0,
            alpha_threshold: None,
            keyed: Vec::new(),
        }
    }

    pub fn with_alpha_threshold(mut self, threshold: Option<u8>) -> Self {
        self.alpha_threshold = threshold;
        self
    }

    pub fn alpha_threshold(&self) -> Option<u8> {
        self.alpha_threshold
    }

    /// Override the zstd level (clamped to `1..=19`).
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level.clamp(1, 19);
        self
    }

    /// Number of units produced so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl Default for ZstdEncoder {
    fn default() -> Self {
        Self::new(30)
    }
}

impl FrameEncoder for ZstdEncoder {
    fn encode(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<EncodedUnit>, ChatheadError> {
        if width == 0 || height == 0 {
            return Err(ChatheadError::InvalidDimensions { width, height });
        }

        let four_byte = pixels.len() == width as usize * height as usize * 4;
        let input = match self.alpha_threshold {
            Some(threshold) if four_byte => {
                self.keyed.clear();
                self.keyed.extend_from_slice(pixels);
                key_out_background(&mut self.keyed, threshold);
                self.keyed.as_slice()
            }
            _ => pixels,
        };

        let data = zstd::encode_all(input, self.compression_level)
            .map_err(|e| ChatheadError::Encoding(format!("zstd encode failed: {e}")))?;

        let duration_ticks = duration_to_ticks(self.frame_duration);
        let timestamp_ticks = duration_ticks.saturating_mul(self.frame_count as i64);
        self.frame_count += 1;

        Ok(Some(EncodedUnit {
            data,
            timestamp_ticks,
            duration_ticks,
        }))
    }

    fn set_alpha_threshold(&mut self, threshold: Option<u8>) {
        self.alpha_threshold = threshold;
    }
}

// ── ZstdDecoder ──────────────────────────────────────────────────

/// Inverse of [`ZstdEncoder`] for one resolution.
pub struct ZstdDecoder {
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl ZstdDecoder {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }
}

impl FrameDecoder for ZstdDecoder {
    fn decode(&mut self, unit: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ChatheadError> {
        if (width, height) != (self.width, self.height) {
            return Err(ChatheadError::Decode(format!(
                "decoder built for {}x{}, got a {width}x{height} unit",
                self.width, self.height
            )));
        }
        // Capacity bounds the output, so a hostile unit cannot inflate
        // past one frame.
        let capacity = self.format.frame_len(width, height);
        zstd::bulk::decompress(unit, capacity)
            .map_err(|e| ChatheadError::Decode(format!("zstd decode failed: {e}")))
    }
}

/// Factory for [`ZstdDecoder`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdDecoderFactory;

impl DecoderFactory for ZstdDecoderFactory {
    fn create(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Box<dyn FrameDecoder>, ChatheadError> {
        Ok(Box::new(ZstdDecoder::new(width, height, format)))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> Vec<u8> {
        (0..w * h * 4).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn zstd_pair_restores_pixels() {
        let pixels = gradient(32, 16);
        let mut enc = ZstdEncoder::new(30);
        let unit = enc.encode(&pixels, 32, 16).unwrap().unwrap();
        assert!(unit.data.len() < pixels.len());

        let mut dec = ZstdDecoderFactory.create(32, 16, PixelFormat::Bgra8).unwrap();
        assert_eq!(dec.decode(&unit.data, 32, 16).unwrap(), pixels);
    }

    #[test]
    fn timestamps_advance_by_frame_duration() {
        let mut enc = ZstdEncoder::new(25);
        let pixels = vec![0u8; 16];
        let a = enc.encode(&pixels, 2, 2).unwrap().unwrap();
        let b = enc.encode(&pixels, 2, 2).unwrap().unwrap();
        assert_eq!(a.timestamp_ticks, 0);
        assert_eq!(a.duration_ticks, 400_000);
        assert_eq!(b.timestamp_ticks, 400_000);
        assert_eq!(enc.frame_count(), 2);
    }

    #[test]
    fn decoder_rejects_other_resolution() {
        let mut dec = ZstdDecoder::new(2, 2, PixelFormat::Bgra8);
        let unit = zstd::encode_all(&[0u8; 16][..], 1).unwrap();
        assert!(matches!(dec.decode(&unit, 4, 4), Err(ChatheadError::Decode(_))));
    }

    #[test]
    fn decoder_bounds_output_to_one_frame() {
        let big = zstd::encode_all(&vec![7u8; 4096][..], 1).unwrap();
        let mut dec = ZstdDecoder::new(2, 2, PixelFormat::Bgra8);
        assert!(dec.decode(&big, 2, 2).is_err());
    }

    #[test]
    fn garbage_unit_is_a_decode_error() {
        let mut dec = ZstdDecoder::new(2, 2, PixelFormat::Bgra8);
        assert!(dec.decode(b"not zstd", 2, 2).is_err());
    }

    #[test]
    fn keying_zeroes_transparent_pixels_only() {
        let mut px = vec![
            9, 9, 9, 0, // transparent
            9, 9, 9, 12, // at the threshold
            9, 9, 9, 13, // just above
            1, 2, 3, 255,
        ];
        assert_eq!(key_out_background(&mut px, 12), 2);
        assert_eq!(px, vec![0, 0, 0, 0, 0, 0, 0, 0, 9, 9, 9, 13, 1, 2, 3, 255]);
    }

    #[test]
    fn faint_pixels_become_transparent() {
        let mut px = vec![
            11, 11, 11, 11, // all below 12
            0, 0, 0, 255, // black but opaque
            3, 30, 3, 3,
        ];
        assert_eq!(clear_faint_pixels(&mut px, 12), 1);
        assert_eq!(px, vec![0, 0, 0, 0, 0, 0, 0, 255, 3, 30, 3, 3]);
        assert_eq!(clear_faint_pixels(&mut px, 0), 0);
    }

    #[test]
    fn keying_encoder_sends_cleared_background() {
        // Left pixel background with leftover colour, right one opaque.
        let pixels = vec![200, 100, 50, 4, 10, 20, 30, 255];
        let mut dec = ZstdDecoder::new(2, 1, PixelFormat::Bgra8);

        let mut enc = ZstdEncoder::default().with_alpha_threshold(Some(DEFAULT_KEY_THRESHOLD));
        let unit = enc.encode(&pixels, 2, 1).unwrap().unwrap();
        assert_eq!(dec.decode(&unit.data, 2, 1).unwrap(), vec![0, 0, 0, 0, 10, 20, 30, 255]);

        // The trait setter turns keying off again.
        FrameEncoder::set_alpha_threshold(&mut enc, None);
        assert_eq!(enc.alpha_threshold(), None);
        let unit = enc.encode(&pixels, 2, 1).unwrap().unwrap();
        assert_eq!(dec.decode(&unit.data, 2, 1).unwrap(), pixels);

        // Three-byte pixels are never keyed.
        enc.set_alpha_threshold(Some(255));
        let rgb = vec![1u8, 2, 3, 4, 5, 6];
        let unit = enc.encode(&rgb, 2, 1).unwrap().unwrap();
        assert_eq!(zstd::decode_all(&unit.data[..]).unwrap(), rgb);
    }

    #[test]
    fn zero_sized_frame_is_rejected() {
        let mut enc = ZstdEncoder::default();
        assert!(matches!(
            enc.encode(&[], 0, 4),
            Err(ChatheadError::InvalidDimensions { width: 0, height: 4 })
        ));
    }
}
