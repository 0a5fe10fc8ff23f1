//! Synthetic camera for headless runs and tests.
//!
//! Produces a moving gradient paced to a frame rate, optionally with
//! padded rows (like real devices) and a swaying elliptical alpha mask
//! standing in for background segmentation. Like a real segmenter, the
//! mask can be reused for a few frames to save work.

use std::time::{Duration, Instant};

use super::CaptureSource;
use crate::error::CaptureError;
use crate::types::{CapturedFrame, PixelFormat, Resolution};

/// Resolutions every synthetic camera offers.
pub const SYNTHETIC_RESOLUTIONS: [Resolution; 3] = [
    Resolution::new(320, 240),
    Resolution::new(640, 480),
    Resolution::new(1280, 720),
];

pub struct SyntheticSource {
    resolution: Resolution,
    format: PixelFormat,
    /// 0 disables pacing.
    fps: u32,
    row_padding: usize,
    segmentation: bool,
    /// Frames a mask is reused for after it is computed.
    frame_skip: u32,
    /// Foreground flags of the current mask, row-major.
    mask: Vec<bool>,
    mask_resolution: Resolution,
    mask_age: u32,
    masks_computed: u64,
    frame_index: u64,
    frame_limit: Option<u64>,
    next_deadline: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(resolution: Resolution, fps: u32) -> Self {
        Self {
            resolution,
            format: PixelFormat::Bgra8,
            fps,
            row_padding: 0,
            segmentation: false,
            frame_skip: 0,
            mask: Vec::new(),
            mask_resolution: Resolution::new(0, 0),
            mask_age: 0,
            masks_computed: 0,
            frame_index: 0,
            frame_limit: None,
            next_deadline: None,
        }
    }

    /// Pad every row with `bytes` extra bytes.
    pub fn with_row_padding(mut self, bytes: usize) -> Self {
        self.row_padding = bytes;
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Report [`CaptureError::Closed`] after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_index
    }

    /// Segmentation masks computed so far.
    pub fn masks_computed(&self) -> u64 {
        self.masks_computed
    }

    /// Tightly packed pixels of frame `index`.
    pub fn pattern(resolution: Resolution, format: PixelFormat, index: u64, segmentation: bool) -> Vec<u8> {
        let bpp = format.bytes_per_pixel();
        let mut out = Vec::with_capacity(format.frame_len(resolution.width, resolution.height));
        for y in 0..resolution.height {
            for x in 0..resolution.width {
                let foreground = !segmentation || inside_ellipse(resolution, index, x, y);
                let px = pixel(format, index, foreground, x, y);
                out.extend_from_slice(&px[..bpp]);
            }
        }
        out
    }

    fn pace(&mut self) {
        if self.fps == 0 {
            return;
        }
        let period = Duration::from_secs(1) / self.fps;
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        // Do not try to catch up after a stall.
        self.next_deadline = Some(deadline.max(now) + period);
    }

    /// Recompute the mask when it is stale or sized for another
    /// resolution.
    fn refresh_mask(&mut self) {
        let res = self.resolution;
        if self.mask_resolution == res && self.mask_age < self.frame_skip {
            self.mask_age += 1;
            return;
        }
        self.mask.clear();
        for y in 0..res.height {
            for x in 0..res.width {
                self.mask.push(inside_ellipse(res, self.frame_index, x, y));
            }
        }
        self.mask_resolution = res;
        self.mask_age = 0;
        self.masks_computed += 1;
    }
}

fn pixel(format: PixelFormat, index: u64, foreground: bool, x: u32, y: u32) -> [u8; 4] {
    let t = index as u32;
    let (r, g, b) = (
        (t.wrapping_mul(3)) as u8,
        (y.wrapping_add(t)) as u8,
        (x.wrapping_add(t)) as u8,
    );
    let alpha = if foreground { 255 } else { 0 };
    match format {
        PixelFormat::Bgra8 => [b, g, r, alpha],
        PixelFormat::Rgba8 => [r, g, b, alpha],
        PixelFormat::Rgb8 => [r, g, b, 0],
    }
}

/// Head-and-shoulders stand-in: an ellipse filling the middle of the
/// frame, drifting a few pixels left and right over eight frames.
fn inside_ellipse(res: Resolution, index: u64, x: u32, y: u32) -> bool {
    let sway = ((index % 8) as f32 - 4.0) * res.width as f32 / 160.0;
    let (cx, cy) = (res.width as f32 / 2.0 + sway, res.height as f32 / 2.0);
    let (rx, ry) = (res.width as f32 * 0.35, res.height as f32 * 0.45);
    let dx = (x as f32 + 0.5 - cx) / rx;
    let dy = (y as f32 + 0.5 - cy) / ry;
    dx * dx + dy * dy <= 1.0
}

impl CaptureSource for SyntheticSource {
    fn capture_next_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        if self.frame_limit.is_some_and(|limit| self.frame_index >= limit) {
            return Err(CaptureError::Closed);
        }
        self.pace();
        if self.segmentation {
            self.refresh_mask();
        }

        let Resolution { width, height } = self.resolution;
        let bpp = self.format.bytes_per_pixel();
        let stride = width as usize * bpp + self.row_padding;
        let mut data = vec![0xCD; stride * height as usize];
        for y in 0..height {
            let row = &mut data[y as usize * stride..];
            for x in 0..width {
                let at_mask = (y * width + x) as usize;
                let foreground = !self.segmentation || self.mask.get(at_mask).copied().unwrap_or(true);
                let px = pixel(self.format, self.frame_index, foreground, x, y);
                let at = x as usize * bpp;
                row[at..at + bpp].copy_from_slice(&px[..bpp]);
            }
        }
        self.frame_index += 1;

        Ok(CapturedFrame {
            width,
            height,
            stride,
            format: self.format,
            data,
            timestamp: Instant::now(),
        })
    }

    fn supported_resolutions(&self) -> Vec<Resolution> {
        SYNTHETIC_RESOLUTIONS.to_vec()
    }

    fn set_resolution(&mut self, resolution: Resolution) -> Result<(), CaptureError> {
        if !SYNTHETIC_RESOLUTIONS.contains(&resolution) {
            return Err(CaptureError::Unsupported("resolution"));
        }
        self.resolution = resolution;
        Ok(())
    }

    fn set_segmentation(&mut self, enabled: bool) -> Result<(), CaptureError> {
        self.segmentation = enabled;
        // Start from a fresh mask when turned back on.
        self.mask_resolution = Resolution::new(0, 0);
        Ok(())
    }

    fn set_segmentation_frame_skip(&mut self, skip: u32) -> Result<(), CaptureError> {
        self.frame_skip = skip;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_rows_match_packed_pattern() {
        let res = Resolution::new(320, 240);
        let mut src = SyntheticSource::new(res, 0).with_row_padding(64);
        let frame = src.capture_next_frame().unwrap();
        assert_eq!(frame.stride, 320 * 4 + 64);
        assert!(frame.is_padded());

        let mut packed = Vec::new();
        frame.pack_into(&mut packed).unwrap();
        assert_eq!(packed, SyntheticSource::pattern(res, PixelFormat::Bgra8, 0, false));
    }

    #[test]
    fn frames_change_over_time() {
        let mut src = SyntheticSource::new(Resolution::new(320, 240), 0);
        let a = src.capture_next_frame().unwrap();
        let b = src.capture_next_frame().unwrap();
        assert_ne!(a.data, b.data);
        assert_eq!(src.frames_produced(), 2);
    }

    #[test]
    fn segmentation_clears_background_alpha() {
        let res = Resolution::new(320, 240);
        let mut src = SyntheticSource::new(res, 0);
        src.set_segmentation(true).unwrap();
        let frame = src.capture_next_frame().unwrap();
        // Corner is background, centre is foreground.
        assert_eq!(frame.row(0)[3], 0);
        let centre = frame.row(120);
        assert_eq!(centre[160 * 4 + 3], 255);
    }

    fn alpha(frame: &CapturedFrame) -> Vec<u8> {
        frame.data.chunks_exact(4).map(|px| px[3]).collect()
    }

    fn pattern_alpha(res: Resolution, index: u64) -> Vec<u8> {
        let pixels = SyntheticSource::pattern(res, PixelFormat::Bgra8, index, true);
        pixels.chunks_exact(4).map(|px| px[3]).collect()
    }

    #[test]
    fn mask_follows_every_frame_without_skip() {
        let res = Resolution::new(320, 240);
        let mut src = SyntheticSource::new(res, 0);
        src.set_segmentation(true).unwrap();
        for index in 0..4 {
            let frame = src.capture_next_frame().unwrap();
            assert_eq!(alpha(&frame), pattern_alpha(res, index));
        }
        assert_eq!(src.masks_computed(), 4);
        assert_ne!(pattern_alpha(res, 0), pattern_alpha(res, 1));
    }

    #[test]
    fn skipped_frames_reuse_the_mask() {
        let res = Resolution::new(320, 240);
        let mut src = SyntheticSource::new(res, 0);
        src.set_segmentation(true).unwrap();
        src.set_segmentation_frame_skip(3).unwrap();

        let frames: Vec<_> = (0..8).map(|_| src.capture_next_frame().unwrap()).collect();
        assert_eq!(src.masks_computed(), 2);
        for (i, frame) in frames.iter().enumerate() {
            let computed_at = (i / 4 * 4) as u64;
            assert_eq!(alpha(frame), pattern_alpha(res, computed_at), "frame {i}");
        }
        // Colours still move every frame.
        assert_ne!(frames[0].data, frames[1].data);
    }

    #[test]
    fn resolution_change_recomputes_mask() {
        let mut src = SyntheticSource::new(Resolution::new(320, 240), 0);
        src.set_segmentation(true).unwrap();
        src.set_segmentation_frame_skip(3).unwrap();
        src.capture_next_frame().unwrap();
        src.set_resolution(Resolution::new(640, 480)).unwrap();
        let frame = src.capture_next_frame().unwrap();
        assert_eq!(src.masks_computed(), 2);
        assert_eq!(alpha(&frame), pattern_alpha(Resolution::new(640, 480), 1));
    }

    #[test]
    fn resolution_must_be_offered() {
        let mut src = SyntheticSource::new(Resolution::new(320, 240), 0);
        assert!(src.set_resolution(Resolution::new(100, 100)).is_err());
        src.set_resolution(Resolution::new(640, 480)).unwrap();
        let frame = src.capture_next_frame().unwrap();
        assert_eq!((frame.width, frame.height), (640, 480));
    }

    #[test]
    fn frame_limit_closes_source() {
        let mut src = SyntheticSource::new(Resolution::new(320, 240), 0).with_frame_limit(1);
        assert!(src.capture_next_frame().is_ok());
        assert!(matches!(src.capture_next_frame(), Err(CaptureError::Closed)));
    }

    #[test]
    fn pacing_spaces_frames() {
        let mut src = SyntheticSource::new(Resolution::new(320, 240), 100);
        let start = Instant::now();
        for _ in 0..3 {
            src.capture_next_frame().unwrap();
        }
        // First frame is immediate, the next two wait ~10 ms each.
        assert!(start.elapsed() >= Duration::from_millis(18));
    }
}
