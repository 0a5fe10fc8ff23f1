//! Overlay sink for headless runs: tracks overlay sizes and logs what a
//! renderer would draw.

use tracing::{debug, info, trace};

use chathead_core::{ChatheadError, OverlaySink};

/// What the sink knows about one overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayState {
    pub width: u32,
    pub height: u32,
    pub uploads: u64,
    /// Share of pixels with non-zero alpha in the last upload, in percent.
    pub coverage: u8,
}

#[derive(Debug, Default)]
pub struct LoggingSink {
    overlays: Vec<OverlayState>,
}

impl LoggingSink {
    pub fn overlay(&self, index: usize) -> Option<&OverlayState> {
        self.overlays.get(index).filter(|o| o.width > 0)
    }

    pub fn total_uploads(&self) -> u64 {
        self.overlays.iter().map(|o| o.uploads).sum()
    }

    fn entry(&mut self, index: usize) -> &mut OverlayState {
        if self.overlays.len() <= index {
            self.overlays.resize(index + 1, OverlayState::default());
        }
        &mut self.overlays[index]
    }
}

impl OverlaySink for LoggingSink {
    fn recreate(&mut self, overlay: usize, width: u32, height: u32) -> Result<(), ChatheadError> {
        let state = self.entry(overlay);
        state.width = width;
        state.height = height;
        info!(overlay, width, height, "overlay texture created");
        Ok(())
    }

    fn upload(&mut self, overlay: usize, pixels: &[u8], width: u32, height: u32) -> Result<(), ChatheadError> {
        let state = self.entry(overlay);
        if (state.width, state.height) != (width, height) {
            return Err(ChatheadError::FrameSizeMismatch {
                expected: state.width as usize * state.height as usize * 4,
                actual: pixels.len(),
            });
        }
        let total = pixels.len() / 4;
        let opaque = pixels.chunks_exact(4).filter(|px| px[3] != 0).count();
        state.coverage = if total == 0 { 0 } else { (opaque * 100 / total) as u8 };
        state.uploads += 1;
        if state.uploads == 1 {
            debug!(overlay, coverage = state.coverage, "first frame on overlay");
        }
        trace!(overlay, width, height, "overlay updated");
        Ok(())
    }
}
