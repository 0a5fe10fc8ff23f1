//! Local camera pipeline.
//!
//! The [`CaptureProducer`] runs on its own thread named `capture`. Each
//! cycle goes through the same states:
//!
//! ```text
//!  Idle ──► Capturing ──► publish to LocalFeed ──► Encoding ──► Sending ──► Idle
//!               │                                    │
//!               └── transient failure: skip          └── not connected / throttled: skip
//! ```
//!
//! Capturing blocks inside the [`CaptureSource`]; the producer never
//! polls. Publishing is a try-acquire on the local slot, so a busy
//! consumer costs one dropped frame and never a stall.

pub mod synthetic;

pub use synthetic::SyntheticSource;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use crate::codec::{FrameEncoder, ThresholdCell};
use crate::config::{CaptureConfig, MAX_SEGMENTATION_FRAME_SKIP};
use crate::error::{CaptureError, ChatheadError};
use crate::session::NetworkSession;
use crate::slot::{FrameSlot, FrameSnapshot, ReadGuard};
use crate::types::{CapturedFrame, Resolution};
use crate::wire::VideoUpdateMessage;

// ── CaptureSource ────────────────────────────────────────────────

/// A camera (or anything that produces frames on its own clock).
pub trait CaptureSource: Send {
    /// Block until the next frame is available.
    fn capture_next_frame(&mut self) -> Result<CapturedFrame, CaptureError>;

    /// Resolutions the device can deliver.
    fn supported_resolutions(&self) -> Vec<Resolution>;

    fn set_resolution(&mut self, resolution: Resolution) -> Result<(), CaptureError>;

    /// Toggle background removal.
    fn set_segmentation(&mut self, enabled: bool) -> Result<(), CaptureError>;

    /// Recompute the segmentation mask only every `skip + 1` frames.
    fn set_segmentation_frame_skip(&mut self, skip: u32) -> Result<(), CaptureError> {
        let _ = skip;
        Err(CaptureError::Unsupported("segmentation frame skip"))
    }
}

// ── LocalFeed ────────────────────────────────────────────────────

/// The local player's slot plus its "updated" flag.
pub struct LocalFeed {
    slot: FrameSlot,
    updated: AtomicBool,
}

impl LocalFeed {
    pub fn new(config: &CaptureConfig) -> Result<Self, ChatheadError> {
        let Resolution { width, height } = config.initial_resolution;
        Ok(Self {
            slot: FrameSlot::new(width, height, config.pixel_format)?,
            updated: AtomicBool::new(false),
        })
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    /// A captured frame is waiting for the consumer.
    pub fn is_updated(&self) -> bool {
        self.updated.load(Ordering::Acquire)
    }

    /// Consumer side: read access to a new frame, clearing the flag
    /// while the guard is held.
    pub fn take_updated_frame(&self) -> Option<ReadGuard<'_>> {
        if !self.is_updated() {
            return None;
        }
        let guard = self.slot.try_acquire_read()?;
        self.updated.store(false, Ordering::Release);
        Some(guard)
    }

    /// Owned copy of the latest frame, if the slot is free and was ever
    /// written.
    pub fn snapshot(&self) -> Option<FrameSnapshot> {
        let guard = self.slot.try_acquire_read()?;
        FrameSnapshot::capture(&guard)
    }

    /// Capture side: copy `frame` in, resizing first if needed.
    ///
    /// Returns `false` when the slot was busy and the frame was dropped.
    /// A malformed frame is rejected before the slot is touched, so the
    /// slot keeps its last complete frame.
    pub(crate) fn publish(&self, frame: &CapturedFrame) -> Result<bool, ChatheadError> {
        if frame.format != self.slot.format() {
            return Err(ChatheadError::Capture(CaptureError::Unsupported(
                "pixel format differs from local slot",
            )));
        }
        frame.check_layout()?;
        let Some(mut guard) = self.slot.try_acquire_write() else {
            return Ok(false);
        };
        if guard.resolution() != Resolution::new(frame.width, frame.height) {
            guard.resize(frame.width, frame.height)?;
            debug!(width = frame.width, height = frame.height, "local slot resized");
        }
        guard.write_rows(&frame.data, frame.stride)?;
        guard.release();
        self.updated.store(true, Ordering::Release);
        Ok(true)
    }
}

// ── Control & stats ──────────────────────────────────────────────

struct CaptureControl {
    stop: AtomicBool,
    paused: AtomicBool,
    segmentation: AtomicBool,
    encoding_threshold: ThresholdCell,
    segmentation_frame_skip: AtomicU32,
    /// Packed [`Resolution`]; 0 means no request.
    requested_resolution: AtomicU64,
}

impl CaptureControl {
    /// Threshold the encoder should key with right now.
    fn keying(&self) -> Option<u8> {
        if self.segmentation.load(Ordering::Acquire) {
            self.encoding_threshold.get()
        } else {
            None
        }
    }

    fn take_requested_resolution(&self) -> Option<Resolution> {
        match self.requested_resolution.swap(0, Ordering::AcqRel) {
            0 => None,
            packed => Some(Resolution::unpack(packed)),
        }
    }
}

#[derive(Default)]
struct CaptureStats {
    captured: AtomicU64,
    capture_failures: AtomicU64,
    published: AtomicU64,
    dropped_contention: AtomicU64,
    encoded: AtomicU64,
    sent: AtomicU64,
}

/// Counters since the producer started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    pub captured: u64,
    pub capture_failures: u64,
    pub published: u64,
    pub dropped_contention: u64,
    pub encoded: u64,
    pub sent: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ── CaptureProducer ──────────────────────────────────────────────

/// Owns the capture thread.
pub struct CaptureProducer {
    feed: Arc<LocalFeed>,
    control: Arc<CaptureControl>,
    stats: Arc<CaptureStats>,
    resolutions: Vec<Resolution>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureProducer {
    /// Start capturing on a new thread.
    ///
    /// With a `session`, each captured frame is also encoded and sent
    /// whenever the session is connected and its throttle allows it.
    pub fn start<S, E>(
        mut source: S,
        mut encoder: E,
        session: Option<Arc<NetworkSession>>,
        config: CaptureConfig,
    ) -> Result<Self, ChatheadError>
    where
        S: CaptureSource + 'static,
        E: FrameEncoder + 'static,
    {
        let feed = Arc::new(LocalFeed::new(&config)?);

        let mut resolutions = source.supported_resolutions();
        resolutions.sort();
        resolutions.dedup();

        if let Err(e) = source.set_segmentation(config.segmentation) {
            debug!(error = %e, "source ignores segmentation toggle");
        }
        let skip = config.segmentation_frame_skip.min(MAX_SEGMENTATION_FRAME_SKIP);
        if let Err(e) = source.set_segmentation_frame_skip(skip) {
            debug!(error = %e, "source ignores segmentation frame skip");
        }

        let control = Arc::new(CaptureControl {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(config.start_paused),
            segmentation: AtomicBool::new(config.segmentation),
            encoding_threshold: ThresholdCell::new(config.encoding_threshold),
            segmentation_frame_skip: AtomicU32::new(skip),
            requested_resolution: AtomicU64::new(0),
        });
        let keying = control.keying();
        encoder.set_alpha_threshold(keying);
        let stats = Arc::new(CaptureStats::default());

        let task = CaptureLoop {
            source,
            encoder,
            session,
            feed: Arc::clone(&feed),
            control: Arc::clone(&control),
            stats: Arc::clone(&stats),
            transmit: config.transmit,
            segmentation_applied: config.segmentation,
            keying_applied: keying,
            skip_applied: skip,
            packed: Vec::new(),
        };
        let worker = thread::Builder::new()
            .name("capture".into())
            .spawn(move || task.run())?;

        info!(resolutions = resolutions.len(), "capture started");
        Ok(Self {
            feed,
            control,
            stats,
            resolutions,
            worker: Some(worker),
        })
    }

    /// The local player's frames, for the compositor.
    pub fn feed(&self) -> &Arc<LocalFeed> {
        &self.feed
    }

    /// Resolutions offered by the source, sorted by width then height.
    pub fn supported_resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// Ask the source to switch resolution before its next frame.
    pub fn request_resolution(&self, resolution: Resolution) -> Result<(), ChatheadError> {
        if !self.resolutions.contains(&resolution) {
            return Err(CaptureError::Unsupported("resolution").into());
        }
        self.control
            .requested_resolution
            .store(resolution.pack(), Ordering::Release);
        Ok(())
    }

    pub fn set_segmentation(&self, enabled: bool) {
        self.control.segmentation.store(enabled, Ordering::Release);
    }

    pub fn segmentation_enabled(&self) -> bool {
        self.control.segmentation.load(Ordering::Acquire)
    }

    /// Alpha at or below `threshold` is sent as background while
    /// segmentation is on. `None` sends every pixel.
    pub fn set_encoding_threshold(&self, threshold: Option<u8>) {
        self.control.encoding_threshold.set(threshold);
    }

    pub fn encoding_threshold(&self) -> Option<u8> {
        self.control.encoding_threshold.get()
    }

    /// Reuse the segmentation mask for `skip` further frames, clamped
    /// to 0..=3.
    pub fn set_segmentation_frame_skip(&self, skip: u32) {
        self.control
            .segmentation_frame_skip
            .store(skip.min(MAX_SEGMENTATION_FRAME_SKIP), Ordering::Release);
    }

    pub fn segmentation_frame_skip(&self) -> u32 {
        self.control.segmentation_frame_skip.load(Ordering::Acquire)
    }

    /// Keep capturing but stop publishing and sending.
    pub fn set_paused(&self, paused: bool) {
        self.control.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::Acquire)
    }

    /// Whether the capture thread is still alive.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn counters(&self) -> CaptureCounters {
        let s = &self.stats;
        CaptureCounters {
            captured: s.captured.load(Ordering::Relaxed),
            capture_failures: s.capture_failures.load(Ordering::Relaxed),
            published: s.published.load(Ordering::Relaxed),
            dropped_contention: s.dropped_contention.load(Ordering::Relaxed),
            encoded: s.encoded.load(Ordering::Relaxed),
            sent: s.sent.load(Ordering::Relaxed),
        }
    }

    /// Stop the thread and wait for it. The frame being captured is
    /// allowed to finish. Idempotent.
    pub fn stop(&mut self) {
        self.control.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("capture thread panicked");
            }
            info!("capture stopped");
        }
    }
}

impl Drop for CaptureProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── CaptureLoop ──────────────────────────────────────────────────

struct CaptureLoop<S, E> {
    source: S,
    encoder: E,
    session: Option<Arc<NetworkSession>>,
    feed: Arc<LocalFeed>,
    control: Arc<CaptureControl>,
    stats: Arc<CaptureStats>,
    transmit: bool,
    segmentation_applied: bool,
    keying_applied: Option<u8>,
    skip_applied: u32,
    /// Tightly packed copy of padded frames for the encoder.
    packed: Vec<u8>,
}

impl<S: CaptureSource, E: FrameEncoder> CaptureLoop<S, E> {
    fn run(mut self) {
        while !self.control.stop.load(Ordering::Acquire) {
            self.apply_controls();

            let frame = match self.source.capture_next_frame() {
                Ok(f) => f,
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "capture skipped");
                    bump(&self.stats.capture_failures);
                    continue;
                }
                Err(e) => {
                    info!(error = %e, "capture source ended");
                    break;
                }
            };
            bump(&self.stats.captured);

            if self.control.paused.load(Ordering::Acquire) {
                continue;
            }
            self.publish(&frame);
            self.transmit(&frame);
        }
    }

    fn apply_controls(&mut self) {
        if let Some(resolution) = self.control.take_requested_resolution() {
            match self.source.set_resolution(resolution) {
                Ok(()) => info!(%resolution, "capture resolution changed"),
                Err(e) => warn!(%resolution, error = %e, "capture resolution rejected"),
            }
        }
        let wanted = self.control.segmentation.load(Ordering::Acquire);
        if wanted != self.segmentation_applied {
            self.segmentation_applied = wanted;
            if let Err(e) = self.source.set_segmentation(wanted) {
                debug!(error = %e, "source ignores segmentation toggle");
            }
        }
        let keying = self.control.keying();
        if keying != self.keying_applied {
            self.keying_applied = keying;
            self.encoder.set_alpha_threshold(keying);
            debug!(threshold = ?keying, "encoder keying changed");
        }
        let skip = self.control.segmentation_frame_skip.load(Ordering::Acquire);
        if skip != self.skip_applied {
            self.skip_applied = skip;
            if let Err(e) = self.source.set_segmentation_frame_skip(skip) {
                debug!(error = %e, "source ignores segmentation frame skip");
            }
        }
    }

    fn publish(&mut self, frame: &CapturedFrame) {
        match self.feed.publish(frame) {
            Ok(true) => bump(&self.stats.published),
            Ok(false) => {
                trace!("local slot busy, frame dropped");
                bump(&self.stats.dropped_contention);
            }
            Err(e) => debug!(error = %e, "frame not published"),
        }
    }

    fn transmit(&mut self, frame: &CapturedFrame) {
        if !self.transmit {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.is_connected() || !session.can_send() {
            return;
        }
        let Some(player_id) = session.player_id() else {
            return;
        };

        let pixels: &[u8] = if frame.is_padded() {
            if let Err(e) = frame.pack_into(&mut self.packed) {
                debug!(error = %e, "frame not packable");
                return;
            }
            &self.packed
        } else {
            let len = frame.row_len() * frame.height as usize;
            match frame.data.get(..len) {
                Some(p) => p,
                None => return,
            }
        };

        let unit = match self.encoder.encode(pixels, frame.width, frame.height) {
            Ok(Some(unit)) => unit,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "encode failed, frame skipped");
                return;
            }
        };
        bump(&self.stats.encoded);

        let message = VideoUpdateMessage {
            player_id,
            width: frame.width,
            height: frame.height,
            timestamp_ticks: unit.timestamp_ticks,
            duration_ticks: unit.duration_ticks,
            payload: unit.data,
        };
        // Every peer should see every other peer; the server relays.
        if session.send(message, true) {
            bump(&self.stats.sent);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
