//! # chathead-core
//!
//! Live per-player video overlays exchanged between up to four players.
//!
//! Three threads cooperate through fixed-size, try-locked frame slots:
//!
//! - **capture**: `CaptureProducer` pulls frames from a `CaptureSource`,
//!   publishes them to the local slot and sends encoded copies;
//! - **network**: `NetworkSession` runs the UDP star topology and decodes
//!   remote frames into per-player `PeerChannel`s;
//! - **consumer** (the caller): `Compositor` applies resizes and uploads
//!   fresh frames to an `OverlaySink` once per tick.
//!
//! No thread ever waits on another's frame lock. A busy slot drops the
//! frame and the newest one wins.

pub mod capture;
pub mod channel;
pub mod codec;
pub mod compositor;
pub mod config;
pub mod error;
pub mod session;
pub mod slot;
pub mod stats;
pub mod types;
pub mod wire;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{CaptureCounters, CaptureProducer, CaptureSource, LocalFeed, SyntheticSource};
pub use channel::{IngestOutcome, PeerChannel, PeerChannels, channel_index, player_for_channel};
pub use codec::{
    DEFAULT_KEY_THRESHOLD, DecoderFactory, EncodedUnit, FrameDecoder, FrameEncoder, ZstdDecoder,
    ZstdDecoderFactory, ZstdEncoder, clear_faint_pixels, key_out_background,
};
pub use compositor::{CompositeReport, Compositor, OverlaySink};
pub use config::{
    CaptureConfig, DEFAULT_PORT, MAX_PLAYERS, MAX_SEGMENTATION_FRAME_SKIP, SessionConfig,
};
pub use error::{CaptureError, ChatheadError};
pub use session::{NetworkSession, RemoteFrame, Role, SessionEvent, SessionPhase};
pub use slot::{FrameSlot, FrameSnapshot, ReadGuard, WriteGuard};
pub use stats::TrafficMeter;
pub use types::{CapturedFrame, PixelFormat, Resolution};
pub use wire::{ControlMessage, Packet, VideoUpdateMessage, WireCodec};
