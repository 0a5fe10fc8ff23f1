//! Runtime configuration for sessions and the capture producer.

use std::time::Duration;

use crate::codec::DEFAULT_KEY_THRESHOLD;
use crate::error::ChatheadError;
use crate::types::{PixelFormat, Resolution};

/// Largest session the engine supports (server plus three clients).
pub const MAX_PLAYERS: u32 = 4;

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 23000;

// ── SessionConfig ────────────────────────────────────────────────

/// Configuration for [`NetworkSession`](crate::session::NetworkSession).
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Players in the session including ourselves (2..=4).
    pub max_players: u32,
    /// UDP port the server binds and clients target by default.
    pub port: u16,
    /// Minimum gap between two accepted video sends.
    pub send_interval: Duration,
    /// Size peer slots start at before any frame arrives.
    pub initial_resolution: Resolution,
    /// Layout of decoded and captured pixels.
    pub pixel_format: PixelFormat,
    /// Hello messages a client sends before giving up.
    pub connect_attempts: u32,
    /// Gap between two Hello messages.
    pub connect_retry_interval: Duration,
    /// How often live connections send a heartbeat.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is considered gone.
    pub peer_timeout: Duration,
    /// Largest accepted frame edge in pixels.
    pub max_frame_dimension: u32,
    /// Largest accepted encoded frame.
    pub max_encoded_bytes: usize,
    /// Encoded frames that may wait for the network thread.
    pub outbound_queue: usize,
    /// Decoded pixels with every channel below this become transparent.
    pub decoding_threshold: Option<u8>,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS,
            port: DEFAULT_PORT,
            send_interval: Duration::from_millis(30),
            initial_resolution: Resolution::new(320, 240),
            pixel_format: PixelFormat::Bgra8,
            connect_attempts: 6,
            connect_retry_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(10),
            max_frame_dimension: 4096,
            max_encoded_bytes: 4 * 1024 * 1024,
            outbound_queue: 4,
            decoding_threshold: Some(DEFAULT_KEY_THRESHOLD),
        }
    }
}

impl SessionConfig {
    pub fn with_max_players(mut self, max_players: u32) -> Self {
        self.max_players = max_players;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_initial_resolution(mut self, resolution: Resolution) -> Self {
        self.initial_resolution = resolution;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32, retry_interval: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_retry_interval = retry_interval;
        self
    }

    pub fn with_liveness(mut self, heartbeat_interval: Duration, peer_timeout: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self.peer_timeout = peer_timeout;
        self
    }

    pub fn with_decoding_threshold(mut self, threshold: Option<u8>) -> Self {
        self.decoding_threshold = threshold;
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ChatheadError> {
        if !(2..=MAX_PLAYERS).contains(&self.max_players) {
            return Err(ChatheadError::Other(format!(
                "max_players must be between 2 and {MAX_PLAYERS}, got {}",
                self.max_players
            )));
        }
        let Resolution { width, height } = self.initial_resolution;
        if width == 0
            || height == 0
            || width > self.max_frame_dimension
            || height > self.max_frame_dimension
        {
            return Err(ChatheadError::InvalidDimensions { width, height });
        }
        if self.connect_attempts == 0 {
            return Err(ChatheadError::Other("connect_attempts must be at least 1".into()));
        }
        if self.outbound_queue == 0 {
            return Err(ChatheadError::Other("outbound_queue must be at least 1".into()));
        }
        Ok(())
    }
}

// ── CaptureConfig ────────────────────────────────────────────────

/// Configuration for [`CaptureProducer`](crate::capture::CaptureProducer).
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Size of the local slot before the first capture.
    pub initial_resolution: Resolution,
    pub pixel_format: PixelFormat,
    /// Ask the source for a background-removed image.
    pub segmentation: bool,
    /// Start with publication paused.
    pub start_paused: bool,
    /// Encode and send frames when a session is connected.
    pub transmit: bool,
    /// Pixels with alpha at or below this are sent as background while
    /// segmentation is on.
    pub encoding_threshold: Option<u8>,
    /// Frames the segmenter reuses its mask for (0..=3).
    pub segmentation_frame_skip: u32,
}

/// Largest accepted [`CaptureConfig::segmentation_frame_skip`].
pub const MAX_SEGMENTATION_FRAME_SKIP: u32 = 3;

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            initial_resolution: Resolution::new(320, 240),
            pixel_format: PixelFormat::Bgra8,
            segmentation: true,
            start_paused: false,
            transmit: true,
            encoding_threshold: Some(DEFAULT_KEY_THRESHOLD),
            segmentation_frame_skip: 0,
        }
    }
}
