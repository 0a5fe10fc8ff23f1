//! Configuration for the headless peer.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chathead_core::{
    CaptureConfig, DEFAULT_KEY_THRESHOLD, MAX_PLAYERS, MAX_SEGMENTATION_FRAME_SKIP, Resolution,
    Role, SessionConfig,
};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Session settings.
    pub network: NetworkConfig,
    /// Camera and overlay settings.
    pub video: VideoConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// "server" or "client".
    pub role: Role,
    /// Server: bind address (empty = all interfaces). Client: server
    /// address; a bare host uses `port`.
    pub address: String,
    /// UDP port.
    pub port: u16,
    /// Players in a session, including the server (2-4).
    pub max_players: u32,
    /// Minimum time between two sent frames, in milliseconds.
    pub send_interval_ms: u64,
    /// Hello attempts before giving up on the server.
    pub connect_attempts: u32,
    /// Delay between hello attempts, in milliseconds.
    pub connect_retry_ms: u64,
    /// Silence after which a peer counts as lost, in milliseconds.
    pub peer_timeout_ms: u64,
}

/// Camera and overlay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Capture width.
    pub width: u32,
    /// Capture height.
    pub height: u32,
    /// Capture frame rate.
    pub fps: u32,
    /// Remove the background around the player.
    pub segmentation: bool,
    /// Frames the segmentation mask is reused for (0-3).
    pub segmentation_frame_skip: u32,
    /// Outgoing pixels with alpha at or below this are sent as background.
    pub encoding_threshold: u8,
    /// Incoming pixels with every channel below this become transparent.
    pub decoding_threshold: u8,
    /// Consumer tick in milliseconds.
    pub frame_clock_ms: u64,
    /// Log a status line every this many seconds (0 = never).
    pub status_interval_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            role: Role::Server,
            address: String::new(),
            port: session.port,
            max_players: session.max_players,
            send_interval_ms: session.send_interval.as_millis() as u64,
            connect_attempts: session.connect_attempts,
            connect_retry_ms: session.connect_retry_interval.as_millis() as u64,
            peer_timeout_ms: session.peer_timeout.as_millis() as u64,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 30,
            segmentation: true,
            segmentation_frame_skip: 0,
            encoding_threshold: DEFAULT_KEY_THRESHOLD,
            decoding_threshold: DEFAULT_KEY_THRESHOLD,
            frame_clock_ms: 33,
            status_interval_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl PeerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Session settings, clamped to what the engine accepts.
    pub fn to_session_config(&self) -> SessionConfig {
        let net = &self.network;
        SessionConfig::default()
            .with_max_players(net.max_players.clamp(2, MAX_PLAYERS))
            .with_port(net.port)
            .with_send_interval(Duration::from_millis(net.send_interval_ms.clamp(1, 1000)))
            .with_initial_resolution(self.resolution())
            .with_connect_attempts(
                net.connect_attempts.max(1),
                Duration::from_millis(net.connect_retry_ms.max(10)),
            )
            .with_liveness(
                SessionConfig::default().heartbeat_interval,
                Duration::from_millis(net.peer_timeout_ms.max(1000)),
            )
            .with_decoding_threshold(Some(self.video.decoding_threshold))
    }

    /// Capture settings.
    pub fn to_capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            initial_resolution: self.resolution(),
            segmentation: self.video.segmentation,
            segmentation_frame_skip: self.video.segmentation_frame_skip.min(MAX_SEGMENTATION_FRAME_SKIP),
            encoding_threshold: Some(self.video.encoding_threshold),
            ..CaptureConfig::default()
        }
    }

    /// Consumer tick, clamped to 1 ms..1 s.
    pub fn frame_clock(&self) -> Duration {
        Duration::from_millis(self.video.frame_clock_ms.clamp(1, 1000))
    }

    fn resolution(&self) -> Resolution {
        let max = SessionConfig::default().max_frame_dimension;
        Resolution::new(self.video.width.clamp(1, max), self.video.height.clamp(1, max))
    }
}

// ── Tests ────────────────────────────────────────────────────────
