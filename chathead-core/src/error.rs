//! Domain-specific error types for the chathead engine.
//!
//! Nothing on the frame path is fatal: contention, resize mismatches and
//! dropped datagrams are handled by skipping. The variants here cover the
//! remaining failures: setup, allocation, malformed wire data and the
//! external capture/codec seams.

use thiserror::Error;

/// The canonical error type for the chathead engine.
#[derive(Debug, Error)]
pub enum ChatheadError {
    // ── Wire Errors ──────────────────────────────────────────────
    /// Received bytes that do not start with the `CHD0` magic.
    #[error("invalid magic bytes: expected CHD0")]
    InvalidMagic,

    /// A field in the packet header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// The packet body failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The protocol version offered by the peer is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// A state transition or message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Frame Errors ─────────────────────────────────────────────
    /// A pixel buffer did not have the size its dimensions require.
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    /// Frame dimensions are zero or above the configured ceiling.
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// A pixel buffer could not be allocated.
    #[error("failed to allocate {bytes} bytes for a frame buffer")]
    Allocation { bytes: usize },

    // ── Session Errors ───────────────────────────────────────────
    /// The TCP/UDP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The target address could not be resolved.
    #[error("could not resolve address {0}")]
    AddressResolution(String),

    // ── Codec Errors ─────────────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The external frame decoder rejected a payload.
    #[error("decode failed: {0}")]
    Decode(String),

    // ── Capture Errors ───────────────────────────────────────────
    /// The capture source failed.
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── CaptureError ─────────────────────────────────────────────────

/// Typed error for the external capture source.
///
/// The capture loop retries on transient failures and stops only when
/// the source reports it is closed.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No frame became available this cycle.
    #[error("no frame available")]
    NoFrame,

    /// The device returned a frame that could not be read.
    #[error("frame acquisition failed: {0}")]
    Acquire(String),

    /// The requested operation is not supported by this source.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The device went away; no further frames will arrive.
    #[error("capture source closed")]
    Closed,
}

impl CaptureError {
    /// Whether the capture loop should simply try again next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::NoFrame | CaptureError::Acquire(_))
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for ChatheadError {
    fn from(s: String) -> Self {
        ChatheadError::Other(s)
    }
}

impl From<&str> for ChatheadError {
    fn from(s: &str) -> Self {
        ChatheadError::Other(s.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChatheadError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ChatheadError::Encoding(e.to_string())
    }
}
