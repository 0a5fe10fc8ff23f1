//! Session lifecycle state machine.
//!
//! Transitions are validated and return `Result` instead of panicking.
//! The network worker owns the phase; other threads read a mirrored
//! copy through [`SessionPhase::code`].

use std::fmt;

use crate::error::ChatheadError;

// ── SessionPhase ─────────────────────────────────────────────────

/// The current phase of a [`NetworkSession`](super::NetworkSession).
///
/// ```text
///            ┌──► Listening ───────────────┐   (server)
///  Idle ─────┤                             ▼
///    ▲       └──► Connecting ──► Connected ──► Disconnecting   (client)
///    │               │                           │
///    └───────────────┴───────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SessionPhase {
    /// No socket. Initial / terminal state.
    #[default]
    Idle = 0,
    /// Server socket bound; accepting clients.
    Listening = 1,
    /// Client is sending Hello messages.
    Connecting = 2,
    /// Client received its player id.
    Connected = 3,
    /// Shutdown in progress.
    Disconnecting = 4,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Listening => "Listening",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

impl SessionPhase {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`code`](Self::code); unknown codes read as `Idle`.
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Listening,
            2 => Self::Connecting,
            3 => Self::Connected,
            4 => Self::Disconnecting,
            _ => Self::Idle,
        }
    }

    /// Whether a socket is open in this phase.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`.
    pub fn begin_listen(&mut self) -> Result<(), ChatheadError> {
        match self {
            Self::Idle => {
                *self = Self::Listening;
                Ok(())
            }
            _ => Err(ChatheadError::ProtocolViolation(
                "cannot listen: session not idle",
            )),
        }
    }

    /// Valid from: `Idle`.
    pub fn begin_connect(&mut self) -> Result<(), ChatheadError> {
        match self {
            Self::Idle => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(ChatheadError::ProtocolViolation(
                "cannot connect: session not idle",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn complete_connect(&mut self) -> Result<(), ChatheadError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected;
                Ok(())
            }
            _ => Err(ChatheadError::ProtocolViolation(
                "cannot complete connect: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Listening`, `Connecting`, `Connected`.
    pub fn begin_disconnect(&mut self) -> Result<(), ChatheadError> {
        match self {
            Self::Listening | Self::Connecting | Self::Connected => {
                *self = Self::Disconnecting;
                Ok(())
            }
            _ => Err(ChatheadError::ProtocolViolation(
                "cannot disconnect: no active session",
            )),
        }
    }

    /// Back to `Idle` after a shutdown, a failed connect or a lost
    /// server.
    ///
    /// Valid from: `Disconnecting`, `Connecting`, `Connected`.
    pub fn finish_disconnect(&mut self) -> Result<(), ChatheadError> {
        match self {
            Self::Disconnecting | Self::Connecting | Self::Connected => {
                *self = Self::Idle;
                Ok(())
            }
            _ => Err(ChatheadError::ProtocolViolation(
                "cannot finish disconnect: not in a disconnectable state",
            )),
        }
    }

    /// Force back to `Idle` regardless of current state.
    pub fn reset(&mut self) {
        *self = Self::Idle;
    }
}

// ── Tests ────────────────────────────────────────────────────────
