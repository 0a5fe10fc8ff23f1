//! Session roles and lifecycle events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the star topology this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Player 0; binds the port and relays between clients.
    Server,
    /// Connects to a server and receives a player id.
    Client,
}

impl Role {
    pub(crate) const fn code(self) -> u8 {
        match self {
            Role::Server => 1,
            Role::Client => 2,
        }
    }

    pub(crate) const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Role::Server),
            2 => Some(Role::Client),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Something the application may want to react to. Delivered on the
/// network thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Server socket bound.
    Listening { port: u16 },
    /// Client accepted by the server.
    Connected { player_id: u32 },
    /// Another player entered the session.
    PeerJoined { player_id: u32 },
    /// Another player left cleanly.
    PeerLeft { player_id: u32 },
    /// Server stopped hearing from a client.
    PeerLost { player_id: u32 },
    /// Client gave up after every Hello went unanswered.
    ConnectionFailed { attempts: u32 },
    /// Client was refused because the session is full.
    ServerFull,
    /// Client stopped hearing from the server.
    ConnectionLost,
    /// The session ended (local shutdown or server goodbye).
    Disconnected,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { port } => write!(f, "listening on port {port}"),
            Self::Connected { player_id } => write!(f, "connected as player {player_id}"),
            Self::PeerJoined { player_id } => write!(f, "player {player_id} joined"),
            Self::PeerLeft { player_id } => write!(f, "player {player_id} left"),
            Self::PeerLost { player_id } => write!(f, "player {player_id} timed out"),
            Self::ConnectionFailed { attempts } => {
                write!(f, "no answer from server after {attempts} attempts")
            }
            Self::ServerFull => f.write_str("server is full"),
            Self::ConnectionLost => f.write_str("lost connection to server"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}
