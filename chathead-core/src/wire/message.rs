//! Session control messages, bincode-encoded.

use serde::{Deserialize, Serialize};

use crate::error::ChatheadError;

/// Connection-lifecycle traffic between server and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Client → server: request to join.
    Hello { protocol_version: u16 },
    /// Server → client: join accepted with the assigned id and the ids
    /// already in the session.
    Welcome {
        player_id: u32,
        max_players: u32,
        players: Vec<u32>,
    },
    /// Server → client: every slot is taken.
    ServerFull,
    /// Either direction: still alive.
    Heartbeat,
    /// Either direction: leaving the session.
    Goodbye,
    /// Server → clients: another client joined.
    PeerJoined { player_id: u32 },
    /// Server → clients: another client left or timed out.
    PeerLeft { player_id: u32 },
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChatheadError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ChatheadError> {
        Ok(bincode::deserialize(data)?)
    }
}
