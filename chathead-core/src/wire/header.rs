//! Fixed 16-byte packet header.
//!
//! ```text
//! magic:     [u8; 4]  "CHD0"
//! kind:      u8       PacketKind
//! flags:     u8       PacketFlags
//! version:   u16      PROTOCOL_VERSION
//! checksum:  u32      first 4 bytes of blake3(payload), LE
//! length:    u32      payload length
//! ```

use bitflags::bitflags;

use crate::error::ChatheadError;

/// Magic prefix of every datagram.
pub const MAGIC: [u8; 4] = *b"CHD0";

/// Bumped on any incompatible wire change.
pub const PROTOCOL_VERSION: u16 = 1;

/// Encoded header size.
pub const HEADER_LENGTH: usize = 16;

// ── PacketKind ───────────────────────────────────────────────────

/// What the payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// A bincode [`ControlMessage`](super::ControlMessage).
    Control = 1,
    /// A [`VideoChunkHeader`](super::VideoChunkHeader) plus chunk bytes.
    VideoChunk = 2,
}

impl TryFrom<u8> for PacketKind {
    type Error = ChatheadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Control),
            2 => Ok(Self::VideoChunk),
            other => Err(ChatheadError::UnknownVariant {
                type_name: "PacketKind",
                value: other as u64,
            }),
        }
    }
}

// ── PacketFlags ──────────────────────────────────────────────────

bitflags! {
    /// Per-packet flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        /// The server forwarded this packet from another client.
        const RELAYED = 0b0000_0001;
        /// Meant for the server only; not relayed to other clients.
        const DIRECT  = 0b0000_0010;
    }
}

// ── PacketHeader ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub flags: PacketFlags,
    pub version: u16,
    pub checksum: u32,
    pub length: u32,
}

impl PacketHeader {
    /// Build a header for `payload`, computing its checksum.
    pub fn for_payload(kind: PacketKind, flags: PacketFlags, payload: &[u8]) -> Self {
        Self {
            kind,
            flags,
            version: PROTOCOL_VERSION,
            checksum: checksum(payload),
            length: payload.len() as u32,
        }
    }

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.kind as u8;
        buf[5] = self.flags.bits();
        buf[6..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..16].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ChatheadError> {
        let bytes: &[u8; HEADER_LENGTH] = data
            .get(..HEADER_LENGTH)
            .and_then(|b| b.try_into().ok())
            .ok_or(ChatheadError::InvalidHeader("header too short"))?;

        if bytes[0..4] != MAGIC {
            return Err(ChatheadError::InvalidMagic);
        }
        let version = u16::from_le_bytes([bytes[6], bytes[7]]);
        if version != PROTOCOL_VERSION {
            return Err(ChatheadError::UnsupportedVersion(version));
        }
        let flags = PacketFlags::from_bits(bytes[5])
            .ok_or(ChatheadError::InvalidHeader("unknown flag bits"))?;

        Ok(Self {
            kind: PacketKind::try_from(bytes[4])?,
            flags,
            version,
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            length: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }
}

/// First four bytes of the blake3 hash of `payload`, little-endian.
pub fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
