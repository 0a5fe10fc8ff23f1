//! Datagram wire protocol.
//!
//! Every datagram is one [`Packet`]: a 16-byte [`PacketHeader`] followed
//! by either a bincode [`ControlMessage`] or a video chunk. Video frames
//! are split across chunks by [`chunk_frame`] and put back together by a
//! per-receiver [`Reassembler`].

pub mod chunk;
pub mod codec;
pub mod header;
pub mod message;

pub use chunk::{
    CHUNK_PAYLOAD_SIZE, DEFAULT_MTU, Reassembler, VideoChunkHeader, VideoUpdateMessage,
    chunk_frame, sequence_newer,
};
pub use codec::{MAX_PAYLOAD_SIZE, Packet, WireCodec};
pub use header::{HEADER_LENGTH, MAGIC, PROTOCOL_VERSION, PacketFlags, PacketHeader, PacketKind};
pub use message::ControlMessage;
