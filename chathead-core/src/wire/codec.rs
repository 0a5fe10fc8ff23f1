//! Packet framing over `bytes::BytesMut`.
//!
//! [`WireCodec`] implements the `tokio_util` codec traits so the same
//! framing works on a byte stream and on single UDP datagrams
//! ([`Packet::from_datagram`] / [`Packet::to_datagram`]).

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::chunk::VideoChunkHeader;
use super::header::{HEADER_LENGTH, PacketFlags, PacketHeader, PacketKind, checksum};
use super::message::ControlMessage;
use crate::error::ChatheadError;

/// Largest payload that fits in one IPv4 UDP datagram with our header.
pub const MAX_PAYLOAD_SIZE: usize = 65_507 - HEADER_LENGTH;

// ── Packet ───────────────────────────────────────────────────────

/// One framed unit: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub flags: PacketFlags,
    pub payload: Bytes,
}

impl Packet {
    /// Wrap a control message.
    pub fn control(message: &ControlMessage) -> Result<Self, ChatheadError> {
        Ok(Self {
            kind: PacketKind::Control,
            flags: PacketFlags::empty(),
            payload: Bytes::from(message.to_bytes()?),
        })
    }

    /// Wrap one video chunk.
    pub fn video_chunk(header: &VideoChunkHeader, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(VideoChunkHeader::SIZE + data.len());
        payload.put_slice(&header.encode());
        payload.put_slice(data);
        Self {
            kind: PacketKind::VideoChunk,
            flags: PacketFlags::empty(),
            payload: payload.freeze(),
        }
    }

    /// Same packet with `flags` added.
    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Parse the payload as a control message.
    pub fn as_control(&self) -> Result<ControlMessage, ChatheadError> {
        if self.kind != PacketKind::Control {
            return Err(ChatheadError::ProtocolViolation("not a control packet"));
        }
        ControlMessage::from_bytes(&self.payload)
    }

    /// Split the payload into chunk header and chunk bytes.
    pub fn as_video_chunk(&self) -> Result<(VideoChunkHeader, &[u8]), ChatheadError> {
        if self.kind != PacketKind::VideoChunk {
            return Err(ChatheadError::ProtocolViolation("not a video chunk"));
        }
        let header = VideoChunkHeader::decode(&self.payload)?;
        Ok((header, &self.payload[VideoChunkHeader::SIZE..]))
    }

    /// Decode exactly one packet from a received datagram.
    pub fn from_datagram(datagram: &[u8]) -> Result<Self, ChatheadError> {
        let mut buf = BytesMut::from(datagram);
        let packet = WireCodec
            .decode(&mut buf)?
            .ok_or(ChatheadError::InvalidHeader("truncated datagram"))?;
        if !buf.is_empty() {
            return Err(ChatheadError::InvalidHeader("trailing bytes after packet"));
        }
        Ok(packet)
    }

    /// Encode into a datagram ready for `send_to`.
    pub fn to_datagram(&self) -> Result<BytesMut, ChatheadError> {
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + self.payload.len());
        WireCodec.encode(self.clone(), &mut buf)?;
        Ok(buf)
    }
}

// ── WireCodec ────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Packet;
    type Error = ChatheadError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let header = PacketHeader::decode(&src[..HEADER_LENGTH])?;
        let length = header.length as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(ChatheadError::PayloadTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if src.len() < HEADER_LENGTH + length {
            return Ok(None);
        }

        let mut frame = src.split_to(HEADER_LENGTH + length);
        let payload = frame.split_off(HEADER_LENGTH).freeze();
        if checksum(&payload) != header.checksum {
            return Err(ChatheadError::ChecksumMismatch);
        }

        Ok(Some(Packet {
            kind: header.kind,
            flags: header.flags,
            payload,
        }))
    }
}

impl Encoder<Packet> for WireCodec {
    type Error = ChatheadError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ChatheadError::PayloadTooLarge {
                size: item.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = PacketHeader::for_payload(item.kind, item.flags, &item.payload);
        dst.reserve(HEADER_LENGTH + item.payload.len());
        dst.put_slice(&header.encode());
        dst.put_slice(&item.payload);
        Ok(())
    }
}
