//! Video update chunking and reassembly.
//!
//! An encoded frame rarely fits in one datagram, so each
//! [`VideoUpdateMessage`] is cut into chunks that all carry the same
//! 40-byte [`VideoChunkHeader`] (plus their own index):
//!
//! ```text
//! sequence:        u32  (4)   per-sender, wrapping
//! player_id:       u32  (4)
//! width:           u32  (4)
//! height:          u32  (4)
//! timestamp_ticks: i64  (8)
//! duration_ticks:  i64  (8)
//! total_len:       u32  (4)   encoded frame length
//! chunk_index:     u16  (2)
//! total_chunks:    u16  (2)
//! ```
//!
//! Every chunk but the last carries exactly `chunk_size` bytes, so the
//! receiver can place chunks by index without extra offsets. Any chunk
//! may arrive first.
//!
//! The [`Reassembler`] keeps at most one frame in flight per sender. A
//! chunk of a newer sequence abandons the older frame; chunks of a
//! sequence at or before the last completed one are discarded.

use std::collections::HashMap;

use crate::error::ChatheadError;

use super::header::HEADER_LENGTH;

/// Datagram budget, safely below common path MTUs.
pub const DEFAULT_MTU: usize = 1200;

/// Encoded bytes carried per chunk at [`DEFAULT_MTU`].
pub const CHUNK_PAYLOAD_SIZE: usize = DEFAULT_MTU - HEADER_LENGTH - VideoChunkHeader::SIZE;

/// `a` is newer than `b` in wrapping sequence space.
pub fn sequence_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

// ── VideoUpdateMessage ───────────────────────────────────────────

/// One remote player's encoded frame, as ingested by a peer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoUpdateMessage {
    pub player_id: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp_ticks: i64,
    pub duration_ticks: i64,
    /// Opaque encoder output.
    pub payload: Vec<u8>,
}

// ── VideoChunkHeader ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoChunkHeader {
    pub sequence: u32,
    pub player_id: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp_ticks: i64,
    pub duration_ticks: i64,
    pub total_len: u32,
    pub chunk_index: u16,
    pub total_chunks: u16,
}

impl VideoChunkHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 40;

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..8].copy_from_slice(&self.player_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.width.to_le_bytes());
        buf[12..16].copy_from_slice(&self.height.to_le_bytes());
        buf[16..24].copy_from_slice(&self.timestamp_ticks.to_le_bytes());
        buf[24..32].copy_from_slice(&self.duration_ticks.to_le_bytes());
        buf[32..36].copy_from_slice(&self.total_len.to_le_bytes());
        buf[36..38].copy_from_slice(&self.chunk_index.to_le_bytes());
        buf[38..40].copy_from_slice(&self.total_chunks.to_le_bytes());
        buf
    }

    /// Deserialize from the start of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, ChatheadError> {
        let b: &[u8; Self::SIZE] = data
            .get(..Self::SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(ChatheadError::InvalidHeader("video chunk header too short"))?;

        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        let i64_at = |i: usize| {
            i64::from_le_bytes([
                b[i],
                b[i + 1],
                b[i + 2],
                b[i + 3],
                b[i + 4],
                b[i + 5],
                b[i + 6],
                b[i + 7],
            ])
        };

        Ok(Self {
            sequence: u32_at(0),
            player_id: u32_at(4),
            width: u32_at(8),
            height: u32_at(12),
            timestamp_ticks: i64_at(16),
            duration_ticks: i64_at(24),
            total_len: u32_at(32),
            chunk_index: u16::from_le_bytes([b[36], b[37]]),
            total_chunks: u16::from_le_bytes([b[38], b[39]]),
        })
    }

    /// Whether `other` describes the same frame (ignoring the index).
    fn frame_matches(&self, other: &Self) -> bool {
        self.player_id == other.player_id
            && self.width == other.width
            && self.height == other.height
            && self.timestamp_ticks == other.timestamp_ticks
            && self.duration_ticks == other.duration_ticks
            && self.total_len == other.total_len
            && self.total_chunks == other.total_chunks
    }
}

// ── Chunking ─────────────────────────────────────────────────────

/// Cut `message` into `(header, bytes)` chunks of at most `chunk_size`.
pub fn chunk_frame(
    message: &VideoUpdateMessage,
    sequence: u32,
    chunk_size: usize,
) -> Result<Vec<(VideoChunkHeader, &[u8])>, ChatheadError> {
    if message.payload.is_empty() {
        return Err(ChatheadError::Encoding("empty encoded frame".into()));
    }
    if chunk_size == 0 {
        return Err(ChatheadError::InvalidHeader("zero chunk size"));
    }
    let total_len = u32::try_from(message.payload.len()).map_err(|_| ChatheadError::PayloadTooLarge {
        size: message.payload.len(),
        max: u32::MAX as usize,
    })?;
    let total_chunks = message.payload.len().div_ceil(chunk_size);
    let total_chunks = u16::try_from(total_chunks).map_err(|_| ChatheadError::PayloadTooLarge {
        size: message.payload.len(),
        max: chunk_size * u16::MAX as usize,
    })?;

    Ok(message
        .payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(idx, data)| {
            let header = VideoChunkHeader {
                sequence,
                player_id: message.player_id,
                width: message.width,
                height: message.height,
                timestamp_ticks: message.timestamp_ticks,
                duration_ticks: message.duration_ticks,
                total_len,
                chunk_index: idx as u16,
                total_chunks,
            };
            (header, data)
        })
        .collect())
}

// ── Reassembler ──────────────────────────────────────────────────

struct Assembly {
    header: VideoChunkHeader,
    data: Vec<u8>,
    received: Vec<bool>,
    remaining: usize,
}

/// Per-sender frame reassembly with sequence-based supersession.
pub struct Reassembler {
    chunk_size: usize,
    max_frame_bytes: usize,
    in_flight: HashMap<u32, Assembly>,
    last_completed: HashMap<u32, u32>,
}

impl Reassembler {
    /// `max_frame_bytes` caps the encoded length a sender may announce.
    pub fn new(chunk_size: usize, max_frame_bytes: usize) -> Self {
        Self {
            chunk_size,
            max_frame_bytes,
            in_flight: HashMap::new(),
            last_completed: HashMap::new(),
        }
    }

    /// Feed one chunk.
    ///
    /// Returns the complete frame once its last missing chunk arrives.
    /// Stale and duplicate chunks yield `Ok(None)`; inconsistent ones are
    /// an error and leave any in-flight frame untouched.
    pub fn accept(
        &mut self,
        header: VideoChunkHeader,
        data: &[u8],
    ) -> Result<Option<VideoUpdateMessage>, ChatheadError> {
        self.validate(&header, data)?;
        let player = header.player_id;

        if let Some(&last) = self.last_completed.get(&player) {
            if !sequence_newer(header.sequence, last) {
                return Ok(None);
            }
        }

        let start_new = match self.in_flight.get(&player) {
            Some(a) if a.header.sequence == header.sequence => {
                if !a.header.frame_matches(&header) {
                    return Err(ChatheadError::ProtocolViolation(
                        "chunk disagrees with its frame",
                    ));
                }
                false
            }
            Some(a) if !sequence_newer(header.sequence, a.header.sequence) => return Ok(None),
            _ => true,
        };

        if start_new {
            let total = header.total_chunks as usize;
            self.in_flight.insert(
                player,
                Assembly {
                    header,
                    data: vec![0u8; header.total_len as usize],
                    received: vec![false; total],
                    remaining: total,
                },
            );
        }

        let Some(assembly) = self.in_flight.get_mut(&player) else {
            return Ok(None);
        };
        let idx = header.chunk_index as usize;
        if assembly.received[idx] {
            return Ok(None);
        }
        let offset = idx * self.chunk_size;
        assembly.data[offset..offset + data.len()].copy_from_slice(data);
        assembly.received[idx] = true;
        assembly.remaining -= 1;

        if assembly.remaining > 0 {
            return Ok(None);
        }

        let Some(done) = self.in_flight.remove(&player) else {
            return Ok(None);
        };
        self.last_completed.insert(player, done.header.sequence);
        Ok(Some(VideoUpdateMessage {
            player_id: player,
            width: done.header.width,
            height: done.header.height,
            timestamp_ticks: done.header.timestamp_ticks,
            duration_ticks: done.header.duration_ticks,
            payload: done.data,
        }))
    }

    /// Drop all state for a sender that left.
    pub fn forget(&mut self, player_id: u32) {
        self.in_flight.remove(&player_id);
        self.last_completed.remove(&player_id);
    }

    /// Drop all state.
    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.last_completed.clear();
    }

    /// Number of frames currently being assembled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn validate(&self, h: &VideoChunkHeader, data: &[u8]) -> Result<(), ChatheadError> {
        let total_len = h.total_len as usize;
        if total_len == 0 || total_len > self.max_frame_bytes {
            return Err(ChatheadError::PayloadTooLarge {
                size: total_len,
                max: self.max_frame_bytes,
            });
        }
        if h.total_chunks as usize != total_len.div_ceil(self.chunk_size) {
            return Err(ChatheadError::InvalidHeader("chunk count does not match length"));
        }
        if h.chunk_index >= h.total_chunks {
            return Err(ChatheadError::InvalidHeader("chunk index out of range"));
        }
        let offset = h.chunk_index as usize * self.chunk_size;
        let expected = (total_len - offset).min(self.chunk_size);
        if data.len() != expected {
            return Err(ChatheadError::FrameSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn message(player_id: u32, len: usize) -> VideoUpdateMessage {
        VideoUpdateMessage {
            player_id,
            width: 8,
            height: 8,
            timestamp_ticks: 1_000,
            duration_ticks: 333_333,
            payload: (0..len).map(|i| (i % 256) as u8).collect(),
        }
    }

    fn feed(r: &mut Reassembler, chunks: &[(VideoChunkHeader, &[u8])]) -> Option<VideoUpdateMessage> {
        let mut out = None;
        for (h, d) in chunks {
            if let Some(m) = r.accept(*h, d).unwrap() {
                out = Some(m);
            }
        }
        out
    }

    #[test]
    fn header_layout_is_40_bytes() {
        let h = VideoChunkHeader {
            sequence: 7,
            player_id: 1,
            width: 640,
            height: 480,
            timestamp_ticks: -5,
            duration_ticks: 333_333,
            total_len: 5000,
            chunk_index: 3,
            total_chunks: 5,
        };
        let bytes = h.encode();
        assert_eq!(bytes.len(), VideoChunkHeader::SIZE);
        assert_eq!(VideoChunkHeader::decode(&bytes).unwrap(), h);
        assert!(VideoChunkHeader::decode(&bytes[..39]).is_err());
    }

    #[test]
    fn chunk_payload_fits_mtu() {
        assert_eq!(CHUNK_PAYLOAD_SIZE, 1144);
        let msg = message(1, 3000);
        let chunks = chunk_frame(&msg, 0, CHUNK_PAYLOAD_SIZE).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|(h, _)| h.total_chunks == 3));
        assert_eq!(chunks[2].1.len(), 3000 - 2 * CHUNK_PAYLOAD_SIZE);
    }

    #[test]
    fn reassembles_out_of_order() {
        let msg = message(2, 100);
        let mut chunks = chunk_frame(&msg, 5, 16).unwrap();
        chunks.reverse();
        let mut r = Reassembler::new(16, 1 << 20);
        assert_eq!(feed(&mut r, &chunks), Some(msg));
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn newer_sequence_supersedes_in_flight_frame() {
        let old = message(1, 64);
        let new = message(1, 48);
        let old_chunks = chunk_frame(&old, 10, 16).unwrap();
        let new_chunks = chunk_frame(&new, 11, 16).unwrap();
        let mut r = Reassembler::new(16, 1 << 20);

        // Half of the old frame, then all of the new one.
        assert!(feed(&mut r, &old_chunks[..2]).is_none());
        assert_eq!(feed(&mut r, &new_chunks), Some(new));
        // Late chunks of the old frame are ignored.
        assert!(feed(&mut r, &old_chunks[2..]).is_none());
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn stale_and_duplicate_chunks_are_dropped() {
        let msg = message(1, 40);
        let chunks = chunk_frame(&msg, 3, 16).unwrap();
        let mut r = Reassembler::new(16, 1 << 20);

        assert!(r.accept(chunks[0].0, chunks[0].1).unwrap().is_none());
        assert!(r.accept(chunks[0].0, chunks[0].1).unwrap().is_none());
        assert!(feed(&mut r, &chunks[1..]).is_some());
        // Whole frame again: already delivered.
        assert!(feed(&mut r, &chunks).is_none());
    }

    #[test]
    fn sequence_wraps() {
        assert!(sequence_newer(0, u32::MAX));
        assert!(sequence_newer(5, 3));
        assert!(!sequence_newer(3, 5));
        assert!(!sequence_newer(4, 4));

        let mut r = Reassembler::new(16, 1 << 20);
        let a = message(1, 10);
        assert!(feed(&mut r, &chunk_frame(&a, u32::MAX, 16).unwrap()).is_some());
        assert!(feed(&mut r, &chunk_frame(&a, 0, 16).unwrap()).is_some());
    }

    #[test]
    fn senders_are_independent() {
        let mut r = Reassembler::new(16, 1 << 20);
        let (first, second) = (message(1, 32), message(2, 32));
        let a = chunk_frame(&first, 9, 16).unwrap();
        let b = chunk_frame(&second, 1, 16).unwrap();
        assert!(r.accept(a[0].0, a[0].1).unwrap().is_none());
        assert!(feed(&mut r, &b).is_some());
        assert!(r.accept(a[1].0, a[1].1).unwrap().is_some());
    }

    #[test]
    fn forget_allows_sequence_restart() {
        let mut r = Reassembler::new(16, 1 << 20);
        let msg = message(3, 20);
        let chunks = chunk_frame(&msg, 50, 16).unwrap();
        assert!(feed(&mut r, &chunks).is_some());
        let restarted = chunk_frame(&msg, 0, 16).unwrap();
        assert!(feed(&mut r, &restarted).is_none());
        r.forget(3);
        assert!(feed(&mut r, &restarted).is_some());
    }

    #[test]
    fn rejects_inconsistent_chunks() {
        let mut r = Reassembler::new(16, 64);
        let msg = message(1, 40);
        let chunks = chunk_frame(&msg, 0, 16).unwrap();
        let (h, d) = chunks[0];

        let mut bad = h;
        bad.total_len = 1000;
        assert!(matches!(r.accept(bad, d), Err(ChatheadError::PayloadTooLarge { .. })));

        let mut bad = h;
        bad.chunk_index = 3;
        assert!(r.accept(bad, d).is_err());

        let mut bad = h;
        bad.total_chunks = 2;
        assert!(r.accept(bad, d).is_err());

        assert!(r.accept(h, &d[..10]).is_err());
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn chunk_that_disagrees_with_frame_is_rejected() {
        let mut r = Reassembler::new(16, 1 << 20);
        let msg = message(1, 40);
        let chunks = chunk_frame(&msg, 0, 16).unwrap();
        r.accept(chunks[0].0, chunks[0].1).unwrap();
        let mut other = chunks[1].0;
        other.width = 16;
        assert!(matches!(
            r.accept(other, chunks[1].1),
            Err(ChatheadError::ProtocolViolation(_))
        ));
        assert!(r.accept(chunks[1].0, chunks[1].1).unwrap().is_none());
        assert!(r.accept(chunks[2].0, chunks[2].1).unwrap().is_some());
    }

    #[test]
    fn empty_frame_cannot_be_chunked() {
        assert!(chunk_frame(&message(1, 0), 0, 16).is_err());
    }
}
