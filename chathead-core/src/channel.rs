//! Per-remote-player frame channels.
//!
//! Every session allocates `max_players - 1` [`PeerChannel`]s up front,
//! one for each player that is not us. The network thread writes decoded
//! frames into a channel; the consumer thread reads them and applies
//! resolution changes.
//!
//! ## Resize handshake
//!
//! ```text
//!  network thread                         consumer thread
//!  ──────────────                         ───────────────
//!  msg dims != slot dims
//!    resize_pending = (w, h)  ──────────► apply_pending_resize()
//!    drop payload                           lock, resize, epoch += 1
//!                                           sink.recreate(w, h)
//!  next msg dims == slot dims  ◄──────────
//!    epoch changed → new decoder
//!    decode, lock, copy, fresh = true
//! ```
//!
//! The network thread never resizes a slot and the consumer never
//! decodes, so a `w2*h2` payload can never land in a `w1*h1` buffer.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::codec::{DecoderFactory, FrameDecoder, ThresholdCell, clear_faint_pixels};
use crate::error::ChatheadError;
use crate::slot::{FrameSlot, ReadGuard};
use crate::types::{PixelFormat, Resolution};
use crate::wire::VideoUpdateMessage;

// ── Mapping ──────────────────────────────────────────────────────

/// Channel index of `remote` as seen by `local`.
///
/// The server (id 0) maps player `p` to `p - 1`. Client `k` gives the
/// server index `k - 1` (the index its own id would have had) and maps
/// every other player `p` to `p - 1`. Self and out-of-range ids have no
/// channel.
pub fn channel_index(local: u32, remote: u32, max_players: u32) -> Option<usize> {
    if remote == local || remote >= max_players || local >= max_players {
        return None;
    }
    let index = if local != 0 && remote == 0 {
        local - 1
    } else {
        remote - 1
    };
    Some(index as usize)
}

/// Inverse of [`channel_index`].
pub fn player_for_channel(local: u32, index: usize, max_players: u32) -> Option<u32> {
    let candidate = u32::try_from(index).ok()?.checked_add(1)?;
    if local >= max_players || candidate >= max_players {
        return None;
    }
    if local != 0 && candidate == local {
        Some(0)
    } else {
        Some(candidate)
    }
}

// ── DecoderState ─────────────────────────────────────────────────

/// A decoder bound to one channel at one resolution. Owned by the
/// network thread.
pub struct DecoderState {
    decoder: Box<dyn FrameDecoder>,
    epoch: u32,
    resolution: Resolution,
}

/// One decoder slot per channel.
pub struct DecoderSet {
    states: Vec<Option<DecoderState>>,
}

impl DecoderSet {
    pub fn new(channels: usize) -> Self {
        Self {
            states: (0..channels).map(|_| None).collect(),
        }
    }

    /// Drop the decoder of `index`, forcing re-creation on next use.
    pub fn reset(&mut self, index: usize) {
        if let Some(state) = self.states.get_mut(index) {
            *state = None;
        }
    }

    pub fn is_initialized(&self, index: usize) -> bool {
        matches!(self.states.get(index), Some(Some(_)))
    }
}

// ── IngestOutcome ────────────────────────────────────────────────

/// What happened to one inbound video update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Decoded and copied into the slot.
    Ingested,
    /// Dimensions differ from the slot; a resize is now pending and the
    /// payload was dropped.
    ResizeRequested(Resolution),
    /// Decoded, but the consumer held the slot. Frame dropped.
    Contended,
    /// Zero, oversized or inconsistent dimensions or decoded length.
    Malformed,
    /// The decoder could not be created or rejected the payload.
    DecodeFailed,
    /// Sender id has no channel (our own id or out of range).
    UnknownPlayer,
}

impl IngestOutcome {
    /// Whether decoded pixels are available in the scratch buffer.
    pub fn decoded(self) -> bool {
        matches!(self, IngestOutcome::Ingested | IngestOutcome::Contended)
    }
}

// ── PeerChannel ──────────────────────────────────────────────────

/// Frame state for one remote player.
pub struct PeerChannel {
    index: usize,
    slot: FrameSlot,
    fresh: AtomicBool,
    /// Packed [`Resolution`]; 0 means no resize pending.
    resize_pending: AtomicU64,
    /// Bumped by every applied resize; a decoder from an older epoch is
    /// rebuilt before use.
    decoder_epoch: AtomicU32,
}

impl PeerChannel {
    fn new(index: usize, initial: Resolution, format: PixelFormat) -> Result<Self, ChatheadError> {
        Ok(Self {
            index,
            slot: FrameSlot::new(initial.width, initial.height, format)?,
            fresh: AtomicBool::new(false),
            resize_pending: AtomicU64::new(0),
            decoder_epoch: AtomicU32::new(0),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    /// A frame arrived that the consumer has not uploaded yet.
    pub fn has_fresh_frame(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    /// Resolution the network thread asked the consumer to switch to.
    pub fn pending_resize(&self) -> Option<Resolution> {
        match self.resize_pending.load(Ordering::Acquire) {
            0 => None,
            packed => Some(Resolution::unpack(packed)),
        }
    }

    pub fn decoder_epoch(&self) -> u32 {
        self.decoder_epoch.load(Ordering::Acquire)
    }

    /// Network thread: decode `msg` and publish it into the slot.
    ///
    /// `scratch` receives the decoded pixels whenever
    /// [`IngestOutcome::decoded`] is true, so the caller can hand them to
    /// a frame callback. With a `threshold`, pixels of alpha formats whose
    /// channels all fall below it are cleared before publishing.
    pub fn ingest(
        &self,
        msg: &VideoUpdateMessage,
        decoder: &mut Option<DecoderState>,
        factory: &dyn DecoderFactory,
        scratch: &mut Vec<u8>,
        threshold: Option<u8>,
    ) -> IngestOutcome {
        let incoming = Resolution::new(msg.width, msg.height);
        if incoming != self.slot.dimensions() {
            self.request_resize(incoming);
            return IngestOutcome::ResizeRequested(incoming);
        }

        let epoch = self.decoder_epoch();
        let stale = decoder
            .as_ref()
            .is_none_or(|d| d.epoch != epoch || d.resolution != incoming);
        if stale {
            match factory.create(msg.width, msg.height, self.slot.format()) {
                Ok(d) => {
                    debug!(channel = self.index, %incoming, epoch, "decoder initialised");
                    *decoder = Some(DecoderState {
                        decoder: d,
                        epoch,
                        resolution: incoming,
                    });
                }
                Err(e) => {
                    debug!(channel = self.index, error = %e, "decoder creation failed");
                    return IngestOutcome::DecodeFailed;
                }
            }
        }
        let Some(state) = decoder.as_mut() else {
            return IngestOutcome::DecodeFailed;
        };

        *scratch = match state.decoder.decode(&msg.payload, msg.width, msg.height) {
            Ok(pixels) => pixels,
            Err(e) => {
                debug!(channel = self.index, error = %e, "decode failed, frame skipped");
                return IngestOutcome::DecodeFailed;
            }
        };

        let expected = self.slot.format().frame_len(msg.width, msg.height);
        if scratch.len() != expected {
            warn!(
                channel = self.index,
                expected,
                actual = scratch.len(),
                "decoded frame has wrong size, dropped"
            );
            return IngestOutcome::Malformed;
        }
        if let Some(t) = threshold.filter(|_| self.slot.format().has_alpha()) {
            clear_faint_pixels(scratch, t);
        }

        let Some(mut guard) = self.slot.try_acquire_write() else {
            debug!(channel = self.index, "slot busy, frame dropped");
            return IngestOutcome::Contended;
        };
        // The consumer may have resized between the check above and the
        // lock; the guard's view is authoritative.
        if guard.resolution() != incoming {
            drop(guard);
            self.request_resize(incoming);
            return IngestOutcome::ResizeRequested(incoming);
        }
        if guard.copy_from(scratch).is_err() {
            return IngestOutcome::Malformed;
        }
        // Any pending resize is obsolete now that the sender is back at
        // the slot's size.
        self.resize_pending.store(0, Ordering::Release);
        self.fresh.store(true, Ordering::Release);
        IngestOutcome::Ingested
    }

    /// Consumer thread: perform a pending resize if the slot is free.
    ///
    /// Returns the new resolution when a resize happened. `Ok(None)`
    /// means nothing was pending or the slot was busy (retry next cycle).
    pub fn apply_pending_resize(&self) -> Result<Option<Resolution>, ChatheadError> {
        if self.resize_pending.load(Ordering::Acquire) == 0 {
            return Ok(None);
        }
        let Some(mut guard) = self.slot.try_acquire_write() else {
            return Ok(None);
        };
        let packed = self.resize_pending.swap(0, Ordering::AcqRel);
        if packed == 0 {
            return Ok(None);
        }
        let target = Resolution::unpack(packed);

        if let Err(e) = guard.resize(target.width, target.height) {
            // Keep the request unless a newer one replaced it meanwhile.
            let _ = self.resize_pending.compare_exchange(
                0,
                packed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            return Err(e);
        }
        self.decoder_epoch.fetch_add(1, Ordering::AcqRel);
        self.fresh.store(false, Ordering::Release);
        debug!(channel = self.index, resolution = %target, "slot resized");
        Ok(Some(target))
    }

    /// Consumer thread: take read access if a fresh frame is waiting.
    ///
    /// The fresh flag is cleared while the guard is held, so a frame
    /// published after this call is never lost.
    pub fn take_fresh_frame(&self) -> Option<ReadGuard<'_>> {
        if !self.has_fresh_frame() {
            return None;
        }
        let guard = self.slot.try_acquire_read()?;
        self.fresh.store(false, Ordering::Release);
        Some(guard)
    }

    /// Forget everything about the player that owned this channel.
    pub fn reset(&self) {
        self.fresh.store(false, Ordering::Release);
        self.resize_pending.store(0, Ordering::Release);
        self.decoder_epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn request_resize(&self, to: Resolution) {
        let previous = self.resize_pending.swap(to.pack(), Ordering::AcqRel);
        if previous != to.pack() {
            debug!(channel = self.index, resolution = %to, "resize requested");
        }
    }
}

// ── PeerChannels ─────────────────────────────────────────────────

/// The fixed set of channels for a session.
pub struct PeerChannels {
    channels: Vec<PeerChannel>,
    max_players: u32,
    format: PixelFormat,
    /// Largest accepted frame edge.
    max_dimension: u32,
    /// Decode-side keying threshold.
    decoding_threshold: ThresholdCell,
}

impl PeerChannels {
    /// Allocate `max_players - 1` channels at `initial` resolution.
    pub fn new(
        max_players: u32,
        initial: Resolution,
        format: PixelFormat,
        max_dimension: u32,
    ) -> Result<Self, ChatheadError> {
        if max_players < 2 {
            return Err(ChatheadError::Other(format!(
                "a session needs at least 2 players, got {max_players}"
            )));
        }
        let channels = (0..(max_players - 1) as usize)
            .map(|i| PeerChannel::new(i, initial, format))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            channels,
            max_players,
            format,
            max_dimension,
            decoding_threshold: ThresholdCell::new(None),
        })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn max_players(&self) -> u32 {
        self.max_players
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn get(&self, index: usize) -> Option<&PeerChannel> {
        self.channels.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerChannel> {
        self.channels.iter()
    }

    /// Clear near-black pixels of decoded frames (`None` turns it off).
    pub fn set_decoding_threshold(&self, threshold: Option<u8>) {
        self.decoding_threshold.set(threshold);
    }

    pub fn decoding_threshold(&self) -> Option<u8> {
        self.decoding_threshold.get()
    }

    /// Channel holding `remote`'s frames as seen by `local`.
    pub fn for_player(&self, local: u32, remote: u32) -> Option<&PeerChannel> {
        channel_index(local, remote, self.max_players).and_then(|i| self.channels.get(i))
    }

    /// Network thread entry point for one reassembled update.
    pub fn ingest(
        &self,
        local: u32,
        msg: &VideoUpdateMessage,
        decoders: &mut DecoderSet,
        factory: &dyn DecoderFactory,
        scratch: &mut Vec<u8>,
    ) -> IngestOutcome {
        let Some(index) = channel_index(local, msg.player_id, self.max_players) else {
            debug!(local, remote = msg.player_id, "video update for unknown player dropped");
            return IngestOutcome::UnknownPlayer;
        };
        if !self.acceptable(msg.width, msg.height) {
            warn!(
                player_id = msg.player_id,
                width = msg.width,
                height = msg.height,
                "video update with invalid dimensions dropped"
            );
            return IngestOutcome::Malformed;
        }
        let (Some(channel), Some(decoder)) = (self.channels.get(index), decoders.states.get_mut(index))
        else {
            return IngestOutcome::UnknownPlayer;
        };
        channel.ingest(msg, decoder, factory, scratch, self.decoding_threshold())
    }

    /// Apply every pending resize, calling `on_resize` for each success.
    ///
    /// Allocation failures are logged and retried next cycle.
    pub fn apply_pending_resizes(&self, mut on_resize: impl FnMut(usize, Resolution)) -> usize {
        let mut applied = 0;
        for channel in &self.channels {
            match channel.apply_pending_resize() {
                Ok(Some(res)) => {
                    on_resize(channel.index, res);
                    applied += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(channel = channel.index, error = %e, "resize failed, will retry"),
            }
        }
        applied
    }

    /// Reset every channel (session end).
    pub fn reset_all(&self) {
        self.channels.iter().for_each(PeerChannel::reset);
    }

    fn acceptable(&self, width: u32, height: u32) -> bool {
        let edge = 1..=self.max_dimension;
        edge.contains(&width) && edge.contains(&height)
    }
}

// ── Tests ────────────────────────────────────────────────────────
