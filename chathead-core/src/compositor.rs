//! Consumer-side frame pump.
//!
//! Call [`Compositor::frame`] once per tick of whatever clock drives the
//! renderer. Every slot interaction is a try-acquire: a busy slot is
//! skipped and picked up again next tick, so the consumer never waits on
//! the capture or network threads.
//!
//! Overlay 0 is the local player; overlay `i + 1` shows peer channel `i`.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::capture::LocalFeed;
use crate::error::ChatheadError;
use crate::session::NetworkSession;
use crate::slot::{FrameSnapshot, ReadGuard};
use crate::types::Resolution;

/// Overlay index of the local player.
pub const LOCAL_OVERLAY: usize = 0;

/// Overlay index of peer channel `channel`.
pub fn peer_overlay(channel: usize) -> usize {
    channel + 1
}

/// The renderer that displays the overlays.
pub trait OverlaySink {
    /// (Re)create the texture backing `overlay` at the given size.
    fn recreate(&mut self, overlay: usize, width: u32, height: u32) -> Result<(), ChatheadError>;

    /// Replace the contents of `overlay` with tightly packed `pixels`.
    fn upload(&mut self, overlay: usize, pixels: &[u8], width: u32, height: u32)
    -> Result<(), ChatheadError>;
}

/// What one [`Compositor::frame`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositeReport {
    /// Peer slots resized this tick.
    pub resized: usize,
    pub local_uploaded: bool,
    pub peers_uploaded: usize,
    /// Fresh frames left for next tick because a slot was busy.
    pub skipped_busy: usize,
}

impl CompositeReport {
    pub fn uploads(&self) -> usize {
        self.peers_uploaded + usize::from(self.local_uploaded)
    }
}

pub struct Compositor<S> {
    sink: S,
    session: Option<Arc<NetworkSession>>,
    local: Option<Arc<LocalFeed>>,
    /// Last size each overlay was created at.
    overlays: Vec<Option<Resolution>>,
}

impl<S: OverlaySink> Compositor<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            session: None,
            local: None,
            overlays: vec![None],
        }
    }

    /// Show the session's remote players.
    pub fn with_session(mut self, session: Arc<NetworkSession>) -> Self {
        self.overlays.resize(1 + session.channels().len(), None);
        self.session = Some(session);
        self
    }

    /// Show the local camera.
    pub fn with_local_feed(mut self, feed: Arc<LocalFeed>) -> Self {
        self.local = Some(feed);
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Number of overlays (local plus one per peer channel).
    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }

    /// Run one consumer tick.
    pub fn frame(&mut self) -> CompositeReport {
        let mut report = CompositeReport::default();
        let Self {
            sink,
            session,
            local,
            overlays,
        } = self;

        if let Some(session) = session.as_ref() {
            session.wake();

            let channels = session.channels();
            report.resized = channels.apply_pending_resizes(|index, res| {
                let overlay = peer_overlay(index);
                match sink.recreate(overlay, res.width, res.height) {
                    Ok(()) => overlays[overlay] = Some(res),
                    Err(e) => {
                        warn!(overlay, error = %e, "overlay recreate failed");
                        overlays[overlay] = None;
                    }
                }
            });

            for channel in channels.iter() {
                if !channel.has_fresh_frame() {
                    continue;
                }
                match channel.take_fresh_frame() {
                    Some(guard) => {
                        if present(sink, overlays, peer_overlay(channel.index()), &guard) {
                            report.peers_uploaded += 1;
                        }
                    }
                    None => report.skipped_busy += 1,
                }
            }
        }

        if let Some(feed) = local.as_ref() {
            if feed.is_updated() {
                match feed.take_updated_frame() {
                    Some(guard) => report.local_uploaded = present(sink, overlays, LOCAL_OVERLAY, &guard),
                    None => report.skipped_busy += 1,
                }
            }
        }

        if report.uploads() > 0 || report.resized > 0 {
            trace!(?report, "composited");
        }
        report
    }

    /// Copy of the latest local frame, or `None` if busy or never written.
    pub fn local_frame_snapshot(&self) -> Option<FrameSnapshot> {
        self.local.as_ref()?.snapshot()
    }

    /// Copy of `player_id`'s latest frame.
    ///
    /// `None` outside a session, for our own id, when the slot is busy,
    /// or before that player's first frame.
    pub fn peer_frame_snapshot(&self, player_id: u32) -> Option<FrameSnapshot> {
        let session = self.session.as_ref()?;
        let local = session.player_id()?;
        let channel = session.channels().for_player(local, player_id)?;
        let guard = channel.slot().try_acquire_read()?;
        FrameSnapshot::capture(&guard)
    }
}

/// Upload `guard` to `overlay`, recreating it first if the size changed.
fn present<S: OverlaySink>(
    sink: &mut S,
    overlays: &mut [Option<Resolution>],
    overlay: usize,
    guard: &ReadGuard<'_>,
) -> bool {
    let res = guard.resolution();
    if overlays[overlay] != Some(res) {
        if let Err(e) = sink.recreate(overlay, res.width, res.height) {
            warn!(overlay, error = %e, "overlay recreate failed");
            return false;
        }
        debug!(overlay, resolution = %res, "overlay created");
        overlays[overlay] = Some(res);
    }
    match sink.upload(overlay, guard.pixels(), res.width, res.height) {
        Ok(()) => true,
        Err(e) => {
            warn!(overlay, error = %e, "overlay upload failed");
            false
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DecoderSet;
    use crate::codec::{FrameEncoder, ZstdDecoderFactory, ZstdEncoder};
    use crate::config::{CaptureConfig, SessionConfig};
    use crate::types::{CapturedFrame, PixelFormat};
    use crate::wire::VideoUpdateMessage;

    #[derive(Debug, PartialEq, Eq)]
    enum Call {
        Recreate(usize, u32, u32),
        Upload(usize, u32, u32, u8),
    }

    #[derive(Default)]
    struct Recording(Vec<Call>);

    impl OverlaySink for Recording {
        fn recreate(&mut self, overlay: usize, width: u32, height: u32) -> Result<(), ChatheadError> {
            self.0.push(Call::Recreate(overlay, width, height));
            Ok(())
        }

        fn upload(
            &mut self,
            overlay: usize,
            pixels: &[u8],
            width: u32,
            height: u32,
        ) -> Result<(), ChatheadError> {
            assert_eq!(pixels.len(), (width * height * 4) as usize);
            self.0.push(Call::Upload(overlay, width, height, pixels[0]));
            Ok(())
        }
    }

    fn update(player_id: u32, w: u32, h: u32, fill: u8) -> VideoUpdateMessage {
        let pixels = vec![fill; (w * h * 4) as usize];
        let unit = ZstdEncoder::default().encode(&pixels, w, h).unwrap().unwrap();
        VideoUpdateMessage {
            player_id,
            width: w,
            height: h,
            timestamp_ticks: unit.timestamp_ticks,
            duration_ticks: unit.duration_ticks,
            payload: unit.data,
        }
    }

    fn session() -> Arc<NetworkSession> {
        let config = SessionConfig {
            initial_resolution: Resolution::new(4, 4),
            ..SessionConfig::default()
        };
        Arc::new(NetworkSession::new(config).unwrap())
    }

    #[test]
    fn uploads_local_frame_once() {
        let feed = Arc::new(
            LocalFeed::new(&CaptureConfig {
                initial_resolution: Resolution::new(2, 2),
                ..CaptureConfig::default()
            })
            .unwrap(),
        );
        let mut comp = Compositor::new(Recording::default()).with_local_feed(Arc::clone(&feed));
        assert_eq!(comp.frame(), CompositeReport::default());
        assert!(comp.local_frame_snapshot().is_none());

        let frame = CapturedFrame::packed(2, 2, PixelFormat::Bgra8, vec![5; 16]);
        assert!(feed.publish(&frame).unwrap());
        let report = comp.frame();
        assert!(report.local_uploaded);
        assert!(!feed.is_updated());
        assert_eq!(comp.frame().uploads(), 0);

        // A larger capture recreates the overlay.
        let frame = CapturedFrame::packed(4, 1, PixelFormat::Bgra8, vec![8; 16]);
        assert!(feed.publish(&frame).unwrap());
        assert!(comp.frame().local_uploaded);
        assert_eq!(
            comp.sink().0,
            vec![
                Call::Recreate(LOCAL_OVERLAY, 2, 2),
                Call::Upload(LOCAL_OVERLAY, 2, 2, 5),
                Call::Recreate(LOCAL_OVERLAY, 4, 1),
                Call::Upload(LOCAL_OVERLAY, 4, 1, 8),
            ]
        );
        assert_eq!(comp.local_frame_snapshot().unwrap().pixels, vec![8; 16]);
    }

    #[test]
    fn peer_frames_are_uploaded_and_resized() {
        let session = session();
        let channels = Arc::clone(session.channels());
        let mut decoders = DecoderSet::new(channels.len());
        let mut scratch = Vec::new();
        let factory = ZstdDecoderFactory;
        let mut comp = Compositor::new(Recording::default()).with_session(Arc::clone(&session));
        assert_eq!(comp.overlay_count(), 4);

        // Server view: player 2 lands on channel 1, overlay 2.
        let outcome = channels.ingest(0, &update(2, 4, 4, 33), &mut decoders, &factory, &mut scratch);
        assert!(outcome.decoded());
        let report = comp.frame();
        assert_eq!(report.peers_uploaded, 1);
        assert_eq!(
            comp.sink().0,
            vec![Call::Recreate(2, 4, 4), Call::Upload(2, 4, 4, 33)]
        );

        // Nothing new: no upload.
        assert_eq!(comp.frame().uploads(), 0);

        // Player 2 switches to 8x2.
        channels.ingest(0, &update(2, 8, 2, 44), &mut decoders, &factory, &mut scratch);
        let report = comp.frame();
        assert_eq!(report.resized, 1);
        assert_eq!(report.peers_uploaded, 0);
        channels.ingest(0, &update(2, 8, 2, 66), &mut decoders, &factory, &mut scratch);
        assert_eq!(comp.frame().peers_uploaded, 1);

        let calls = comp.into_sink().0;
        assert_eq!(
            &calls[2..],
            &[Call::Recreate(2, 8, 2), Call::Upload(2, 8, 2, 66)]
        );
    }

    #[test]
    fn busy_peer_slot_is_retried_next_tick() {
        let session = session();
        let channels = Arc::clone(session.channels());
        let mut decoders = DecoderSet::new(channels.len());
        let mut scratch = Vec::new();
        channels.ingest(0, &update(1, 4, 4, 1), &mut decoders, &ZstdDecoderFactory, &mut scratch);

        let mut comp = Compositor::new(Recording::default()).with_session(Arc::clone(&session));
        let channel = channels.get(0).unwrap();
        let held = channel.slot().try_acquire_write().unwrap();
        let report = comp.frame();
        assert_eq!(report.skipped_busy, 1);
        assert!(channel.has_fresh_frame());
        drop(held);
        assert_eq!(comp.frame().peers_uploaded, 1);
    }

    #[test]
    fn peer_snapshot_needs_a_session_id() {
        let session = session();
        let comp = Compositor::new(Recording::default()).with_session(session);
        assert!(comp.peer_frame_snapshot(1).is_none());
        assert!(comp.local_frame_snapshot().is_none());
    }
}
