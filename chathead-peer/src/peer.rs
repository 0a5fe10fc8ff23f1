//! Headless peer: synthetic camera, one session, one compositor.
//!
//! The caller owns the frame clock and calls [`Peer::tick`] on it; the
//! capture and network threads run on their own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use chathead_core::{
    CaptureCounters, CaptureProducer, ChatheadError, CompositeReport, Compositor, NetworkSession,
    SessionEvent, SyntheticSource, ZstdEncoder,
};

use crate::config::PeerConfig;
use crate::metrics::SystemMetrics;
use crate::sink::LoggingSink;

// ── Peer ─────────────────────────────────────────────────────────

pub struct Peer {
    session: Arc<NetworkSession>,
    producer: CaptureProducer,
    compositor: Compositor<LoggingSink>,
    status_interval: Option<Duration>,
    last_status: Instant,
    metrics: SystemMetrics,
}

impl Peer {
    /// Bind the session and start capturing.
    ///
    /// Connection problems are not errors here: they arrive as session
    /// events and the peer keeps running solo.
    pub fn start(config: &PeerConfig) -> Result<Self, ChatheadError> {
        let session = Arc::new(NetworkSession::new(config.to_session_config())?);
        session.register_event_callback(|event| match event {
            SessionEvent::ConnectionFailed { .. }
            | SessionEvent::ServerFull
            | SessionEvent::ConnectionLost => {
                warn!(%event, "no session, continuing with the local overlay only");
            }
            _ => {}
        });
        session.setup(config.network.role, &config.network.address)?;

        let capture = config.to_capture_config();
        let fps = config.video.fps.clamp(1, 120);
        let source = SyntheticSource::new(capture.initial_resolution, fps);
        let producer = CaptureProducer::start(
            source,
            ZstdEncoder::new(fps),
            Some(Arc::clone(&session)),
            capture,
        )?;

        let compositor = Compositor::new(LoggingSink::default())
            .with_local_feed(Arc::clone(producer.feed()))
            .with_session(Arc::clone(&session));

        info!(
            role = %config.network.role,
            overlays = compositor.overlay_count(),
            "peer started"
        );
        Ok(Self {
            session,
            producer,
            compositor,
            status_interval: match config.video.status_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            last_status: Instant::now(),
            metrics: SystemMetrics::new(),
        })
    }

    /// One consumer tick.
    pub fn tick(&mut self) -> CompositeReport {
        let report = self.compositor.frame();
        if let Some(every) = self.status_interval {
            if self.last_status.elapsed() >= every {
                self.last_status = Instant::now();
                self.log_status();
            }
        }
        report
    }

    pub fn session(&self) -> &Arc<NetworkSession> {
        &self.session
    }

    pub fn sink(&self) -> &LoggingSink {
        self.compositor.sink()
    }

    pub fn capture_counters(&self) -> CaptureCounters {
        self.producer.counters()
    }

    /// Stop capture first so nothing new is queued, then the session.
    pub fn shutdown(mut self) {
        self.producer.stop();
        self.session.shutdown();
        info!("peer stopped");
    }

    fn log_status(&mut self) {
        let counters = self.producer.counters();
        let load = self.metrics.sample();
        info!(
            phase = %self.session.phase(),
            player_id = ?self.session.player_id(),
            peers = self.session.connected_peers(),
            sent_bps = self.session.bytes_sent_last_second(),
            received_bps = self.session.bytes_received_last_second(),
            captured = counters.captured,
            frames_sent = counters.sent,
            uploads = self.sink().total_uploads(),
            cpu_percent = load.system_cpu_percent,
            process_cpu_percent = load.process_cpu_percent,
            process_mem_mib = load.process_memory / (1024 * 1024),
            mem_used_mib = load.memory_used / (1024 * 1024),
            "status"
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────
