//! Peer-to-peer session over UDP.
//!
//! A [`NetworkSession`] owns one UDP socket and a dedicated worker
//! thread named `network`. The worker hosts a single-threaded Tokio
//! runtime for its socket and timers and does three things:
//!
//! - on every [`wake`](NetworkSession::wake) it drains all pending
//!   datagrams, handling control messages and feeding video chunks into
//!   the [`PeerChannels`];
//! - it sends the encoded frames queued by [`send`](NetworkSession::send);
//! - on a short timer it retries connection attempts, sends heartbeats
//!   and expires silent peers.
//!
//! The topology is a star: the server is player 0 and relays every
//! client's video to the other clients. Nothing here blocks the caller
//! beyond `setup` (socket bind) and `shutdown` (thread join).

mod event;
mod phase;
mod roster;
mod throttle;
mod worker;

pub use event::{Role, SessionEvent};
pub use phase::SessionPhase;
pub use roster::{Admission, Roster, RosterEntry};
pub use throttle::SendThrottle;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tracing::{info, trace, warn};

use crate::channel::PeerChannels;
use crate::codec::{DecoderFactory, ZstdDecoderFactory};
use crate::config::SessionConfig;
use crate::error::ChatheadError;
use crate::wire::VideoUpdateMessage;

use worker::Worker;

const NO_PLAYER: u32 = u32::MAX;

// ── Callbacks ────────────────────────────────────────────────────

/// A decoded remote frame, lent to the frame callback.
#[derive(Debug, Clone, Copy)]
pub struct RemoteFrame<'a> {
    pub player_id: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp_ticks: i64,
    /// Tightly packed pixels, `width * height * bpp` bytes.
    pub pixels: &'a [u8],
}

/// Invoked on the network thread for every decoded remote frame. Must
/// not block.
pub type FrameCallback = Box<dyn Fn(&RemoteFrame<'_>) + Send + Sync>;

/// Invoked on the network thread for every [`SessionEvent`].
pub type EventCallback = Box<dyn Fn(&SessionEvent) + Send + Sync>;

/// An encoded frame waiting for the network thread.
pub(crate) struct Outbound {
    pub message: VideoUpdateMessage,
    pub broadcast: bool,
}

// ── SessionShared ────────────────────────────────────────────────

/// State shared between the session handle and its worker.
pub(crate) struct SessionShared {
    pub config: SessionConfig,
    pub channels: Arc<PeerChannels>,
    pub decoder_factory: Arc<dyn DecoderFactory>,
    pub throttle: SendThrottle,
    pub wake: Notify,
    pub stay_alive: AtomicBool,
    role: AtomicU8,
    phase: AtomicU8,
    player_id: AtomicU32,
    connected_peers: AtomicU32,
    connected_to_server: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    outbound: RwLock<Option<mpsc::Sender<Outbound>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    frame_callback: RwLock<Option<FrameCallback>>,
    event_callback: RwLock<Option<EventCallback>>,
}

impl SessionShared {
    pub fn player_id(&self) -> Option<u32> {
        match self.player_id.load(Ordering::Acquire) {
            NO_PLAYER => None,
            id => Some(id),
        }
    }

    pub fn set_player_id(&self, id: Option<u32>) {
        self.player_id
            .store(id.unwrap_or(NO_PLAYER), Ordering::Release);
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase.code(), Ordering::Release);
    }

    pub fn set_connected_peers(&self, n: u32) {
        self.connected_peers.store(n, Ordering::Release);
    }

    pub fn connected_peers(&self) -> u32 {
        self.connected_peers.load(Ordering::Acquire)
    }

    pub fn set_connected_to_server(&self, connected: bool) {
        self.connected_to_server.store(connected, Ordering::Release);
    }

    pub fn set_byte_rates(&self, sent: u64, received: u64) {
        self.bytes_sent.store(sent, Ordering::Relaxed);
        self.bytes_received.store(received, Ordering::Relaxed);
    }

    /// Log `event` and hand it to the registered callback.
    pub fn emit(&self, event: SessionEvent) {
        info!(%event, "session event");
        if let Some(cb) = read(&self.event_callback).as_ref() {
            cb(&event);
        }
    }

    pub fn deliver_frame(&self, frame: &RemoteFrame<'_>) {
        if let Some(cb) = read(&self.frame_callback).as_ref() {
            cb(frame);
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ── NetworkSession ───────────────────────────────────────────────

/// Handle to a session. Share it between threads with `Arc`.
pub struct NetworkSession {
    shared: Arc<SessionShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkSession {
    /// Create an idle session decoding with the zstd reference codec.
    pub fn new(config: SessionConfig) -> Result<Self, ChatheadError> {
        Self::with_decoder_factory(config, Arc::new(ZstdDecoderFactory))
    }

    /// Create an idle session. Peer channels are allocated here, once,
    /// for every possible remote player.
    pub fn with_decoder_factory(
        config: SessionConfig,
        decoder_factory: Arc<dyn DecoderFactory>,
    ) -> Result<Self, ChatheadError> {
        config.validate()?;
        let channels = PeerChannels::new(
            config.max_players,
            config.initial_resolution,
            config.pixel_format,
            config.max_frame_dimension,
        )?;
        channels.set_decoding_threshold(config.decoding_threshold);
        let throttle = SendThrottle::new(config.send_interval);

        Ok(Self {
            shared: Arc::new(SessionShared {
                config,
                channels: Arc::new(channels),
                decoder_factory,
                throttle,
                wake: Notify::new(),
                stay_alive: AtomicBool::new(false),
                role: AtomicU8::new(0),
                phase: AtomicU8::new(SessionPhase::Idle.code()),
                player_id: AtomicU32::new(NO_PLAYER),
                connected_peers: AtomicU32::new(0),
                connected_to_server: AtomicBool::new(false),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                outbound: RwLock::new(None),
                local_addr: RwLock::new(None),
                frame_callback: RwLock::new(None),
                event_callback: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Open the socket and start the worker thread.
    ///
    /// As server, `address` is the local bind address (empty means all
    /// interfaces on the configured port). As client, it is the server
    /// to connect to; a bare host uses the configured port. Bind and
    /// spawn failures are the only errors; an unreachable server is
    /// reported later as [`SessionEvent::ConnectionFailed`].
    pub fn setup(&self, role: Role, address: &str) -> Result<(), ChatheadError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(ChatheadError::ProtocolViolation("session already running"));
        }
        let config = &self.shared.config;

        let (bind_addr, server_addr) = match role {
            Role::Server if address.trim().is_empty() => {
                (SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port), None)
            }
            Role::Server => (resolve(address, config.port)?, None),
            Role::Client => {
                let server = resolve(address, config.port)?;
                (unspecified_like(&server), Some(server))
            }
        };

        let std_socket = std::net::UdpSocket::bind(bind_addr)?;
        std_socket.set_nonblocking(true)?;
        let local = std_socket.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let socket = {
            let _enter = runtime.enter();
            tokio::net::UdpSocket::from_std(std_socket)?
        };
        let (tx, rx) = mpsc::channel(config.outbound_queue);

        let shared = &self.shared;
        shared.role.store(role.code(), Ordering::Release);
        shared.set_player_id(matches!(role, Role::Server).then_some(0));
        shared.set_connected_peers(0);
        shared.set_connected_to_server(false);
        shared.set_byte_rates(0, 0);
        shared.throttle.reset();
        shared.channels.reset_all();
        shared.stay_alive.store(true, Ordering::Release);
        *write(&shared.outbound) = Some(tx);
        *write(&shared.local_addr) = Some(local);

        let task = Worker::new(Arc::clone(shared), socket, rx, role, server_addr);
        let spawned = thread::Builder::new()
            .name("network".into())
            .spawn(move || runtime.block_on(task.run()));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!(%role, %local, "network session started");
                Ok(())
            }
            Err(e) => {
                shared.stay_alive.store(false, Ordering::Release);
                shared.role.store(0, Ordering::Release);
                shared.set_player_id(None);
                *write(&shared.outbound) = None;
                *write(&shared.local_addr) = None;
                Err(e.into())
            }
        }
    }

    /// Ask the worker to run one inbound dispatch pass.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// Stop the worker, say goodbye to peers and close the socket.
    ///
    /// Idempotent; does nothing when `setup` never succeeded.
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        self.shared.stay_alive.store(false, Ordering::Release);
        self.shared.wake.notify_one();
        if handle.join().is_err() {
            warn!("network worker panicked");
        }

        *write(&self.shared.outbound) = None;
        *write(&self.shared.local_addr) = None;
        self.shared.set_player_id(None);
        self.shared.set_connected_peers(0);
        self.shared.set_connected_to_server(false);
        self.shared.set_phase(SessionPhase::Idle);
        self.shared.role.store(0, Ordering::Release);
        self.shared.channels.reset_all();
        info!("network session stopped");
    }

    /// Whether the send throttle allows another frame now.
    pub fn can_send(&self) -> bool {
        self.shared.throttle.can_send()
    }

    pub fn set_send_interval(&self, interval: Duration) {
        self.shared.throttle.set_interval(interval);
    }

    pub fn send_interval(&self) -> Duration {
        self.shared.throttle.interval()
    }

    /// Change the keying threshold applied to decoded peer frames.
    pub fn set_decoding_threshold(&self, threshold: Option<u8>) {
        self.shared.channels.set_decoding_threshold(threshold);
    }

    pub fn decoding_threshold(&self) -> Option<u8> {
        self.shared.channels.decoding_threshold()
    }

    /// Queue an encoded frame for the network thread.
    ///
    /// With `broadcast` the frame reaches every other player (a client's
    /// frame is relayed by the server). Without it a client's frame goes
    /// to the server only; the server has no single recipient and
    /// rejects non-broadcast sends. Returns whether the frame was
    /// accepted; only accepted frames restart the send interval. A frame
    /// is refused while there is nobody to send it to: a client not yet
    /// connected, or a server no client has joined. The sender id is
    /// filled in by the worker.
    pub fn send(&self, message: VideoUpdateMessage, broadcast: bool) -> bool {
        if !self.shared.stay_alive.load(Ordering::Acquire) {
            return false;
        }
        if self.role() == Some(Role::Server) && !broadcast {
            return false;
        }
        if !self.is_connected() || self.player_id().is_none() {
            trace!("no recipients, frame refused");
            return false;
        }
        let outbound = read(&self.shared.outbound);
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(Outbound { message, broadcast }) {
            Ok(()) => {
                self.shared.throttle.record_send();
                true
            }
            Err(_) => {
                trace!("outbound queue full, frame dropped");
                false
            }
        }
    }

    /// Server: at least one client joined. Client: accepted by a server.
    pub fn is_connected(&self) -> bool {
        match self.role() {
            Some(Role::Server) => self.shared.connected_peers() > 0,
            Some(Role::Client) => self.shared.connected_to_server.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Our player id: 0 for the server, assigned on connect for clients.
    pub fn player_id(&self) -> Option<u32> {
        self.shared.player_id()
    }

    pub fn role(&self) -> Option<Role> {
        Role::from_code(self.shared.role.load(Ordering::Acquire))
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_code(self.shared.phase.load(Ordering::Acquire))
    }

    /// Other players currently in the session.
    pub fn connected_peers(&self) -> u32 {
        self.shared.connected_peers()
    }

    /// Bound socket address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *read(&self.shared.local_addr)
    }

    pub fn channels(&self) -> &Arc<PeerChannels> {
        &self.shared.channels
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn bytes_sent_last_second(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received_last_second(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    /// Replace the frame callback.
    pub fn register_frame_callback(&self, callback: impl Fn(&RemoteFrame<'_>) + Send + Sync + 'static) {
        *write(&self.shared.frame_callback) = Some(Box::new(callback));
    }

    /// Replace the event callback.
    pub fn register_event_callback(&self, callback: impl Fn(&SessionEvent) + Send + Sync + 'static) {
        *write(&self.shared.event_callback) = Some(Box::new(callback));
    }
}

impl Drop for NetworkSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Address helpers ──────────────────────────────────────────────

/// Resolve `address`, appending `default_port` when it has none.
fn resolve(address: &str, default_port: u16) -> Result<SocketAddr, ChatheadError> {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let resolved = match address.to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(_) => (address, default_port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next()),
    };
    resolved.ok_or_else(|| ChatheadError::AddressResolution(address.to_string()))
}

/// Any-port bind address of the same family as `remote`.
fn unspecified_like(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> VideoUpdateMessage {
        VideoUpdateMessage {
            player_id: 0,
            width: 2,
            height: 2,
            timestamp_ticks: 0,
            duration_ticks: 0,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn resolve_variants() {
        assert_eq!(resolve("127.0.0.1:4000", 1).unwrap(), "127.0.0.1:4000".parse().unwrap());
        assert_eq!(resolve("127.0.0.1", 23000).unwrap(), "127.0.0.1:23000".parse().unwrap());
        assert_eq!(resolve("::1", 5).unwrap(), "[::1]:5".parse().unwrap());
        assert_eq!(resolve("localhost", 23000).unwrap().port(), 23000);
    }

    #[test]
    fn unspecified_matches_family() {
        let v4: SocketAddr = "10.0.0.1:23000".parse().unwrap();
        assert!(unspecified_like(&v4).is_ipv4());
        let v6: SocketAddr = "[::1]:23000".parse().unwrap();
        assert!(unspecified_like(&v6).is_ipv6());
    }

    #[test]
    fn idle_session_rejects_sends() {
        let session = NetworkSession::new(SessionConfig::default()).unwrap();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.role().is_none());
        assert!(!session.is_connected());
        assert!(session.can_send());
        assert!(!session.send(message(), true));
        assert_eq!(session.channels().len(), 3);
        // Shutdown before setup is a no-op.
        session.shutdown();
        session.shutdown();
    }

    #[test]
    fn decoding_threshold_follows_config() {
        let session = NetworkSession::new(SessionConfig::default()).unwrap();
        assert_eq!(session.decoding_threshold(), Some(12));
        session.set_decoding_threshold(Some(40));
        assert_eq!(session.channels().decoding_threshold(), Some(40));

        let off = SessionConfig::default().with_decoding_threshold(None);
        assert_eq!(NetworkSession::new(off).unwrap().decoding_threshold(), None);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SessionConfig::default().with_max_players(9);
        assert!(NetworkSession::new(config).is_err());
    }

    #[test]
    fn server_setup_binds_and_shuts_down() {
        let session = NetworkSession::new(SessionConfig::default().with_max_players(2)).unwrap();
        session.setup(Role::Server, "127.0.0.1:0").unwrap();
        assert_eq!(session.role(), Some(Role::Server));
        assert_eq!(session.player_id(), Some(0));
        assert!(session.local_addr().unwrap().port() != 0);
        assert!(matches!(
            session.setup(Role::Server, "127.0.0.1:0"),
            Err(ChatheadError::ProtocolViolation(_))
        ));

        // Nobody joined yet: nothing to send to, interval untouched.
        assert!(!session.send(message(), true));
        assert!(!session.send(message(), false));
        assert!(session.can_send());

        session.shutdown();
        assert!(session.local_addr().is_none());
        assert!(session.player_id().is_none());
        assert_eq!(session.phase(), SessionPhase::Idle);
        session.shutdown();
    }

    fn connected_pair(config: SessionConfig) -> (NetworkSession, NetworkSession) {
        let server = NetworkSession::new(config.clone()).unwrap();
        server.setup(Role::Server, "127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let client = NetworkSession::new(config).unwrap();
        client.setup(Role::Client, &format!("127.0.0.1:{port}")).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !(server.is_connected() && client.is_connected()) {
            assert!(std::time::Instant::now() < deadline, "client never joined");
            server.wake();
            client.wake();
            thread::sleep(Duration::from_millis(5));
        }
        (server, client)
    }

    #[test]
    fn accepted_send_restarts_interval() {
        let config = SessionConfig::default().with_send_interval(Duration::from_secs(60));
        let (server, client) = connected_pair(config);
        for session in [&server, &client] {
            assert!(session.can_send());
            assert!(session.send(message(), true));
            assert!(!session.can_send());
            assert!(!session.send(message(), true));
            session.set_send_interval(Duration::ZERO);
            assert!(session.can_send());
        }
        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn unconnected_client_refuses_frames() {
        let black_hole = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = black_hole.local_addr().unwrap().to_string();
        let session = NetworkSession::new(SessionConfig::default()).unwrap();
        session.setup(Role::Client, &addr).unwrap();

        assert!(!session.is_connected());
        assert!(session.player_id().is_none());
        assert!(!session.send(message(), true));
        assert!(!session.send(message(), false));
        assert!(session.can_send());
        session.shutdown();
    }

    #[test]
    fn bind_conflict_is_a_setup_error() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let session = NetworkSession::new(SessionConfig::default()).unwrap();
        assert!(matches!(
            session.setup(Role::Server, &addr),
            Err(ChatheadError::Connection(_))
        ));
        assert!(session.role().is_none());
    }
}
