//! Integration tests: real sessions talking over loopback UDP, the
//! resize handshake end to end, and the capture → network → compositor
//! pipeline.

use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chathead_core::wire::{CHUNK_PAYLOAD_SIZE, PROTOCOL_VERSION, PacketFlags, chunk_frame};
use chathead_core::{
    CaptureConfig, CaptureProducer, ChatheadError, Compositor, ControlMessage, FrameEncoder,
    NetworkSession, OverlaySink, Packet, PixelFormat, Resolution, Role, SessionConfig,
    SessionEvent, SessionPhase, SyntheticSource, VideoUpdateMessage, ZstdEncoder,
};

// ── Helpers ──────────────────────────────────────────────────────

fn config(max_players: u32) -> SessionConfig {
    SessionConfig::default()
        .with_max_players(max_players)
        .with_initial_resolution(Resolution::new(320, 240))
}

fn server(config: SessionConfig) -> (Arc<NetworkSession>, String) {
    let session = Arc::new(NetworkSession::new(config).unwrap());
    session.setup(Role::Server, "127.0.0.1:0").unwrap();
    let port = session.local_addr().unwrap().port();
    (session, format!("127.0.0.1:{port}"))
}

fn client(config: SessionConfig, server: &str) -> Arc<NetworkSession> {
    let session = Arc::new(NetworkSession::new(config).unwrap());
    session.setup(Role::Client, server).unwrap();
    session
}

fn record_events(session: &NetworkSession) -> Arc<Mutex<Vec<SessionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session.register_event_callback(move |e| sink.lock().unwrap().push(e.clone()));
    events
}

/// Keep waking every session until `done` holds or 5 s pass.
fn pump(sessions: &[&NetworkSession], mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        sessions.iter().for_each(|s| s.wake());
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn update(w: u32, h: u32, fill: u8) -> VideoUpdateMessage {
    let pixels = vec![fill; PixelFormat::Bgra8.frame_len(w, h)];
    let unit = ZstdEncoder::default().encode(&pixels, w, h).unwrap().unwrap();
    VideoUpdateMessage {
        // Filled in by the session.
        player_id: u32::MAX,
        width: w,
        height: h,
        timestamp_ticks: unit.timestamp_ticks,
        duration_ticks: unit.duration_ticks,
        payload: unit.data,
    }
}

fn connected_pair() -> (Arc<NetworkSession>, Arc<NetworkSession>) {
    let (srv, addr) = server(config(4));
    let cli = client(config(4), &addr);
    assert!(pump(&[&srv, &cli], || srv.is_connected() && cli.is_connected()));
    (srv, cli)
}

#[derive(Default)]
struct CountingSink {
    recreated: Vec<(usize, u32, u32)>,
    uploads: Vec<usize>,
}

impl OverlaySink for CountingSink {
    fn recreate(&mut self, overlay: usize, width: u32, height: u32) -> Result<(), ChatheadError> {
        self.recreated.push((overlay, width, height));
        Ok(())
    }

    fn upload(&mut self, overlay: usize, _: &[u8], _: u32, _: u32) -> Result<(), ChatheadError> {
        self.uploads.push(overlay);
        Ok(())
    }
}

/// A bare socket speaking the wire protocol by hand, for playing a
/// peer that misbehaves or goes quiet.
struct ScriptedPeer {
    socket: UdpSocket,
}

impl ScriptedPeer {
    fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        Self { socket }
    }

    fn addr(&self) -> String {
        self.socket.local_addr().unwrap().to_string()
    }

    fn send_control(&self, message: &ControlMessage, to: SocketAddr) {
        let datagram = Packet::control(message).unwrap().to_datagram().unwrap();
        self.socket.send_to(&datagram, to).unwrap();
    }

    fn send_video(&self, message: &VideoUpdateMessage, sequence: u32, flags: PacketFlags, to: SocketAddr) {
        for (header, data) in chunk_frame(message, sequence, CHUNK_PAYLOAD_SIZE).unwrap() {
            let datagram = Packet::video_chunk(&header, data)
                .with_flags(flags)
                .to_datagram()
                .unwrap();
            self.socket.send_to(&datagram, to).unwrap();
        }
    }

    /// Wait for the next control message matching `wanted`.
    fn expect(&self, mut wanted: impl FnMut(&ControlMessage) -> bool) -> SocketAddr {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = vec![0u8; 64 * 1024];
        while Instant::now() < deadline {
            let Ok((len, from)) = self.socket.recv_from(&mut buf) else {
                continue;
            };
            let Ok(packet) = Packet::from_datagram(&buf[..len]) else {
                continue;
            };
            if packet.as_control().is_ok_and(|m| wanted(&m)) {
                return from;
            }
        }
        panic!("expected control message never arrived");
    }
}

/// Client connected to a [`ScriptedPeer`] playing the server as
/// player 0, with the client assigned player 1 out of 4.
fn client_of_scripted_server(config: SessionConfig) -> (ScriptedPeer, Arc<NetworkSession>, SocketAddr) {
    let server = ScriptedPeer::bind();
    let cli = client(config, &server.addr());
    let client_addr = server.expect(|m| matches!(m, ControlMessage::Hello { .. }));
    let welcome = ControlMessage::Welcome {
        player_id: 1,
        max_players: 4,
        players: vec![0, 1],
    };
    server.send_control(&welcome, client_addr);
    assert!(pump(&[&cli], || cli.is_connected()));
    (server, cli, client_addr)
}

fn count(events: &Mutex<Vec<SessionEvent>>, event: &SessionEvent) -> usize {
    events.lock().unwrap().iter().filter(|e| *e == event).count()
}

// ── Session lifecycle ────────────────────────────────────────────

#[test]
fn test_client_joins_server() {
    let (srv, addr) = server(config(4));
    let server_events = record_events(&srv);
    let cli = client(config(4), &addr);
    let client_events = record_events(&cli);

    assert!(pump(&[&srv, &cli], || srv.is_connected() && cli.is_connected()));
    assert_eq!(cli.player_id(), Some(1));
    assert_eq!(srv.player_id(), Some(0));
    assert_eq!(cli.phase(), SessionPhase::Connected);
    assert_eq!(srv.connected_peers(), 1);
    assert_eq!(cli.connected_peers(), 1);

    assert!(pump(&[&srv], || {
        server_events
            .lock()
            .unwrap()
            .contains(&SessionEvent::PeerJoined { player_id: 1 })
    }));
    assert!(
        client_events
            .lock()
            .unwrap()
            .contains(&SessionEvent::Connected { player_id: 1 })
    );
}

#[test]
fn test_client_shutdown_notifies_server() {
    let (srv, cli) = connected_pair();
    let events = record_events(&srv);

    cli.shutdown();
    assert_eq!(cli.phase(), SessionPhase::Idle);
    assert_eq!(cli.player_id(), None);

    assert!(pump(&[&srv], || {
        events
            .lock()
            .unwrap()
            .contains(&SessionEvent::PeerLeft { player_id: 1 })
    }));
    assert_eq!(srv.connected_peers(), 0);
    assert!(!srv.is_connected());
}

#[test]
fn test_server_full() {
    let (srv, addr) = server(config(2));
    let first = client(config(2), &addr);
    assert!(pump(&[&srv, &first], || first.is_connected()));

    let second = client(config(2), &addr);
    let events = record_events(&second);
    assert!(pump(&[&srv, &second], || {
        events.lock().unwrap().contains(&SessionEvent::ServerFull)
    }));
    assert!(!second.is_connected());
    assert_eq!(second.player_id(), None);
    assert_eq!(srv.connected_peers(), 1);
}

#[test]
fn test_unanswered_hello_fails_connection() {
    // Bound but silent: hellos land nowhere.
    let black_hole = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = black_hole.local_addr().unwrap().to_string();

    let cfg = config(4).with_connect_attempts(2, Duration::from_millis(30));
    let cli = Arc::new(NetworkSession::new(cfg).unwrap());
    let events = record_events(&cli);
    cli.setup(Role::Client, &addr).unwrap();

    assert!(pump(&[&cli], || {
        events
            .lock()
            .unwrap()
            .contains(&SessionEvent::ConnectionFailed { attempts: 2 })
    }));
    assert!(!cli.is_connected());
    assert!(!cli.send(update(320, 240, 1), true));
}

// ── Frame exchange ───────────────────────────────────────────────

#[test]
fn test_frames_flow_both_ways() {
    let (srv, cli) = connected_pair();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    srv.register_frame_callback(move |f| {
        sink.lock().unwrap().push((f.player_id, f.width, f.height, f.pixels[0]))
    });

    // Client → server.
    assert!(cli.send(update(320, 240, 111), true));
    let channel = srv.channels().for_player(0, 1).unwrap();
    assert!(pump(&[&srv, &cli], || {
        channel.has_fresh_frame() && !received.lock().unwrap().is_empty()
    }));
    {
        let frame = channel.take_fresh_frame().unwrap();
        assert_eq!(frame.resolution(), Resolution::new(320, 240));
        assert!(frame.pixels().iter().all(|&b| b == 111));
    }
    assert_eq!(received.lock().unwrap()[0], (1, 320, 240, 111));

    // Server → client; the server lands on the client's channel 0.
    assert!(!srv.send(update(320, 240, 22), false));
    assert!(srv.send(update(320, 240, 22), true));
    let channel = cli.channels().for_player(1, 0).unwrap();
    assert_eq!(channel.index(), 0);
    assert!(pump(&[&srv, &cli], || channel.has_fresh_frame()));
    let frame = channel.take_fresh_frame().unwrap();
    assert!(frame.pixels().iter().all(|&b| b == 22));
}

#[test]
fn test_resize_handshake_over_the_wire() {
    let (srv, cli) = connected_pair();
    let channel = srv.channels().for_player(0, 1).unwrap();
    let big = Resolution::new(640, 480);

    assert!(cli.send(update(640, 480, 55), true));
    assert!(pump(&[&srv, &cli], || channel.pending_resize() == Some(big)));
    // Not copied into the small buffer.
    assert!(!channel.has_fresh_frame());
    assert_eq!(channel.slot().dimensions(), Resolution::new(320, 240));

    let mut resized = Vec::new();
    assert_eq!(srv.channels().apply_pending_resizes(|i, r| resized.push((i, r))), 1);
    assert_eq!(resized, vec![(0, big)]);

    thread::sleep(cli.send_interval());
    assert!(cli.send(update(640, 480, 66), true));
    assert!(pump(&[&srv, &cli], || channel.has_fresh_frame()));
    let frame = channel.take_fresh_frame().unwrap();
    assert_eq!(frame.resolution(), big);
    assert_eq!(frame.pixels().len(), PixelFormat::Bgra8.frame_len(640, 480));
    assert!(frame.pixels().iter().all(|&b| b == 66));
}

#[test]
fn test_server_relays_between_clients() {
    let (srv, addr) = server(config(3));
    let first = client(config(3), &addr);
    assert!(pump(&[&srv, &first], || first.is_connected()));
    let second = client(config(3), &addr);
    assert!(pump(&[&srv, &first, &second], || {
        second.is_connected() && first.connected_peers() == 2
    }));
    assert_eq!(first.player_id(), Some(1));
    assert_eq!(second.player_id(), Some(2));

    // Broadcast: relayed to player 2.
    assert!(first.send(update(320, 240, 88), true));
    let at_second = second.channels().for_player(2, 1).unwrap();
    let at_server = srv.channels().for_player(0, 1).unwrap();
    let all = [&*srv, &*first, &*second];
    assert!(pump(&all, || at_second.has_fresh_frame() && at_server.has_fresh_frame()));
    drop(at_second.take_fresh_frame().unwrap());
    drop(at_server.take_fresh_frame().unwrap());

    // Direct: only the server sees it.
    thread::sleep(first.send_interval());
    assert!(first.send(update(320, 240, 99), false));
    assert!(pump(&all, || at_server.has_fresh_frame()));
    for _ in 0..20 {
        all.iter().for_each(|s| s.wake());
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!at_second.has_fresh_frame());
}

// ── Pipeline ─────────────────────────────────────────────────────

#[test]
fn test_capture_to_remote_compositor() {
    let (srv, cli) = connected_pair();
    let res = Resolution::new(320, 240);

    let source = SyntheticSource::new(res, 60).with_frame_limit(300);
    let mut producer =
        CaptureProducer::start(source, ZstdEncoder::new(60), Some(Arc::clone(&cli)), CaptureConfig::default())
            .unwrap();

    let mut remote = Compositor::new(CountingSink::default()).with_session(Arc::clone(&srv));
    let mut local = Compositor::new(CountingSink::default())
        .with_local_feed(Arc::clone(producer.feed()))
        .with_session(Arc::clone(&cli));

    let mut remote_uploads = 0;
    let mut local_uploads = 0;
    assert!(pump(&[&srv, &cli], || {
        remote_uploads += remote.frame().peers_uploaded;
        local_uploads += usize::from(local.frame().local_uploaded);
        remote_uploads >= 3 && local_uploads >= 3
    }));
    producer.stop();

    assert!(producer.counters().sent >= 3);
    assert_eq!(remote.sink().recreated, vec![(1, 320, 240)]);
    assert!(remote.sink().uploads.iter().all(|&o| o == 1));

    let snap = remote.peer_frame_snapshot(1).unwrap();
    assert_eq!(snap.resolution(), res);
    // Background keyed out to transparent black in the corner, kept in
    // the centre.
    assert_eq!(snap.pixels[..4], [0, 0, 0, 0]);
    assert_eq!(snap.pixels[(120 * 320 + 160) * 4 + 3], 255);

    let mine = local.local_frame_snapshot().unwrap();
    assert_eq!(mine.resolution(), res);
    assert!(remote.peer_frame_snapshot(0).is_none());
}

// ── Liveness ─────────────────────────────────────────────────────

fn short_liveness() -> SessionConfig {
    config(4).with_liveness(Duration::from_millis(50), Duration::from_millis(300))
}

#[test]
fn test_silent_client_is_dropped_by_server() {
    let (srv, addr) = server(short_liveness());
    let events = record_events(&srv);
    let silent = ScriptedPeer::bind();
    let server_addr: SocketAddr = addr.parse().unwrap();

    silent.send_control(
        &ControlMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
        },
        server_addr,
    );
    assert!(pump(&[&srv], || srv.connected_peers() == 1));
    silent.expect(|m| matches!(m, ControlMessage::Welcome { player_id: 1, .. }));

    // No heartbeat ever comes back.
    assert!(pump(&[&srv], || {
        events
            .lock()
            .unwrap()
            .contains(&SessionEvent::PeerLost { player_id: 1 })
    }));
    assert_eq!(srv.connected_peers(), 0);
    assert!(!srv.is_connected());
    assert_eq!(count(&events, &SessionEvent::PeerLeft { player_id: 1 }), 0);
}

#[test]
fn test_client_notices_silent_server() {
    let (_server, cli, _) = client_of_scripted_server(short_liveness());
    let events = record_events(&cli);
    assert_eq!(cli.player_id(), Some(1));

    assert!(pump(&[&cli], || {
        events.lock().unwrap().contains(&SessionEvent::ConnectionLost)
    }));
    assert!(!cli.is_connected());
    assert_eq!(cli.player_id(), None);
    assert_eq!(cli.connected_peers(), 0);
    assert!(!cli.send(update(320, 240, 1), true));
}

#[test]
fn test_heartbeats_keep_session_alive() {
    let (srv, addr) = server(short_liveness());
    let server_events = record_events(&srv);
    let cli = client(short_liveness(), &addr);
    let client_events = record_events(&cli);
    assert!(pump(&[&srv, &cli], || srv.is_connected() && cli.is_connected()));

    // Several timeouts' worth of idle time, video-free.
    let until = Instant::now() + Duration::from_millis(1200);
    while Instant::now() < until {
        srv.wake();
        cli.wake();
        thread::sleep(Duration::from_millis(10));
    }
    assert!(srv.is_connected() && cli.is_connected());
    assert_eq!(count(&server_events, &SessionEvent::PeerLost { player_id: 1 }), 0);
    assert_eq!(count(&client_events, &SessionEvent::ConnectionLost), 0);
}

// ── Announcements from the server ────────────────────────────────

#[test]
fn test_repeated_peer_announcements_count_once() {
    let (server, cli, client_addr) = client_of_scripted_server(config(4));
    let events = record_events(&cli);
    assert_eq!(cli.connected_peers(), 1);

    let joined = SessionEvent::PeerJoined { player_id: 2 };
    for _ in 0..3 {
        server.send_control(&ControlMessage::PeerJoined { player_id: 2 }, client_addr);
    }
    // Our own id is never a peer.
    server.send_control(&ControlMessage::PeerJoined { player_id: 1 }, client_addr);
    assert!(pump(&[&cli], || count(&events, &joined) > 0));
    for _ in 0..10 {
        cli.wake();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(count(&events, &joined), 1);
    assert_eq!(cli.connected_peers(), 2);

    let left = SessionEvent::PeerLeft { player_id: 2 };
    for _ in 0..2 {
        server.send_control(&ControlMessage::PeerLeft { player_id: 2 }, client_addr);
    }
    assert!(pump(&[&cli], || count(&events, &left) > 0));
    for _ in 0..10 {
        cli.wake();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(count(&events, &left), 1);
    assert_eq!(cli.connected_peers(), 1);
}

#[test]
fn test_client_video_must_come_relayed() {
    let (server, cli, client_addr) = client_of_scripted_server(config(4));
    let channel = cli.channels().for_player(1, 2).unwrap();

    let mut frame = update(320, 240, 77);
    frame.player_id = 2;
    server.send_video(&frame, 0, PacketFlags::empty(), client_addr);
    for _ in 0..20 {
        cli.wake();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!channel.has_fresh_frame());

    server.send_video(&frame, 1, PacketFlags::RELAYED, client_addr);
    assert!(pump(&[&cli], || channel.has_fresh_frame()));
    let got = channel.take_fresh_frame().unwrap();
    assert!(got.pixels().iter().all(|&b| b == 77));
}
