//! The `network` thread's event loop.

use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::event::{Role, SessionEvent};
use super::phase::SessionPhase;
use super::roster::{Admission, Roster};
use super::{Outbound, RemoteFrame, SessionShared};
use crate::channel::{DecoderSet, channel_index};
use crate::stats::TrafficMeter;
use crate::wire::{
    CHUNK_PAYLOAD_SIZE, ControlMessage, PROTOCOL_VERSION, Packet, PacketFlags, PacketKind,
    Reassembler, VideoChunkHeader, VideoUpdateMessage, chunk_frame,
};

/// Housekeeping period: connect retries, heartbeats, liveness.
const TICK: Duration = Duration::from_millis(50);

/// Upper bound on datagrams handled in one wake, so a flood cannot
/// starve the outbound queue.
const MAX_DATAGRAMS_PER_PASS: usize = 4096;

const RECV_BUFFER: usize = 64 * 1024;

pub(crate) struct Worker {
    shared: Arc<SessionShared>,
    socket: UdpSocket,
    outbound: mpsc::Receiver<Outbound>,
    role: Role,
    phase: SessionPhase,
    /// Client only.
    server_addr: Option<SocketAddr>,
    /// Server only.
    roster: Roster,
    /// Client only: other players the server announced, server included.
    peers: BTreeSet<u32>,
    reassembler: Reassembler,
    decoders: DecoderSet,
    scratch: Vec<u8>,
    recv_buf: Vec<u8>,
    traffic: TrafficMeter,
    sequence: u32,
    hello_attempts: u32,
    last_hello: Option<Instant>,
    last_heartbeat: Instant,
    server_last_seen: Instant,
}

impl Worker {
    pub fn new(
        shared: Arc<SessionShared>,
        socket: UdpSocket,
        outbound: mpsc::Receiver<Outbound>,
        role: Role,
        server_addr: Option<SocketAddr>,
    ) -> Self {
        let config = &shared.config;
        let roster = Roster::new(config.max_players);
        let reassembler = Reassembler::new(CHUNK_PAYLOAD_SIZE, config.max_encoded_bytes);
        let decoders = DecoderSet::new(shared.channels.len());
        let now = Instant::now();

        Self {
            shared,
            socket,
            outbound,
            role,
            phase: SessionPhase::Idle,
            server_addr,
            roster,
            peers: BTreeSet::new(),
            reassembler,
            decoders,
            scratch: Vec::new(),
            recv_buf: vec![0u8; RECV_BUFFER],
            traffic: TrafficMeter::starting_at(now),
            sequence: 0,
            hello_attempts: 0,
            last_hello: None,
            last_heartbeat: now,
            server_last_seen: now,
        }
    }

    pub async fn run(mut self) {
        self.start();

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shared.wake.notified() => {
                    if !self.shared.stay_alive.load(Ordering::Acquire) {
                        break;
                    }
                    self.drain_inbound().await;
                    self.refresh_stats();
                }
                Some(out) = self.outbound.recv() => {
                    self.send_video(out).await;
                }
                _ = ticker.tick() => {
                    if !self.shared.stay_alive.load(Ordering::Acquire) {
                        break;
                    }
                    self.on_tick(Instant::now()).await;
                    self.refresh_stats();
                }
            }
        }

        self.finish().await;
    }

    // ── Lifecycle ────────────────────────────────────────────────

    fn start(&mut self) {
        let result = match self.role {
            Role::Server => self.phase.begin_listen(),
            Role::Client => self.phase.begin_connect(),
        };
        if let Err(e) = result {
            warn!(error = %e, "unexpected phase at worker start");
        }
        self.shared.set_phase(self.phase);

        if self.role == Role::Server {
            let port = self.socket.local_addr().map(|a| a.port()).unwrap_or_default();
            self.shared.emit(SessionEvent::Listening { port });
        }
    }

    async fn finish(&mut self) {
        if self.phase.begin_disconnect().is_ok() {
            self.shared.set_phase(self.phase);
        }

        let targets: Vec<SocketAddr> = match self.role {
            Role::Server => self.roster.addrs().collect(),
            Role::Client => self.server_addr.into_iter().collect(),
        };
        for addr in targets {
            self.send_control(&ControlMessage::Goodbye, addr).await;
        }

        self.roster.clear();
        self.reassembler.clear();
        self.shared.channels.reset_all();
        self.phase.reset();
        self.shared.set_phase(self.phase);
        self.shared.set_player_id(None);
        self.shared.set_connected_to_server(false);
        self.shared.set_connected_peers(0);
        self.shared.emit(SessionEvent::Disconnected);
        info!(role = %self.role, "network worker stopped");
    }

    // ── Inbound ──────────────────────────────────────────────────

    async fn drain_inbound(&mut self) {
        for _ in 0..MAX_DATAGRAMS_PER_PASS {
            let (len, from) = match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(error = %e, "receive failed");
                    return;
                }
            };
            self.traffic.record_received(Instant::now(), len);

            let packet = match Packet::from_datagram(&self.recv_buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    debug!(%from, error = %e, "malformed datagram dropped");
                    continue;
                }
            };
            match self.role {
                Role::Server => self.server_packet(packet, from).await,
                Role::Client => self.client_packet(packet, from).await,
            }
        }
        trace!("inbound pass limit reached");
    }

    async fn server_packet(&mut self, packet: Packet, from: SocketAddr) {
        let now = Instant::now();
        match packet.kind {
            PacketKind::Control => {
                let message = match packet.as_control() {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(%from, error = %e, "bad control message");
                        return;
                    }
                };
                match message {
                    ControlMessage::Hello { protocol_version } => {
                        self.on_hello(from, protocol_version, now).await;
                    }
                    ControlMessage::Heartbeat => self.roster.touch(from, now),
                    ControlMessage::Goodbye => {
                        if let Some(id) = self.roster.id_of(&from) {
                            self.drop_client(id, false).await;
                        }
                    }
                    other => debug!(%from, ?other, "unexpected control message from client"),
                }
            }
            PacketKind::VideoChunk => {
                let Some(sender) = self.roster.id_of(&from) else {
                    debug!(%from, "video from unknown address dropped");
                    return;
                };
                self.roster.touch(from, now);

                let (header, data) = match packet.as_video_chunk() {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(player_id = sender, error = %e, "bad video chunk");
                        return;
                    }
                };
                if header.player_id != sender {
                    warn!(
                        player_id = sender,
                        claimed = header.player_id,
                        "video chunk with foreign player id dropped"
                    );
                    return;
                }

                if !packet.flags.contains(PacketFlags::DIRECT) {
                    self.relay(&packet, sender).await;
                }
                self.accept_chunk(header, data, 0);
            }
        }
    }

    async fn client_packet(&mut self, packet: Packet, from: SocketAddr) {
        if Some(from) != self.server_addr {
            debug!(%from, "datagram from non-server address dropped");
            return;
        }
        self.server_last_seen = Instant::now();

        match packet.kind {
            PacketKind::Control => {
                let message = match packet.as_control() {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(error = %e, "bad control message from server");
                        return;
                    }
                };
                self.on_server_message(message);
            }
            PacketKind::VideoChunk => {
                let Some(local) = self.shared.player_id() else {
                    return;
                };
                let (header, data) = match packet.as_video_chunk() {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "bad video chunk from server");
                        return;
                    }
                };
                // Only the server's own video arrives unrelayed.
                if header.player_id != 0 && !packet.flags.contains(PacketFlags::RELAYED) {
                    debug!(player_id = header.player_id, "unrelayed client video dropped");
                    return;
                }
                self.accept_chunk(header, data, local);
            }
        }
    }

    // ── Server side ──────────────────────────────────────────────

    async fn on_hello(&mut self, from: SocketAddr, protocol_version: u16, now: Instant) {
        if protocol_version != PROTOCOL_VERSION {
            warn!(%from, protocol_version, "client speaks another protocol version");
            return;
        }

        match self.roster.admit(from, now) {
            Admission::Assigned { player_id, new } => {
                let welcome = ControlMessage::Welcome {
                    player_id,
                    max_players: self.shared.config.max_players,
                    players: std::iter::once(0).chain(self.roster.ids()).collect(),
                };
                self.send_control(&welcome, from).await;
                if !new {
                    return;
                }

                info!(player_id, %from, "client joined");
                self.forget_player(player_id, 0);
                let others: Vec<SocketAddr> = self.roster.addrs_except(player_id).collect();
                for addr in others {
                    self.send_control(&ControlMessage::PeerJoined { player_id }, addr)
                        .await;
                }
                self.shared.set_connected_peers(self.roster.len() as u32);
                self.shared.emit(SessionEvent::PeerJoined { player_id });
            }
            Admission::Full => {
                info!(%from, "session full, client refused");
                self.send_control(&ControlMessage::ServerFull, from).await;
            }
        }
    }

    async fn drop_client(&mut self, player_id: u32, lost: bool) {
        if self.roster.remove(player_id).is_none() {
            return;
        }
        self.forget_player(player_id, 0);

        let others: Vec<SocketAddr> = self.roster.addrs().collect();
        for addr in others {
            self.send_control(&ControlMessage::PeerLeft { player_id }, addr)
                .await;
        }
        self.shared.set_connected_peers(self.roster.len() as u32);
        self.shared.emit(if lost {
            SessionEvent::PeerLost { player_id }
        } else {
            SessionEvent::PeerLeft { player_id }
        });
    }

    /// Forward a client's chunk to every other client.
    async fn relay(&mut self, packet: &Packet, sender: u32) {
        let targets: Vec<SocketAddr> = self.roster.addrs_except(sender).collect();
        if targets.is_empty() {
            return;
        }
        let datagram = match packet.clone().with_flags(PacketFlags::RELAYED).to_datagram() {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "relay encoding failed");
                return;
            }
        };
        for addr in targets {
            self.send_datagram(&datagram, addr).await;
        }
    }

    async fn server_tick(&mut self, now: Instant) {
        let timeout = self.shared.config.peer_timeout;
        for player_id in self.roster.expired(now, timeout) {
            warn!(player_id, "client timed out");
            self.drop_client(player_id, true).await;
        }

        if now.saturating_duration_since(self.last_heartbeat) >= self.shared.config.heartbeat_interval {
            self.last_heartbeat = now;
            let clients: Vec<SocketAddr> = self.roster.addrs().collect();
            for addr in clients {
                self.send_control(&ControlMessage::Heartbeat, addr).await;
            }
        }
    }

    // ── Client side ──────────────────────────────────────────────

    fn on_server_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Welcome {
                player_id,
                max_players,
                players,
            } => {
                if self.phase != SessionPhase::Connecting {
                    return;
                }
                let ours = self.shared.config.max_players;
                if player_id == 0 || player_id >= ours {
                    warn!(player_id, max_players = ours, "server assigned an id we cannot use");
                    return;
                }
                if max_players != ours {
                    warn!(server = max_players, local = ours, "player count differs from server");
                }
                if let Err(e) = self.phase.complete_connect() {
                    warn!(error = %e, "welcome in unexpected phase");
                    return;
                }
                self.shared.set_phase(self.phase);
                self.shared.set_player_id(Some(player_id));
                self.shared.set_connected_to_server(true);
                self.peers = players
                    .iter()
                    .copied()
                    .chain(std::iter::once(0))
                    .filter(|&p| p != player_id && p < ours)
                    .collect();
                self.shared.set_connected_peers(self.peers.len() as u32);
                self.last_heartbeat = Instant::now();

                self.shared.emit(SessionEvent::Connected { player_id });
                for &p in self.peers.iter().filter(|&&p| p != 0) {
                    self.shared.emit(SessionEvent::PeerJoined { player_id: p });
                }
            }
            ControlMessage::ServerFull => {
                if self.phase == SessionPhase::Connecting {
                    let _ = self.phase.finish_disconnect();
                    self.shared.set_phase(self.phase);
                    self.shared.emit(SessionEvent::ServerFull);
                }
            }
            ControlMessage::Goodbye => {
                if self.phase == SessionPhase::Connected {
                    self.lose_server(SessionEvent::Disconnected);
                }
            }
            ControlMessage::PeerJoined { player_id } => {
                if self.phase != SessionPhase::Connected {
                    return;
                }
                let Some(local) = self.shared.player_id() else {
                    return;
                };
                if player_id == local
                    || player_id >= self.shared.config.max_players
                    || !self.peers.insert(player_id)
                {
                    trace!(player_id, "peer announcement ignored");
                    return;
                }
                self.forget_player(player_id, local);
                self.shared.set_connected_peers(self.peers.len() as u32);
                self.shared.emit(SessionEvent::PeerJoined { player_id });
            }
            ControlMessage::PeerLeft { player_id } => {
                if self.phase != SessionPhase::Connected || !self.peers.remove(&player_id) {
                    return;
                }
                let local = self.shared.player_id().unwrap_or(0);
                self.forget_player(player_id, local);
                self.shared.set_connected_peers(self.peers.len() as u32);
                self.shared.emit(SessionEvent::PeerLeft { player_id });
            }
            ControlMessage::Heartbeat => {}
            ControlMessage::Hello { .. } => debug!("hello from server ignored"),
        }
    }

    /// Drop back to solo after the server went away.
    fn lose_server(&mut self, event: SessionEvent) {
        let _ = self.phase.finish_disconnect();
        self.shared.set_phase(self.phase);
        self.shared.set_player_id(None);
        self.shared.set_connected_to_server(false);
        self.shared.set_connected_peers(0);
        self.peers.clear();
        self.shared.channels.reset_all();
        self.reassembler.clear();
        for index in 0..self.shared.channels.len() {
            self.decoders.reset(index);
        }
        self.shared.emit(event);
    }

    async fn client_tick(&mut self, now: Instant) {
        let Some(server) = self.server_addr else {
            return;
        };
        let config = &self.shared.config;

        match self.phase {
            SessionPhase::Connecting => {
                let due = self
                    .last_hello
                    .is_none_or(|t| now.saturating_duration_since(t) >= config.connect_retry_interval);
                if !due {
                    return;
                }
                if self.hello_attempts >= config.connect_attempts {
                    let attempts = self.hello_attempts;
                    warn!(%server, attempts, "server did not answer");
                    let _ = self.phase.finish_disconnect();
                    self.shared.set_phase(self.phase);
                    self.shared.emit(SessionEvent::ConnectionFailed { attempts });
                    return;
                }
                self.hello_attempts += 1;
                self.last_hello = Some(now);
                debug!(%server, attempt = self.hello_attempts, "sending hello");
                let hello = ControlMessage::Hello {
                    protocol_version: PROTOCOL_VERSION,
                };
                self.send_control(&hello, server).await;
            }
            SessionPhase::Connected => {
                if now.saturating_duration_since(self.server_last_seen) > config.peer_timeout {
                    warn!(%server, "server timed out");
                    self.lose_server(SessionEvent::ConnectionLost);
                    return;
                }
                if now.saturating_duration_since(self.last_heartbeat) >= config.heartbeat_interval {
                    self.last_heartbeat = now;
                    self.send_control(&ControlMessage::Heartbeat, server).await;
                }
            }
            _ => {}
        }
    }

    // ── Video ────────────────────────────────────────────────────

    fn accept_chunk(&mut self, header: VideoChunkHeader, data: &[u8], local: u32) {
        if header.player_id == local || header.player_id >= self.shared.config.max_players {
            debug!(player_id = header.player_id, "chunk for impossible player dropped");
            return;
        }
        match self.reassembler.accept(header, data) {
            Ok(Some(message)) => self.ingest(&message, local),
            Ok(None) => {}
            Err(e) => debug!(player_id = header.player_id, error = %e, "video chunk rejected"),
        }
    }

    fn ingest(&mut self, message: &VideoUpdateMessage, local: u32) {
        let outcome = self.shared.channels.ingest(
            local,
            message,
            &mut self.decoders,
            self.shared.decoder_factory.as_ref(),
            &mut self.scratch,
        );
        trace!(player_id = message.player_id, ?outcome, "video update");

        if outcome.decoded() {
            self.shared.deliver_frame(&RemoteFrame {
                player_id: message.player_id,
                width: message.width,
                height: message.height,
                timestamp_ticks: message.timestamp_ticks,
                pixels: &self.scratch,
            });
        }
    }

    async fn send_video(&mut self, out: Outbound) {
        let Some(player_id) = self.shared.player_id() else {
            trace!("no player id yet, frame dropped");
            return;
        };
        let targets: Vec<SocketAddr> = match self.role {
            Role::Server => self.roster.addrs().collect(),
            Role::Client if self.phase == SessionPhase::Connected => {
                self.server_addr.into_iter().collect()
            }
            Role::Client => Vec::new(),
        };
        if targets.is_empty() {
            return;
        }

        let mut message = out.message;
        message.player_id = player_id;
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let chunks = match chunk_frame(&message, sequence, CHUNK_PAYLOAD_SIZE) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "frame not sendable");
                return;
            }
        };
        let flags = if out.broadcast {
            PacketFlags::empty()
        } else {
            PacketFlags::DIRECT
        };

        for (header, data) in chunks {
            let datagram = match Packet::video_chunk(&header, data).with_flags(flags).to_datagram() {
                Ok(d) => d,
                Err(e) => {
                    debug!(error = %e, "chunk encoding failed");
                    return;
                }
            };
            for &addr in &targets {
                self.send_datagram(&datagram, addr).await;
            }
        }
    }

    // ── Housekeeping ─────────────────────────────────────────────

    async fn on_tick(&mut self, now: Instant) {
        match self.role {
            Role::Server => self.server_tick(now).await,
            Role::Client => self.client_tick(now).await,
        }
    }

    /// Clear channel, decoder and reassembly state for `player_id`.
    fn forget_player(&mut self, player_id: u32, local: u32) {
        self.reassembler.forget(player_id);
        if let Some(index) = channel_index(local, player_id, self.shared.config.max_players) {
            if let Some(channel) = self.shared.channels.get(index) {
                channel.reset();
            }
            self.decoders.reset(index);
        }
    }

    fn refresh_stats(&mut self) {
        let (sent, received) = self.traffic.last_second(Instant::now());
        self.shared.set_byte_rates(sent, received);
    }

    async fn send_control(&mut self, message: &ControlMessage, to: SocketAddr) {
        match Packet::control(message).and_then(|p| p.to_datagram()) {
            Ok(datagram) => self.send_datagram(&datagram, to).await,
            Err(e) => debug!(error = %e, "control message encoding failed"),
        }
    }

    async fn send_datagram(&mut self, datagram: &[u8], to: SocketAddr) {
        match self.socket.send_to(datagram, to).await {
            Ok(n) => self.traffic.record_sent(Instant::now(), n),
            Err(e) => debug!(%to, error = %e, "send failed"),
        }
    }
}
