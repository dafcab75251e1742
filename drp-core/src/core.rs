//! Host-driven engine: one `EngineContext` per transport instance. The host calls
//! [`EngineContext::poll`] from its loop (or hands the loop over with [`EngineContext::run`])
//! and receives [`EngineEvent`]s back.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::chunk::{self, ChunkError, ChunkedSendSession};
use crate::config::EngineConfig;
use crate::protocol::{FrameType, GameInfo, IconChunk, Message, StatsChunk, PROTOCOL_VERSION};
use crate::scheduler::UpdateScheduler;
use crate::session::{Connection, ConnectionState, PeerTarget, SessionAction};
use crate::stats::{
    self, PlaySession, StatsStore, StatsSync, SyncProgress, UsageDocument, UsageTracker,
};
use crate::transport::{Datagram, Endpoint, Pacer, ThreadPacer, Transport, TransportError};
use crate::wire::{self, FrameEncodeError, TransportProfile};

/// Inbound frames handled per poll; the rest wait for the next iteration.
const MAX_INBOUND_PER_POLL: usize = 32;

/// Game detection, supplied by the host.
pub trait GameSource {
    /// What is running now. `None` keeps the previous view.
    fn detect(&mut self) -> Option<GameInfo>;
    /// Icon bytes for a title, if the host has one.
    fn icon(&mut self, id: &str) -> Option<Vec<u8>>;
}

/// Where discovered peer addresses are written back.
pub trait PeerStore {
    fn persist_peer(&mut self, addr: SocketAddr) -> io::Result<()>;
}

/// Battery and signal readings for heartbeats and discovery answers.
pub trait DeviceStatus {
    fn battery_percent(&self) -> u8 {
        100
    }
    fn signal_strength(&self) -> u8 {
        100
    }
}

/// Reports full battery and signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NominalDevice;

impl DeviceStatus for NominalDevice {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Send-once mode delivered its game info.
    SendOnce,
    /// The initial connect timed out with `shutdown_on_timeout`.
    ConnectTimeout,
    /// The host asked the loop to stop.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Connected(Endpoint),
    Disconnected,
    ConnectTimedOut,
    GameSent(GameInfo),
    IconSent { id: String, bytes: u32 },
    IconFailed { id: String },
    StatsSynced { remote_timestamp: u64, bytes: u32 },
    StatsFailed,
    StatsUploaded { bytes: u32 },
    PeerPersisted(SocketAddr),
    Stopped(StopReason),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("stats store: {0}")]
    Store(#[from] io::Error),
}

/// All mutable state of one session.
pub struct EngineContext<P: TransportProfile, T: Transport> {
    profile: P,
    transport: T,
    config: EngineConfig,
    connection: Connection,
    scheduler: UpdateScheduler,
    stats: StatsSync,
    games: Box<dyn GameSource>,
    peer_store: Option<Box<dyn PeerStore>>,
    stats_store: Option<Box<dyn StatsStore>>,
    device: Box<dyn DeviceStatus>,
    pacer: Box<dyn Pacer>,
    usage: UsageTracker,
    unsaved_sessions: Vec<PlaySession>,
    started_ms: Option<u64>,
    last_poll_ms: u64,
    stopped: Option<StopReason>,
}

impl<P: TransportProfile, T: Transport> EngineContext<P, T> {
    pub fn new(
        profile: P,
        transport: T,
        config: EngineConfig,
        target: PeerTarget,
        games: Box<dyn GameSource>,
    ) -> Self {
        let mut scheduler = UpdateScheduler::new(&config);
        scheduler.observe(stamp(GameInfo::browser(), &config));
        Self {
            connection: Connection::new(target, &config),
            scheduler,
            stats: StatsSync::new(config.stats_sync_interval().as_millis() as u64),
            profile,
            transport,
            config,
            games,
            peer_store: None,
            stats_store: None,
            device: Box::new(NominalDevice),
            pacer: Box::new(ThreadPacer),
            usage: UsageTracker::new(),
            unsaved_sessions: Vec::new(),
            started_ms: None,
            last_poll_ms: 0,
            stopped: None,
        }
    }

    pub fn with_peer_store(mut self, store: Box<dyn PeerStore>) -> Self {
        self.peer_store = Some(store);
        self
    }

    /// Enables play-time tracking, and stats sync on profiles that carry stats frames.
    pub fn with_stats_store(mut self, store: Box<dyn StatsStore>) -> Self {
        self.stats_store = Some(store);
        self
    }

    pub fn with_device_status(mut self, device: Box<dyn DeviceStatus>) -> Self {
        self.device = device;
        self
    }

    pub fn with_pacer(mut self, pacer: Box<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stopped(&self) -> Option<StopReason> {
        self.stopped
    }

    /// Game info the peer currently sees (or will see next).
    pub fn current_game(&self) -> &GameInfo {
        self.scheduler.current()
    }

    /// Silence after which the peer drops the session.
    pub fn liveness_timeout(&self) -> Duration {
        self.scheduler.liveness_timeout()
    }

    fn stats_enabled(&self) -> bool {
        self.stats_store.is_some() && self.profile.supports(FrameType::StatsRequest)
    }

    /// One cycle: detection, connection upkeep, inbound frames, outbound work.
    pub fn poll(&mut self, now_ms: u64) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if self.stopped.is_some() {
            return events;
        }
        self.started_ms.get_or_insert(now_ms);
        self.last_poll_ms = now_ms;

        if self.scheduler.game_check_due(now_ms) {
            self.scheduler.mark_game_checked(now_ms);
            if let Some(info) = self.games.detect() {
                self.scheduler.observe(stamp(info, &self.config));
                self.track_usage(now_ms);
            }
        }
        self.save_usage();

        let actions = self.connection.poll(now_ms, &mut self.transport);
        self.apply(now_ms, actions, &mut events);
        if self.stopped.is_some() || !self.transport.is_open() {
            return events;
        }

        for _ in 0..MAX_INBOUND_PER_POLL {
            match self.transport.try_receive(Duration::ZERO) {
                Ok(Some(datagram)) => self.dispatch(now_ms, datagram, &mut events),
                Ok(None) => break,
                Err(e) => {
                    self.on_transport_error(now_ms, e, &mut events);
                    break;
                }
            }
        }

        if let Some(peer) = self.connection.peer() {
            self.outbound(now_ms, peer, &mut events);
        }
        events
    }

    /// Drive `poll` until `shutdown` is set or the engine stops itself.
    pub fn run<F>(&mut self, shutdown: &AtomicBool, mut on_event: F) -> StopReason
    where
        F: FnMut(&EngineEvent),
    {
        let start = Instant::now();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                self.shutdown();
                return StopReason::Shutdown;
            }
            let now_ms = start.elapsed().as_millis() as u64;
            for event in self.poll(now_ms) {
                on_event(&event);
            }
            if let Some(reason) = self.stopped {
                return reason;
            }
            std::thread::sleep(self.config.loop_sleep());
        }
    }

    /// Close the running play session, release the transport and stop.
    pub fn shutdown(&mut self) {
        if self.stopped.is_none() {
            self.close_usage();
        }
        self.connection.close(&mut self.transport);
        self.stopped.get_or_insert(StopReason::Shutdown);
    }

    fn stop(&mut self, reason: StopReason, events: &mut Vec<EngineEvent>) {
        tracing::info!(?reason, "session stopping");
        self.close_usage();
        self.connection.close(&mut self.transport);
        self.stopped = Some(reason);
        events.push(EngineEvent::Stopped(reason));
    }

    fn track_usage(&mut self, now_ms: u64) {
        if self.stats_store.is_none() {
            return;
        }
        if let Some(done) = self.usage.observe(self.scheduler.current(), now_ms, unix_now()) {
            tracing::debug!(id = %done.game_id, seconds = done.seconds, "play session ended");
            self.unsaved_sessions.push(done);
        }
    }

    /// Write finished sessions into the local record. Held back while a stats response
    /// streams into the store.
    fn save_usage(&mut self) {
        if self.unsaved_sessions.is_empty() || self.stats.is_receiving() {
            return;
        }
        let Some(store) = self.stats_store.as_mut() else {
            self.unsaved_sessions.clear();
            return;
        };
        let mut doc = match store.load() {
            Ok(Some(blob)) => UsageDocument::from_slice(&blob).unwrap_or_else(|| {
                tracing::warn!("local usage record unreadable, starting a new one");
                UsageDocument::default()
            }),
            Ok(None) => UsageDocument::default(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read local usage record");
                return;
            }
        };
        for session in &self.unsaved_sessions {
            doc.record_session(session);
        }
        let blob = match serde_json::to_vec_pretty(&doc) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode usage record");
                return;
            }
        };
        match store.save(&blob) {
            Ok(()) => {
                tracing::info!(
                    sessions = self.unsaved_sessions.len(),
                    timestamp = doc.timestamp(),
                    "usage record updated"
                );
                self.unsaved_sessions.clear();
                self.stats.refresh_snapshot(blob);
            }
            Err(e) => tracing::warn!(error = %e, "could not save usage record"),
        }
    }

    /// End the running play session and flush it, abandoning any inbound stats transfer.
    fn close_usage(&mut self) {
        if let Some(done) = self.usage.finish(self.last_poll_ms) {
            self.unsaved_sessions.push(done);
        }
        if let Some(store) = self.stats_store.as_mut() {
            self.stats.on_disconnected(store.sink());
        }
        self.save_usage();
    }

    fn outbound(&mut self, now_ms: u64, peer: Endpoint, events: &mut Vec<EngineEvent>) {
        if self.scheduler.heartbeat_due(now_ms) {
            let msg = self.heartbeat(now_ms);
            match self.send(now_ms, &peer, &msg, events) {
                Ok(()) => self.scheduler.mark_heartbeat(now_ms),
                Err(e) => tracing::warn!(error = %e, "heartbeat send failed"),
            }
        }

        if self.scheduler.game_send_due(now_ms) {
            let info = self.scheduler.current().clone();
            match self.send(now_ms, &peer, &Message::GameInfo(info.clone()), events) {
                Ok(()) => {
                    tracing::info!(id = %info.id, state = ?info.state, "game info sent");
                    self.scheduler.mark_game_sent(now_ms);
                    events.push(EngineEvent::GameSent(info));
                    if self.config.send_once {
                        self.stop(StopReason::SendOnce, events);
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "game info send failed"),
            }
        }

        if let Some(id) = self.scheduler.icon_wanted().map(str::to_string) {
            self.scheduler.mark_icon_sent(&id);
            self.push_icon(now_ms, peer, &id, events);
        }

        if self.stats_enabled() && self.connection.is_connected() && self.stats.due(now_ms) {
            let local = match self.stats_store.as_mut().map(|s| s.load()) {
                Some(Ok(blob)) => blob,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "could not read local usage record");
                    None
                }
                None => None,
            };
            let msg = self.stats.start(now_ms, local);
            if let Err(e) = self.send(now_ms, &peer, &msg, events) {
                tracing::warn!(error = %e, "stats request failed");
            }
        }
    }

    fn heartbeat(&self, now_ms: u64) -> Message {
        let uptime_ms = now_ms.saturating_sub(self.started_ms.unwrap_or(now_ms));
        let strength = if self.profile.heartbeat_reports_battery() {
            self.device.battery_percent()
        } else {
            self.device.signal_strength()
        };
        Message::Heartbeat {
            uptime_seconds: (uptime_ms / 1000) as u32,
            strength,
        }
    }

    fn apply(&mut self, now_ms: u64, actions: Vec<SessionAction>, events: &mut Vec<EngineEvent>) {
        for action in actions {
            let result = match action {
                SessionAction::SendHello(to) => {
                    let hello = Message::GameInfo(self.scheduler.current().clone());
                    self.send(now_ms, &to, &hello, events)
                }
                SessionAction::BroadcastDiscovery => {
                    let msg = Message::DiscoveryRequest {
                        listen_port: self.transport.local_port().unwrap_or(self.config.port),
                        version: PROTOCOL_VERSION.to_string(),
                    };
                    let to = Endpoint::Broadcast(self.config.discovery_port);
                    self.send(now_ms, &to, &msg, events)
                }
                SessionAction::RespondDiscovery(to) => {
                    let msg = Message::DiscoveryResponse {
                        peer_name: self.config.peer_name.clone(),
                        version: PROTOCOL_VERSION.to_string(),
                        battery_percent: self.device.battery_percent(),
                    };
                    self.send(now_ms, &to, &msg, events)
                }
                SessionAction::Connected(peer) => {
                    self.scheduler.on_connected();
                    self.stats.on_connected();
                    events.push(EngineEvent::Connected(peer));
                    Ok(())
                }
                SessionAction::Disconnected => {
                    self.scheduler.on_disconnected();
                    if let Some(store) = self.stats_store.as_mut() {
                        self.stats.on_disconnected(store.sink());
                    }
                    events.push(EngineEvent::Disconnected);
                    Ok(())
                }
                SessionAction::TimedOut => {
                    events.push(EngineEvent::ConnectTimedOut);
                    Ok(())
                }
                SessionAction::PersistPeer(addr) => {
                    if let Some(store) = self.peer_store.as_mut() {
                        match store.persist_peer(addr) {
                            Ok(()) => events.push(EngineEvent::PeerPersisted(addr)),
                            Err(e) => {
                                tracing::warn!(peer = %addr, error = %e, "could not persist peer")
                            }
                        }
                    }
                    Ok(())
                }
                SessionAction::Shutdown => {
                    self.close_usage();
                    self.stopped = Some(StopReason::ConnectTimeout);
                    events.push(EngineEvent::Stopped(StopReason::ConnectTimeout));
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "connection step failed");
            }
        }
    }

    fn dispatch(&mut self, now_ms: u64, datagram: Datagram, events: &mut Vec<EngineEvent>) {
        let msg = match wire::decode_message(&self.profile, &datagram.bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::trace!(error = %e, len = datagram.bytes.len(), "dropping frame");
                return;
            }
        };
        let from = datagram.from;
        match msg {
            Message::Ack => {
                let actions = self.connection.on_ack(now_ms, from);
                self.apply(now_ms, actions, events);
            }
            Message::DiscoveryResponse {
                peer_name,
                version,
                battery_percent,
            } => {
                let Some(from) = from else { return };
                tracing::debug!(%from, %peer_name, %version, battery_percent, "discovery response");
                let actions = self.connection.on_discovery_response(now_ms, from);
                self.apply(now_ms, actions, events);
            }
            Message::DiscoveryRequest {
                listen_port,
                version,
            } => {
                let Some(from) = from else { return };
                tracing::debug!(%from, listen_port, %version, "discovery request");
                let actions = self.connection.on_discovery_request(now_ms, from, listen_port);
                self.apply(now_ms, actions, events);
            }
            Message::IconRequest { id } => {
                let Some(peer) = self.connection.peer() else { return };
                if !self.config.send_icons {
                    return;
                }
                tracing::debug!(%id, "icon requested");
                self.scheduler.mark_icon_sent(&id);
                self.push_icon(now_ms, peer, &id, events);
            }
            Message::StatsResponse(chunk) => {
                let Some(peer) = self.connection.peer() else { return };
                self.on_stats_chunk(now_ms, peer, &chunk, events);
            }
            other => tracing::trace!(frame = ?other.frame_type(), "ignoring frame"),
        }
    }

    fn on_stats_chunk(
        &mut self,
        now_ms: u64,
        peer: Endpoint,
        chunk: &StatsChunk,
        events: &mut Vec<EngineEvent>,
    ) {
        if !self.stats_enabled() {
            return;
        }
        let Some(store) = self.stats_store.as_mut() else { return };
        let progress = self.stats.on_response_chunk(chunk, store.sink());
        if !matches!(progress, Ok(SyncProgress::Ignored)) {
            if let Err(e) = self.send(now_ms, &peer, &Message::Ack, events) {
                tracing::warn!(error = %e, "stats ack failed");
            }
        }
        match progress {
            Ok(SyncProgress::Synced {
                remote_timestamp,
                bytes,
            }) => {
                events.push(EngineEvent::StatsSynced {
                    remote_timestamp,
                    bytes,
                });
                if let Err(e) = self.merge_and_upload(now_ms, peer, events) {
                    tracing::warn!(error = %e, "stats upload failed");
                }
            }
            Ok(SyncProgress::Failed { .. }) => events.push(EngineEvent::StatsFailed),
            Err(e) => {
                tracing::warn!(error = %e, "stats transfer aborted");
                events.push(EngineEvent::StatsFailed);
            }
            Ok(_) => {}
        }
    }

    /// Fold the pre-sync local record into the received one; push the result back when
    /// the local side had something the peer lacked.
    fn merge_and_upload(
        &mut self,
        now_ms: u64,
        peer: Endpoint,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), EngineError> {
        let local = self.stats.take_local_snapshot();
        let Some(store) = self.stats_store.as_mut() else {
            return Ok(());
        };
        let Some(remote) = store.load()? else {
            return Ok(());
        };
        let merged = stats::merge_blobs(local.as_deref(), &remote);
        if !merged.upload {
            return Ok(());
        }
        store.save(&merged.blob)?;

        let bytes = merged.blob.len() as u32;
        let mut session = stats::upload_session(merged.blob)?;
        let timestamp = merged.timestamp;
        let result = self.send_chunks(&mut session, peer, |p| {
            Message::StatsUpload(StatsChunk {
                timestamp,
                total_bytes: None,
                chunk_index: p.index as u16,
                total_chunks: p.total_chunks as u16,
                data: p.data.to_vec(),
            })
        });
        self.check_chunk_result(now_ms, result, events)?;
        tracing::info!(bytes, timestamp, "merged usage record uploaded");
        events.push(EngineEvent::StatsUploaded { bytes });
        Ok(())
    }

    fn push_icon(&mut self, now_ms: u64, peer: Endpoint, id: &str, events: &mut Vec<EngineEvent>) {
        match self.send_icon(now_ms, peer, id, events) {
            Ok(Some(bytes)) => {
                tracing::info!(%id, bytes, "icon sent");
                events.push(EngineEvent::IconSent {
                    id: id.to_string(),
                    bytes,
                });
            }
            Ok(None) => tracing::debug!(%id, "no icon available"),
            Err(e) => {
                tracing::warn!(%id, error = %e, "icon send failed");
                events.push(EngineEvent::IconFailed { id: id.to_string() });
            }
        }
    }

    fn send_icon(
        &mut self,
        now_ms: u64,
        peer: Endpoint,
        id: &str,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Option<u32>, EngineError> {
        let Some(data) = self.games.icon(id) else {
            return Ok(None);
        };
        let mut session = ChunkedSendSession::new(
            data,
            self.profile.icon_chunk_size(),
            self.profile.icon_max_chunks(),
            self.profile.icon_max_size(),
            self.profile.icon_verification(),
        )?;
        let result = self.send_chunks(&mut session, peer, |p| {
            Message::IconChunk(IconChunk {
                id: id.to_string(),
                total_size: p.total_size,
                offset: p.offset,
                chunk_index: p.index as u16,
                total_chunks: p.total_chunks as u16,
                data: p.data.to_vec(),
            })
        });
        self.check_chunk_result(now_ms, result, events)?;
        let total_size = session.total_size();
        if let Some(crc32) = session.crc() {
            let end = Message::IconEnd {
                id: id.to_string(),
                total_size,
                crc32,
            };
            self.send(now_ms, &peer, &end, events)?;
        }
        Ok(Some(total_size))
    }

    /// Paced chunk loop shared by icons and stats uploads.
    fn send_chunks<F>(
        &mut self,
        session: &mut ChunkedSendSession,
        peer: Endpoint,
        build: F,
    ) -> Result<u32, ChunkError>
    where
        F: Fn(&chunk::ChunkPiece<'_>) -> Message,
    {
        let profile = &self.profile;
        let max = self.transport.max_frame_len();
        let transport = &mut self.transport;
        let delay = self.config.chunk_delay();
        chunk::send_chunked(session, self.pacer.as_mut(), delay, |piece| {
            let bytes = wire::encode_message(profile, &build(piece))
                .and_then(|b| fits(b, max))
                .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
            transport.send(&peer, &bytes)
        })
    }

    fn check_chunk_result(
        &mut self,
        now_ms: u64,
        result: Result<u32, ChunkError>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<u32, EngineError> {
        match result {
            Ok(n) => Ok(n),
            Err(ChunkError::Send(e)) => {
                let unavailable = matches!(e, TransportError::Unavailable(_));
                if unavailable {
                    let actions = self.connection.on_transport_lost(now_ms, &mut self.transport);
                    self.apply(now_ms, actions, events);
                }
                Err(EngineError::Transport(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send(
        &mut self,
        now_ms: u64,
        to: &Endpoint,
        msg: &Message,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), EngineError> {
        let bytes = fits(
            wire::encode_message(&self.profile, msg)?,
            self.transport.max_frame_len(),
        )?;
        match self.transport.send(to, &bytes) {
            Ok(_) => Ok(()),
            Err(e) => {
                if matches!(e, TransportError::Unavailable(_)) {
                    self.on_transport_lost(now_ms, events);
                }
                Err(e.into())
            }
        }
    }

    fn on_transport_error(
        &mut self,
        now_ms: u64,
        e: TransportError,
        events: &mut Vec<EngineEvent>,
    ) {
        tracing::warn!(error = %e, "receive failed");
        if matches!(e, TransportError::Unavailable(_)) {
            self.on_transport_lost(now_ms, events);
        }
    }

    fn on_transport_lost(&mut self, now_ms: u64, events: &mut Vec<EngineEvent>) {
        let actions = self.connection.on_transport_lost(now_ms, &mut self.transport);
        self.apply(now_ms, actions, events);
    }
}

/// Every outgoing record carries this device's name and the send-once flag.
fn stamp(mut info: GameInfo, config: &EngineConfig) -> GameInfo {
    info.peer_name = config.peer_name.clone();
    info.persistent = config.send_once;
    info
}

/// Reject frames the transport cannot carry in one piece.
fn fits(frame: Vec<u8>, max: usize) -> Result<Vec<u8>, FrameEncodeError> {
    if frame.len() > max {
        return Err(FrameEncodeError::TooLarge {
            len: frame.len(),
            max,
        });
    }
    Ok(frame)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
