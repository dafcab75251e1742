//! Connection state machine: discovery or fixed-address handshake, timeouts, takeover on
//! the first failed open, and transport loss.
//!
//! The machine never encodes frames. It drives the transport's lifecycle and returns
//! [`SessionAction`]s that the engine turns into frames and events.

use std::net::SocketAddr;

use crate::config::EngineConfig;
use crate::transport::{Endpoint, Transport};

/// Delay before re-opening a transport after a failed open.
pub const OPEN_RETRY_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Discovering,
    AwaitingAck,
    Connected { peer: Endpoint, since_ms: u64 },
}

/// How the peer is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTarget {
    /// Point-to-point link: up means connected.
    Link,
    /// Send a hello to this address and wait for its Ack.
    Fixed(SocketAddr),
    /// Broadcast discovery requests.
    Discover,
}

impl PeerTarget {
    /// Target for a datagram session.
    pub fn from_config(cfg: &EngineConfig) -> Self {
        match cfg.peer_address {
            Some(ip) if !cfg.uses_discovery() => PeerTarget::Fixed(SocketAddr::new(ip, cfg.port)),
            _ => PeerTarget::Discover,
        }
    }
}

/// Work requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send the current game info as the connect hello.
    SendHello(Endpoint),
    BroadcastDiscovery,
    /// Answer a peer's discovery request.
    RespondDiscovery(Endpoint),
    Connected(Endpoint),
    Disconnected,
    /// A connect attempt expired without an answer.
    TimedOut,
    /// Write a newly learned peer address back to the config store.
    PersistPeer(SocketAddr),
    /// Initial connect timed out with `shutdown_on_timeout`; the transport is closed.
    Shutdown,
}

#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    target: PeerTarget,
    retry_ms: u64,
    timeout_ms: Option<u64>,
    shutdown_on_timeout: bool,
    last_connect_attempt: Option<u64>,
    /// Start of the current unanswered connect cycle.
    attempt_started: Option<u64>,
    ever_connected: bool,
    open_failures: u32,
    next_open_at: Option<u64>,
    persisted_peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(target: PeerTarget, cfg: &EngineConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            target,
            retry_ms: cfg.connect_retry().as_millis() as u64,
            timeout_ms: cfg.connect_timeout().map(|d| d.as_millis() as u64),
            shutdown_on_timeout: cfg.shutdown_on_timeout,
            last_connect_attempt: None,
            attempt_started: None,
            ever_connected: false,
            open_failures: 0,
            next_open_at: None,
            persisted_peer: cfg.peer_address.map(|ip| SocketAddr::new(ip, cfg.port)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn target(&self) -> PeerTarget {
        self.target
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    pub fn peer(&self) -> Option<Endpoint> {
        match self.state {
            ConnectionState::Connected { peer, .. } => Some(peer),
            _ => None,
        }
    }

    /// Advance timers and the transport lifecycle.
    pub fn poll(&mut self, now_ms: u64, transport: &mut dyn Transport) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        if self.check_timeout(now_ms, transport, &mut actions) {
            return actions;
        }

        if !transport.is_enabled() {
            if transport.is_open() {
                tracing::info!("transport disabled, releasing it");
                transport.close();
            }
            self.drop_to_disconnected(&mut actions);
            return actions;
        }

        if !transport.is_open() && !self.open_transport(now_ms, transport) {
            return actions;
        }

        let retry_due = self
            .last_connect_attempt
            .map_or(true, |t| now_ms.saturating_sub(t) >= self.retry_ms);
        match self.state {
            ConnectionState::Disconnected => {
                if retry_due {
                    self.start_attempt(now_ms, &mut actions);
                }
            }
            ConnectionState::AwaitingAck => {
                if retry_due {
                    if let PeerTarget::Fixed(addr) = self.target {
                        self.last_connect_attempt = Some(now_ms);
                        actions.push(SessionAction::SendHello(Endpoint::Unicast(addr)));
                    }
                }
            }
            ConnectionState::Discovering => {
                if retry_due {
                    self.last_connect_attempt = Some(now_ms);
                    actions.push(SessionAction::BroadcastDiscovery);
                }
            }
            ConnectionState::Connected { .. } => {}
        }
        actions
    }

    /// Ack from the peer. Only completes a pending handshake.
    pub fn on_ack(&mut self, now_ms: u64, from: Option<SocketAddr>) -> Vec<SessionAction> {
        if self.state != ConnectionState::AwaitingAck {
            return Vec::new();
        }
        let peer = match (from, self.target) {
            (Some(addr), _) => Endpoint::Unicast(addr),
            (None, PeerTarget::Fixed(addr)) => Endpoint::Unicast(addr),
            (None, _) => Endpoint::Link,
        };
        tracing::info!(%peer, "peer acknowledged");
        vec![self.connect(now_ms, peer)]
    }

    /// A peer answered our discovery broadcast.
    pub fn on_discovery_response(&mut self, now_ms: u64, from: SocketAddr) -> Vec<SessionAction> {
        if self.state != ConnectionState::Discovering {
            return Vec::new();
        }
        tracing::info!(peer = %from, "peer discovered");
        let mut actions = vec![self.connect(now_ms, Endpoint::Unicast(from))];
        self.remember_peer(from, &mut actions);
        actions
    }

    /// A peer is looking for us; it will listen on `listen_port` at its own address.
    pub fn on_discovery_request(
        &mut self,
        now_ms: u64,
        from: SocketAddr,
        listen_port: u16,
    ) -> Vec<SessionAction> {
        if self.state != ConnectionState::Discovering {
            return Vec::new();
        }
        let peer = SocketAddr::new(from.ip(), listen_port);
        tracing::info!(%peer, "answering discovery request");
        let mut actions = vec![
            SessionAction::RespondDiscovery(Endpoint::Unicast(from)),
            self.connect(now_ms, Endpoint::Unicast(peer)),
        ];
        self.remember_peer(peer, &mut actions);
        actions
    }

    /// A send reported the medium gone: close it and back off before re-opening.
    pub fn on_transport_lost(
        &mut self,
        now_ms: u64,
        transport: &mut dyn Transport,
    ) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        tracing::warn!("transport lost");
        transport.close();
        self.next_open_at = Some(now_ms + OPEN_RETRY_MS);
        self.drop_to_disconnected(&mut actions);
        actions
    }

    /// Tear down for shutdown.
    pub fn close(&mut self, transport: &mut dyn Transport) {
        if transport.is_open() {
            transport.close();
        }
        self.state = ConnectionState::Disconnected;
    }

    fn check_timeout(
        &mut self,
        now_ms: u64,
        transport: &mut dyn Transport,
        actions: &mut Vec<SessionAction>,
    ) -> bool {
        let (Some(timeout), Some(start)) = (self.timeout_ms, self.attempt_started) else {
            return false;
        };
        if self.is_connected() || now_ms.saturating_sub(start) < timeout {
            return false;
        }
        self.attempt_started = None;
        self.state = ConnectionState::Disconnected;
        self.last_connect_attempt = Some(now_ms);
        if self.shutdown_on_timeout && !self.ever_connected {
            tracing::info!(timeout_ms = timeout, "connect timeout reached, shutting down");
            transport.close();
            actions.push(SessionAction::Shutdown);
            return true;
        }
        tracing::info!(timeout_ms = timeout, "connect attempt timed out");
        actions.push(SessionAction::TimedOut);
        false
    }

    fn open_transport(&mut self, now_ms: u64, transport: &mut dyn Transport) -> bool {
        if self.next_open_at.is_some_and(|t| now_ms < t) {
            return false;
        }
        match transport.open() {
            Ok(()) => {
                tracing::debug!("transport open");
                self.next_open_at = None;
                true
            }
            Err(e) => {
                self.open_failures += 1;
                tracing::warn!(attempt = self.open_failures, error = %e, "transport open failed");
                if self.open_failures == 1 {
                    tracing::info!("first open failure, forcing cleanup of previous owner");
                    if let Err(e) = transport.force_cleanup() {
                        tracing::warn!(error = %e, "forced cleanup failed");
                    }
                }
                self.next_open_at = Some(now_ms + OPEN_RETRY_MS);
                false
            }
        }
    }

    fn start_attempt(&mut self, now_ms: u64, actions: &mut Vec<SessionAction>) {
        self.last_connect_attempt = Some(now_ms);
        self.attempt_started.get_or_insert(now_ms);
        match self.target {
            PeerTarget::Link => actions.push(self.connect(now_ms, Endpoint::Link)),
            PeerTarget::Fixed(addr) => {
                tracing::debug!(peer = %addr, "sending hello, awaiting ack");
                self.state = ConnectionState::AwaitingAck;
                actions.push(SessionAction::SendHello(Endpoint::Unicast(addr)));
            }
            PeerTarget::Discover => {
                tracing::debug!("discovering peer");
                self.state = ConnectionState::Discovering;
                actions.push(SessionAction::BroadcastDiscovery);
            }
        }
    }

    fn connect(&mut self, now_ms: u64, peer: Endpoint) -> SessionAction {
        self.state = ConnectionState::Connected {
            peer,
            since_ms: now_ms,
        };
        self.attempt_started = None;
        self.ever_connected = true;
        SessionAction::Connected(peer)
    }

    fn remember_peer(&mut self, peer: SocketAddr, actions: &mut Vec<SessionAction>) {
        if self.persisted_peer != Some(peer) {
            self.persisted_peer = Some(peer);
            actions.push(SessionAction::PersistPeer(peer));
        }
    }

    fn drop_to_disconnected(&mut self, actions: &mut Vec<SessionAction>) {
        if self.state != ConnectionState::Disconnected {
            let was_connected = self.is_connected();
            self.state = ConnectionState::Disconnected;
            if was_connected {
                tracing::info!("disconnected");
                actions.push(SessionAction::Disconnected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn fixed_cfg() -> EngineConfig {
        EngineConfig {
            peer_address: Some("10.0.0.2".parse().unwrap()),
            auto_discovery: false,
            ..EngineConfig::default()
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.2:9276".parse().unwrap()
    }

    #[test]
    fn fixed_peer_handshake() {
        let cfg = fixed_cfg();
        let mut c = Connection::new(PeerTarget::from_config(&cfg), &cfg);
        let mut t = MemoryTransport::new(2048);
        let a = c.poll(0, &mut t);
        assert_eq!(a, vec![SessionAction::SendHello(Endpoint::Unicast(peer()))]);
        assert_eq!(c.state(), ConnectionState::AwaitingAck);

        // Hello is resent on the retry interval until acked.
        assert!(c.poll(1_000, &mut t).is_empty());
        assert_eq!(c.poll(5_000, &mut t).len(), 1);

        let a = c.on_ack(5_100, Some(peer()));
        assert_eq!(a, vec![SessionAction::Connected(Endpoint::Unicast(peer()))]);
        assert_eq!(
            c.state(),
            ConnectionState::Connected {
                peer: Endpoint::Unicast(peer()),
                since_ms: 5_100
            }
        );
    }

    #[test]
    fn ack_while_disconnected_is_ignored() {
        let cfg = fixed_cfg();
        let mut c = Connection::new(PeerTarget::from_config(&cfg), &cfg);
        assert!(c.on_ack(0, Some(peer())).is_empty());
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn discovery_response_connects_and_persists() {
        let cfg = EngineConfig::default();
        let mut c = Connection::new(PeerTarget::from_config(&cfg), &cfg);
        let mut t = MemoryTransport::new(2048);
        assert_eq!(c.poll(0, &mut t), vec![SessionAction::BroadcastDiscovery]);
        assert_eq!(c.state(), ConnectionState::Discovering);

        let desktop: SocketAddr = "192.168.1.9:9276".parse().unwrap();
        let a = c.on_discovery_response(10, desktop);
        assert_eq!(
            a,
            vec![
                SessionAction::Connected(Endpoint::Unicast(desktop)),
                SessionAction::PersistPeer(desktop)
            ]
        );

        // A second response does not reset the connection.
        let other: SocketAddr = "192.168.1.10:9276".parse().unwrap();
        assert!(c.on_discovery_response(20, other).is_empty());
        assert_eq!(c.peer(), Some(Endpoint::Unicast(desktop)));
    }

    #[test]
    fn known_peer_is_not_persisted_again() {
        let cfg = EngineConfig {
            peer_address: Some("192.168.1.9".parse().unwrap()),
            ..EngineConfig::default()
        };
        let mut c = Connection::new(PeerTarget::from_config(&cfg), &cfg);
        c.poll(0, &mut MemoryTransport::new(2048));
        let a = c.on_discovery_response(1, "192.168.1.9:9276".parse().unwrap());
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn inbound_discovery_request_is_answered() {
        let cfg = EngineConfig::default();
        let mut c = Connection::new(PeerTarget::Discover, &cfg);
        c.poll(0, &mut MemoryTransport::new(2048));
        let from: SocketAddr = "192.168.1.9:40000".parse().unwrap();
        let a = c.on_discovery_request(5, from, 9276);
        let peer: SocketAddr = "192.168.1.9:9276".parse().unwrap();
        assert_eq!(
            a,
            vec![
                SessionAction::RespondDiscovery(Endpoint::Unicast(from)),
                SessionAction::Connected(Endpoint::Unicast(peer)),
                SessionAction::PersistPeer(peer),
            ]
        );
    }

    #[test]
    fn timeout_returns_to_disconnected_then_retries() {
        let cfg = EngineConfig {
            connect_timeout_s: 10,
            ..fixed_cfg()
        };
        let mut c = Connection::new(PeerTarget::from_config(&cfg), &cfg);
        let mut t = MemoryTransport::new(2048);
        c.poll(0, &mut t);
        assert_eq!(c.poll(10_000, &mut t), vec![SessionAction::TimedOut]);
        assert_eq!(c.state(), ConnectionState::Disconnected);
        // Next attempt waits for the retry interval.
        assert!(c.poll(12_000, &mut t).is_empty());
        assert_eq!(
            c.poll(15_000, &mut t),
            vec![SessionAction::SendHello(Endpoint::Unicast(peer()))]
        );
    }

    #[test]
    fn initial_timeout_can_shut_down() {
        let cfg = EngineConfig {
            connect_timeout_s: 5,
            shutdown_on_timeout: true,
            ..EngineConfig::default()
        };
        let mut c = Connection::new(PeerTarget::Discover, &cfg);
        let mut t = MemoryTransport::new(2048);
        c.poll(0, &mut t);
        assert!(t.is_open());
        assert_eq!(c.poll(5_000, &mut t), vec![SessionAction::Shutdown]);
        assert!(!t.is_open());
    }

    #[test]
    fn first_open_failure_forces_cleanup_once() {
        let cfg = EngineConfig::default();
        let mut c = Connection::new(PeerTarget::Discover, &cfg);
        let mut t = MemoryTransport::new(2048);
        t.fail_next_opens(3);
        assert!(c.poll(0, &mut t).is_empty());
        assert_eq!(t.cleanup_count(), 1);
        // Backing off.
        assert!(c.poll(1_000, &mut t).is_empty());
        assert!(c.poll(2_000, &mut t).is_empty());
        assert!(c.poll(4_000, &mut t).is_empty());
        assert_eq!(t.cleanup_count(), 1);
        assert_eq!(c.poll(6_000, &mut t), vec![SessionAction::BroadcastDiscovery]);
        assert_eq!(t.open_count(), 1);
    }

    #[test]
    fn link_connects_when_up_and_drops_when_disabled() {
        let cfg = EngineConfig::default();
        let mut c = Connection::new(PeerTarget::Link, &cfg);
        let mut t = MemoryTransport::new(512);
        assert_eq!(
            c.poll(0, &mut t),
            vec![SessionAction::Connected(Endpoint::Link)]
        );
        t.set_enabled(false);
        assert_eq!(c.poll(100, &mut t), vec![SessionAction::Disconnected]);
        assert!(!t.is_open());
        assert!(c.poll(200, &mut t).is_empty());
        t.set_enabled(true);
        assert_eq!(
            c.poll(5_000, &mut t),
            vec![SessionAction::Connected(Endpoint::Link)]
        );
    }

    #[test]
    fn transport_loss_backs_off() {
        let cfg = EngineConfig::default();
        let mut c = Connection::new(PeerTarget::Link, &cfg);
        let mut t = MemoryTransport::new(512);
        c.poll(0, &mut t);
        assert_eq!(
            c.on_transport_lost(100, &mut t),
            vec![SessionAction::Disconnected]
        );
        assert!(c.poll(1_000, &mut t).is_empty());
        assert!(!t.is_open());
        assert_eq!(
            c.poll(5_000, &mut t),
            vec![SessionAction::Connected(Endpoint::Link)]
        );
    }
}
