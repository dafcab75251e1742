//! Transport capability consumed by the engine, plus an in-memory double for hosts and tests.
//!
//! The engine never opens sockets itself. A host implements [`Transport`] over whatever
//! raw channel it has (UDP socket, bulk endpoint, byte stream) and the engine drives it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

/// Where an outbound frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// The single point-to-point link of a bulk transport.
    Link,
    Unicast(SocketAddr),
    /// Subnet broadcast on the given port.
    Broadcast(u16),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Link => write!(f, "link"),
            Endpoint::Unicast(addr) => write!(f, "{addr}"),
            Endpoint::Broadcast(port) => write!(f, "broadcast:{port}"),
        }
    }
}

/// One inbound frame and its source (None on a point-to-point link).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: Option<SocketAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Link down, radio off, cable unplugged. The state machine backs off.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw frame channel. Implementations must not block longer than the given timeout.
pub trait Transport {
    /// Largest frame (header included) the channel carries.
    fn max_frame_len(&self) -> usize;

    /// Whether the underlying medium is usable (radio switch, cable present).
    fn is_enabled(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool;

    /// Local port the peer should answer to, for channels that have one.
    fn local_port(&self) -> Option<u16> {
        None
    }

    /// Acquire the channel's resources.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Forcibly release resources held by a previous owner so the next `open` can succeed.
    fn force_cleanup(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self);

    /// Send one frame. Returns bytes written.
    fn send(&mut self, to: &Endpoint, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Wait up to `timeout` for one inbound frame.
    fn try_receive(&mut self, timeout: Duration) -> Result<Option<Datagram>, TransportError>;
}

/// Cooperative delay used between chunks.
pub trait Pacer {
    fn pause(&mut self, d: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&mut self, d: Duration) {
        if !d.is_zero() {
            std::thread::sleep(d);
        }
    }
}

/// Records requested delays without sleeping.
#[derive(Debug, Default, Clone)]
pub struct NoPacer {
    pub paused: Duration,
}

impl Pacer for NoPacer {
    fn pause(&mut self, d: Duration) {
        self.paused += d;
    }
}

/// In-memory transport: inbound queue filled by the host, outbound frames recorded.
#[derive(Debug)]
pub struct MemoryTransport {
    max_frame_len: usize,
    open: bool,
    enabled: bool,
    inbound: VecDeque<Datagram>,
    sent: Vec<(Endpoint, Vec<u8>)>,
    fail_opens: u32,
    fail_sends: bool,
    local_port: Option<u16>,
    opens: u32,
    cleanups: u32,
}

impl MemoryTransport {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            open: false,
            enabled: true,
            inbound: VecDeque::new(),
            sent: Vec::new(),
            fail_opens: 0,
            fail_sends: false,
            local_port: None,
            opens: 0,
            cleanups: 0,
        }
    }

    /// Queue a frame as if it arrived from `from`.
    pub fn push_inbound(&mut self, bytes: Vec<u8>, from: Option<SocketAddr>) {
        self.inbound.push_back(Datagram { bytes, from });
    }

    /// Drain everything sent so far.
    pub fn take_sent(&mut self) -> Vec<(Endpoint, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Make the next `n` calls to `open` fail.
    pub fn fail_next_opens(&mut self, n: u32) {
        self.fail_opens = n;
    }

    /// Make every send fail with an i/o error until cleared.
    pub fn set_fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }

    pub fn set_local_port(&mut self, port: Option<u16>) {
        self.local_port = port;
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> u32 {
        self.opens
    }

    pub fn cleanup_count(&self) -> u32 {
        self.cleanups
    }
}

impl Transport for MemoryTransport {
    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            return Err(TransportError::Unavailable("open refused".into()));
        }
        self.open = true;
        self.opens += 1;
        Ok(())
    }

    fn force_cleanup(&mut self) -> Result<(), TransportError> {
        self.cleanups += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn send(&mut self, to: &Endpoint, bytes: &[u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::Unavailable("not open".into()));
        }
        if self.fail_sends {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "send failed",
            )));
        }
        self.sent.push((*to, bytes.to_vec()));
        Ok(bytes.len())
    }

    fn try_receive(&mut self, _timeout: Duration) -> Result<Option<Datagram>, TransportError> {
        if !self.open {
            return Ok(None);
        }
        Ok(self.inbound.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_transport_refuses_send() {
        let mut t = MemoryTransport::new(512);
        assert!(matches!(
            t.send(&Endpoint::Link, b"x"),
            Err(TransportError::Unavailable(_))
        ));
        t.open().unwrap();
        assert_eq!(t.send(&Endpoint::Link, b"xyz").unwrap(), 3);
        assert_eq!(t.take_sent(), vec![(Endpoint::Link, b"xyz".to_vec())]);
        assert!(t.take_sent().is_empty());
    }

    #[test]
    fn injected_open_failures() {
        let mut t = MemoryTransport::new(512);
        t.fail_next_opens(2);
        assert!(t.open().is_err());
        assert!(t.open().is_err());
        assert!(t.open().is_ok());
        assert_eq!(t.open_count(), 1);
    }

    #[test]
    fn inbound_is_fifo() {
        let mut t = MemoryTransport::new(2048);
        t.open().unwrap();
        let from: SocketAddr = "192.168.1.5:9276".parse().unwrap();
        t.push_inbound(vec![1], Some(from));
        t.push_inbound(vec![2], None);
        let a = t.try_receive(Duration::ZERO).unwrap().unwrap();
        assert_eq!((a.bytes, a.from), (vec![1], Some(from)));
        assert_eq!(t.try_receive(Duration::ZERO).unwrap().unwrap().bytes, vec![2]);
        assert!(t.try_receive(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn no_pacer_accumulates() {
        let mut p = NoPacer::default();
        p.pause(Duration::from_millis(10));
        p.pause(Duration::from_millis(5));
        assert_eq!(p.paused, Duration::from_millis(15));
    }
}
