//! Network transport: one UDP socket on an ephemeral port for the session plus a listener
//! on the discovery port. The peer's own port comes from config and is only a destination.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use drp_core::wire::NET_MAX_FRAME;
use drp_core::{Datagram, Endpoint, Transport, TransportError};

pub struct UdpTransport {
    /// 0 disables the listener.
    discovery_port: u16,
    socket: Option<UdpSocket>,
    discovery: Option<UdpSocket>,
    local_ips: Vec<IpAddr>,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub fn new(discovery_port: u16) -> Self {
        Self {
            discovery_port,
            socket: None,
            discovery: None,
            local_ips: Vec::new(),
            buf: vec![0u8; NET_MAX_FRAME],
        }
    }

    /// Our own broadcasts come back on the discovery listener.
    fn is_echo(&self, from: SocketAddr) -> bool {
        self.local_port() == Some(from.port())
            && (from.ip().is_loopback() || self.local_ips.contains(&from.ip()))
    }
}

fn bind(port: u16) -> std::io::Result<UdpSocket> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    sock.set_broadcast(true)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// Address the default route would use. Connecting a UDP socket sends nothing.
fn primary_ip() -> Option<IpAddr> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    sock.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    sock.local_addr().ok().map(|a| a.ip())
}

fn classify(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::AddrNotAvailable
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::PermissionDenied => TransportError::Unavailable(e.to_string()),
        _ => TransportError::Io(e),
    }
}

fn recv(sock: &UdpSocket, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
    match sock.recv_from(buf) {
        Ok(r) => Ok(Some(r)),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
        // ICMP port unreachable from an earlier send; not fatal for a datagram socket.
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(None),
        Err(e) => Err(classify(e)),
    }
}

impl Transport for UdpTransport {
    fn max_frame_len(&self) -> usize {
        NET_MAX_FRAME
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn local_port(&self) -> Option<u16> {
        let sock = self.socket.as_ref()?;
        sock.local_addr().ok().map(|a| a.port())
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let sock = bind(0).map_err(classify)?;
        self.local_ips = primary_ip().into_iter().collect();
        self.discovery = match self.discovery_port {
            0 => None,
            port => match bind(port) {
                Ok(d) => Some(d),
                Err(e) => {
                    tracing::warn!(port, error = %e, "discovery listener unavailable");
                    None
                }
            },
        };
        self.socket = Some(sock);
        tracing::info!(
            port = ?self.local_port(),
            discovery = self.discovery.is_some(),
            "udp transport open"
        );
        Ok(())
    }

    /// Dropping the sockets releases their ports; there is nothing else to reclaim.
    fn force_cleanup(&mut self) -> Result<(), TransportError> {
        self.socket = None;
        self.discovery = None;
        tracing::debug!("udp sockets released");
        Ok(())
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            tracing::debug!("udp transport closed");
        }
        self.discovery = None;
    }

    fn send(&mut self, to: &Endpoint, bytes: &[u8]) -> Result<usize, TransportError> {
        let Some(sock) = self.socket.as_ref() else {
            return Err(TransportError::Unavailable("socket not open".into()));
        };
        let addr = match *to {
            Endpoint::Unicast(addr) => addr,
            Endpoint::Broadcast(port) => SocketAddr::from((Ipv4Addr::BROADCAST, port)),
            Endpoint::Link => {
                return Err(TransportError::Unavailable("udp has no link endpoint".into()))
            }
        };
        sock.send_to(bytes, addr).map_err(classify)
    }

    fn try_receive(&mut self, timeout: Duration) -> Result<Option<Datagram>, TransportError> {
        let Some(sock) = self.socket.as_ref() else {
            return Err(TransportError::Unavailable("socket not open".into()));
        };
        if !timeout.is_zero() {
            std::thread::sleep(timeout.min(Duration::from_millis(50)));
        }
        if let Some((n, from)) = recv(sock, &mut self.buf)? {
            return Ok(Some(Datagram {
                bytes: self.buf[..n].to_vec(),
                from: Some(from),
            }));
        }
        let Some(disc) = self.discovery.as_ref() else {
            return Ok(None);
        };
        while let Some((n, from)) = recv(disc, &mut self.buf)? {
            if self.is_echo(from) {
                continue;
            }
            return Ok(Some(Datagram {
                bytes: self.buf[..n].to_vec(),
                from: Some(from),
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drp_core::{encode_message, decode_message, Message, NetProfile};

    #[test]
    fn unicast_round_trip_on_loopback() {
        let mut t = UdpTransport::new(0);
        t.open().unwrap();
        let port = t.local_port().unwrap();
        let to = Endpoint::Unicast(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        let frame = encode_message(&NetProfile, &Message::Ack).unwrap();
        assert_eq!(t.send(&to, &frame).unwrap(), frame.len());

        let mut got = None;
        for _ in 0..50 {
            if let Some(d) = t.try_receive(Duration::from_millis(10)).unwrap() {
                got = Some(d);
                break;
            }
        }
        let d = got.expect("datagram");
        assert_eq!(decode_message(&NetProfile, &d.bytes).unwrap(), Message::Ack);
        t.close();
        assert!(!t.is_open());
    }

    #[test]
    fn send_before_open_is_unavailable() {
        let mut t = UdpTransport::new(0);
        let err = t.send(&Endpoint::Broadcast(9277), b"x").unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
    }

    #[test]
    fn link_endpoint_is_rejected() {
        let mut t = UdpTransport::new(0);
        t.open().unwrap();
        assert!(t.send(&Endpoint::Link, b"x").is_err());
    }

    #[test]
    fn sessions_bind_distinct_ephemeral_ports() {
        let mut a = UdpTransport::new(0);
        let mut b = UdpTransport::new(0);
        assert_eq!(a.local_port(), None);
        a.open().unwrap();
        b.open().unwrap();
        let (pa, pb) = (a.local_port().unwrap(), b.local_port().unwrap());
        assert_ne!(pa, 0);
        assert_ne!(pa, pb);
    }

    #[test]
    fn echo_filter_matches_own_port_only() {
        let mut t = UdpTransport::new(0);
        t.open().unwrap();
        let port = t.local_port().unwrap();
        let other = port.wrapping_add(1);
        assert!(t.is_echo(SocketAddr::from((Ipv4Addr::LOCALHOST, port))));
        assert!(!t.is_echo(SocketAddr::from((Ipv4Addr::LOCALHOST, other))));
        assert!(!t.is_echo(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 44), port))));
    }

    #[test]
    fn force_cleanup_releases_and_reopens() {
        let mut t = UdpTransport::new(0);
        t.open().unwrap();
        t.force_cleanup().unwrap();
        assert!(!t.is_open());
        assert_eq!(t.local_port(), None);
        assert!(matches!(
            t.send(&Endpoint::Broadcast(9277), b"x"),
            Err(TransportError::Unavailable(_))
        ));
        t.open().unwrap();
        assert!(t.is_open());
        assert!(t.local_port().is_some());
    }
}
