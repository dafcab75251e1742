//! Bulk transport over a USB bridge that exposes the two bulk endpoints as one TCP byte
//! stream. Frames are cut out of the stream by their length header.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use drp_core::wire::{BulkProfile, BULK_MAGIC, BULK_MAX_FRAME};
use drp_core::{Datagram, Endpoint, Transport, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const MIN_READ_WAIT: Duration = Duration::from_millis(1);

pub struct StreamTransport {
    bridge: String,
    stream: Option<TcpStream>,
    pending: Vec<u8>,
}

impl StreamTransport {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            stream: None,
            pending: Vec::new(),
        }
    }

    /// Take one whole frame off the front of the buffer. Garbage before a magic is skipped.
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match BulkProfile.frame_len(&self.pending) {
                Ok(Some(n)) if self.pending.len() >= n => {
                    return Some(self.pending.drain(..n).collect());
                }
                Ok(_) => return None,
                Err(e) => {
                    let magic = BULK_MAGIC.to_le_bytes();
                    let skip = self.pending[1..]
                        .windows(magic.len())
                        .position(|w| w == magic)
                        .map(|i| i + 1)
                        .unwrap_or(self.pending.len() - (magic.len() - 1));
                    tracing::debug!(error = %e, skipped = skip, "resyncing bulk stream");
                    self.pending.drain(..skip);
                }
            }
        }
    }

    fn lost(&mut self, reason: String) -> TransportError {
        self.stream = None;
        self.pending.clear();
        TransportError::Unavailable(reason)
    }
}

impl Transport for StreamTransport {
    fn max_frame_len(&self) -> usize {
        BULK_MAX_FRAME
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let addr = self
            .bridge
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Unavailable(format!("cannot resolve {}", self.bridge)))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| TransportError::Unavailable(format!("bridge {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        tracing::info!(bridge = %addr, "usb bridge connected");
        self.pending.clear();
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("usb bridge closed");
        }
        self.pending.clear();
    }

    fn send(&mut self, to: &Endpoint, bytes: &[u8]) -> Result<usize, TransportError> {
        if *to != Endpoint::Link {
            return Err(TransportError::Unavailable(format!("bulk cannot reach {to}")));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Unavailable("bridge not connected".into()));
        };
        match stream.write_all(bytes) {
            Ok(()) => Ok(bytes.len()),
            Err(e) => Err(self.lost(e.to_string())),
        }
    }

    fn try_receive(&mut self, timeout: Duration) -> Result<Option<Datagram>, TransportError> {
        if let Some(frame) = self.next_frame() {
            return Ok(Some(Datagram { bytes: frame, from: None }));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Unavailable("bridge not connected".into()));
        };
        stream.set_read_timeout(Some(timeout.max(MIN_READ_WAIT)))?;
        let mut buf = [0u8; BULK_MAX_FRAME];
        match stream.read(&mut buf) {
            Ok(0) => Err(self.lost("bridge closed the stream".into())),
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(self
                    .next_frame()
                    .map(|bytes| Datagram { bytes, from: None }))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(self.lost(e.to_string())),
        }
    }
}
