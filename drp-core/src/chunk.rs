//! Chunked transfer: split a blob into frames on the way out, accumulate and verify on the
//! way in. Used for icons (CRC32 or byte count) and stats JSON (byte count, streamed).

use std::io;
use std::time::Duration;

use crate::integrity::RunningChecksum;
use crate::transport::{Pacer, TransportError};
use crate::wire::Verification;

/// Number of chunks needed for `len` bytes (ceil). 0 for an empty blob.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    len.div_ceil(chunk_size)
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("nothing to send")]
    EmptyPayload,
    #[error("blob of {len} bytes exceeds the {max}-byte transfer limit")]
    TooLarge { len: usize, max: usize },
    #[error("chunk send failed: {0}")]
    Send(#[from] TransportError),
    #[error("sink: {0}")]
    Sink(#[from] io::Error),
}

/// One outbound transfer.
#[derive(Debug)]
pub struct ChunkedSendSession {
    data: Vec<u8>,
    chunk_size: usize,
    total_chunks: u32,
    next_chunk: u32,
    crc: Option<u32>,
}

/// The slice of the blob carried by one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPiece<'a> {
    pub index: u32,
    pub total_chunks: u32,
    pub offset: u32,
    pub total_size: u32,
    pub data: &'a [u8],
}

impl ChunkedSendSession {
    /// Validate limits up front; no frame is produced for an invalid blob.
    pub fn new(
        data: Vec<u8>,
        chunk_size: usize,
        max_chunks: u32,
        max_size: u32,
        verification: Verification,
    ) -> Result<Self, ChunkError> {
        if data.is_empty() {
            return Err(ChunkError::EmptyPayload);
        }
        let max = (chunk_size * max_chunks as usize).min(max_size as usize);
        if data.len() > max {
            return Err(ChunkError::TooLarge {
                len: data.len(),
                max,
            });
        }
        let crc = match verification {
            Verification::Crc32 => Some(crate::integrity::checksum(&data)),
            Verification::ByteCount => None,
        };
        Ok(Self {
            total_chunks: chunk_count(data.len(), chunk_size) as u32,
            data,
            chunk_size,
            next_chunk: 0,
            crc,
        })
    }

    pub fn total_size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// CRC32 of the whole blob when the transfer is CRC-verified.
    pub fn crc(&self) -> Option<u32> {
        self.crc
    }

    pub fn is_done(&self) -> bool {
        self.next_chunk >= self.total_chunks
    }

    pub fn next_piece(&mut self) -> Option<ChunkPiece<'_>> {
        if self.is_done() {
            return None;
        }
        let index = self.next_chunk;
        self.next_chunk += 1;
        let start = index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        Some(ChunkPiece {
            index,
            total_chunks: self.total_chunks,
            offset: start as u32,
            total_size: self.data.len() as u32,
            data: &self.data[start..end],
        })
    }
}

/// Emit every remaining chunk, pausing `delay` between frames. The first failed send
/// aborts the transfer; there is no retry. Returns the number of chunks sent.
pub fn send_chunked<F>(
    session: &mut ChunkedSendSession,
    pacer: &mut dyn Pacer,
    delay: Duration,
    mut emit: F,
) -> Result<u32, ChunkError>
where
    F: FnMut(&ChunkPiece<'_>) -> Result<usize, TransportError>,
{
    let mut sent = 0;
    while let Some(piece) = session.next_piece() {
        let first = piece.index == 0;
        if !first {
            pacer.pause(delay);
        }
        emit(&piece)?;
        sent += 1;
    }
    Ok(sent)
}

/// Destination of an inbound transfer. Nothing is visible to readers until `commit`.
pub trait ByteSink {
    /// Start a fresh transfer, dropping any uncommitted data.
    fn begin(&mut self) -> io::Result<()>;
    fn append(&mut self, data: &[u8]) -> io::Result<()>;
    /// Publish the accumulated bytes.
    fn commit(&mut self) -> io::Result<()>;
    /// Delete the partial destination.
    fn discard(&mut self);
}

/// Buffering sink; `committed` holds the last published blob.
#[derive(Debug, Default)]
pub struct MemorySink {
    partial: Vec<u8>,
    pub committed: Option<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_committed(&mut self) -> Option<Vec<u8>> {
        self.committed.take()
    }

    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }
}

impl ByteSink for MemorySink {
    fn begin(&mut self) -> io::Result<()> {
        self.partial.clear();
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.partial.extend_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> io::Result<()> {
        self.committed = Some(std::mem::take(&mut self.partial));
        Ok(())
    }

    fn discard(&mut self) {
        self.partial.clear();
    }
}

/// Header fields of one inbound chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Transfer key: icon id, or the stats timestamp.
    pub context: String,
    pub index: u32,
    pub total_chunks: u32,
    /// Declared blob size, when the frame carries one.
    pub expected_total: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    InProgress { received: u32, total: u32 },
    /// Duplicate, out-of-order or foreign chunk; nothing was written.
    Ignored,
    /// All chunks arrived; the CRC from the terminal frame is still outstanding.
    AwaitingDigest,
    Complete { total_size: u32, total_chunks: u32 },
    /// Verification failed; the sink was discarded.
    Truncated { expected: u32, written: u32 },
}

#[derive(Debug)]
struct ReceiveSession {
    context: String,
    expected_total: Option<u32>,
    total_chunks: u32,
    received_chunks: u32,
    last_index: u32,
    bytes_written: u32,
    crc: RunningChecksum,
}

/// Accumulator for one transfer kind. At most one session is active.
#[derive(Debug)]
pub struct ChunkReceiver {
    mode: Verification,
    active: Option<ReceiveSession>,
}

impl ChunkReceiver {
    pub fn new(mode: Verification) -> Self {
        Self { mode, active: None }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Drop the active session and its partial data.
    pub fn abort(&mut self, sink: &mut dyn ByteSink) {
        if self.active.take().is_some() {
            sink.discard();
        }
    }

    pub fn accept(
        &mut self,
        header: &ChunkHeader,
        data: &[u8],
        sink: &mut dyn ByteSink,
    ) -> Result<ChunkOutcome, ChunkError> {
        if header.total_chunks == 0 || header.index >= header.total_chunks {
            return Ok(ChunkOutcome::Ignored);
        }
        let fresh = header.index == 0 || self.active.is_none();
        if fresh {
            if self.active.take().is_some() {
                tracing::debug!(context = %header.context, "restarting incomplete transfer");
                sink.discard();
            }
            sink.begin()?;
            self.active = Some(ReceiveSession {
                context: header.context.clone(),
                expected_total: header.expected_total,
                total_chunks: header.total_chunks,
                received_chunks: 0,
                last_index: 0,
                bytes_written: 0,
                crc: RunningChecksum::new(),
            });
        }
        let Some(s) = self.active.as_mut() else {
            return Ok(ChunkOutcome::Ignored);
        };
        if !fresh {
            if s.context != header.context || header.index <= s.last_index {
                return Ok(ChunkOutcome::Ignored);
            }
            if s.received_chunks >= s.total_chunks {
                return Ok(ChunkOutcome::Ignored);
            }
        }

        if let Err(e) = sink.append(data) {
            self.active = None;
            sink.discard();
            return Err(ChunkError::Sink(e));
        }
        s.received_chunks += 1;
        s.last_index = header.index;
        s.bytes_written = s.bytes_written.saturating_add(data.len() as u32);
        s.crc.update(data);

        if s.received_chunks < s.total_chunks {
            return Ok(ChunkOutcome::InProgress {
                received: s.received_chunks,
                total: s.total_chunks,
            });
        }
        match self.mode {
            Verification::Crc32 => Ok(ChunkOutcome::AwaitingDigest),
            Verification::ByteCount => {
                let written = s.bytes_written;
                let total_chunks = s.total_chunks;
                let expected = s.expected_total.unwrap_or(written);
                self.active = None;
                if written == expected {
                    sink.commit()?;
                    Ok(ChunkOutcome::Complete {
                        total_size: written,
                        total_chunks,
                    })
                } else {
                    sink.discard();
                    Ok(ChunkOutcome::Truncated { expected, written })
                }
            }
        }
    }

    /// Terminal frame of a CRC-verified transfer.
    pub fn finish_with_crc(
        &mut self,
        context: &str,
        total_size: u32,
        crc: u32,
        sink: &mut dyn ByteSink,
    ) -> Result<ChunkOutcome, ChunkError> {
        match &self.active {
            Some(s) if s.context == context => {}
            _ => return Ok(ChunkOutcome::Ignored),
        }
        let Some(s) = self.active.take() else {
            return Ok(ChunkOutcome::Ignored);
        };
        let complete = s.received_chunks == s.total_chunks
            && s.bytes_written == total_size
            && s.crc.value() == crc;
        if complete {
            sink.commit()?;
            Ok(ChunkOutcome::Complete {
                total_size,
                total_chunks: s.total_chunks,
            })
        } else {
            sink.discard();
            Ok(ChunkOutcome::Truncated {
                expected: total_size,
                written: s.bytes_written,
            })
        }
    }
}
