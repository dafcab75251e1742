//! Framing: per-transport header layout + packed little-endian payloads.
//!
//! Two profiles exist. The datagram profile uses a 5-byte header (`"PSPR"`, type); the
//! bulk profile uses an 8-byte header (magic as LE u32, type, reserved, payload length).

use crate::protocol::{
    FrameType, GameInfo, GameState, IconChunk, Message, StatsChunk, BULK_ICON_CHUNK_SIZE,
    ID_LEN, NAME_LEN, NET_ICON_CHUNK_SIZE, STATS_CHUNK_SIZE, TITLE_LEN, VERSION_LEN,
};

/// Magic of the datagram profile.
pub const NET_MAGIC: [u8; 4] = *b"PSPR";
/// Magic of the bulk profile, written as a little-endian u32.
pub const BULK_MAGIC: u32 = 0x5053_5044;

/// Largest datagram the network profile emits (header included).
pub const NET_MAX_FRAME: usize = 2048;
/// Largest bulk transfer (header included).
pub const BULK_MAX_FRAME: usize = 512;

const BULK_TITLE_LEN: usize = 64;

/// How the receiver of an icon transfer verifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Terminal frame carries a CRC32 of the whole blob.
    Crc32,
    /// Accumulated bytes must equal the declared total.
    ByteCount,
}

/// One decoded frame. `frame_type` is kept raw so unknown types survive decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

/// Framing constants and payload layouts of one transport.
pub trait TransportProfile {
    /// Short name used in logs.
    fn name(&self) -> &'static str;
    fn header_len(&self) -> usize;
    /// Largest payload that fits one frame.
    fn max_payload(&self) -> usize;
    fn write_header(&self, frame_type: u8, payload_len: usize, out: &mut Vec<u8>);
    /// Validate the header; return the type and the payload slice.
    fn split_header<'a>(&self, bytes: &'a [u8]) -> Result<(u8, &'a [u8]), FrameDecodeError>;

    fn supports(&self, frame_type: FrameType) -> bool;
    fn icon_chunk_size(&self) -> usize;
    /// Upper bound of the chunk-count field used by icon transfers.
    fn icon_max_chunks(&self) -> u32;
    /// Largest icon the size fields can describe.
    fn icon_max_size(&self) -> u32;
    fn icon_verification(&self) -> Verification;
    /// The heartbeat strength byte carries battery percent instead of signal strength.
    fn heartbeat_reports_battery(&self) -> bool {
        false
    }

    fn encode_payload(&self, msg: &Message) -> Result<Vec<u8>, FrameEncodeError>;
    fn decode_payload(&self, frame_type: FrameType, payload: &[u8])
        -> Result<Message, FrameDecodeError>;
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("payload of {len} bytes exceeds the {max}-byte frame limit")]
    TooLarge { len: usize, max: usize },
    #[error("{0:?} frames are not carried by the {1} profile")]
    Unsupported(FrameType, &'static str),
}

/// Error decoding a frame. Callers drop the packet; none of these are fatal.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("bad magic")]
    BadMagic,
    #[error("truncated frame")]
    Truncated,
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
}

/// Encode header + payload.
pub fn encode_frame<P: TransportProfile + ?Sized>(
    profile: &P,
    frame_type: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FrameEncodeError> {
    let max = profile.max_payload();
    if payload.len() > max {
        return Err(FrameEncodeError::TooLarge {
            len: payload.len(),
            max,
        });
    }
    let mut out = Vec::with_capacity(profile.header_len() + payload.len());
    profile.write_header(frame_type, payload.len(), &mut out);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame. Never panics on malformed input.
pub fn decode_frame<P: TransportProfile + ?Sized>(
    profile: &P,
    bytes: &[u8],
) -> Result<Frame, FrameDecodeError> {
    let (frame_type, payload) = profile.split_header(bytes)?;
    Ok(Frame {
        frame_type,
        payload: payload.to_vec(),
    })
}

/// Encode a typed message into a complete frame.
pub fn encode_message<P: TransportProfile + ?Sized>(
    profile: &P,
    msg: &Message,
) -> Result<Vec<u8>, FrameEncodeError> {
    let frame_type = msg.frame_type();
    if !profile.supports(frame_type) {
        return Err(FrameEncodeError::Unsupported(frame_type, profile.name()));
    }
    let payload = profile.encode_payload(msg)?;
    encode_frame(profile, frame_type as u8, &payload)
}

/// Decode a complete frame into a typed message.
pub fn decode_message<P: TransportProfile + ?Sized>(
    profile: &P,
    bytes: &[u8],
) -> Result<Message, FrameDecodeError> {
    let (raw_type, payload) = profile.split_header(bytes)?;
    let frame_type = FrameType::try_from(raw_type).map_err(FrameDecodeError::UnknownType)?;
    if !profile.supports(frame_type) {
        return Err(FrameDecodeError::UnknownType(raw_type));
    }
    profile.decode_payload(frame_type, payload)
}

/// Datagram (network) profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetProfile;

impl TransportProfile for NetProfile {
    fn name(&self) -> &'static str {
        "net"
    }

    fn header_len(&self) -> usize {
        5
    }

    fn max_payload(&self) -> usize {
        NET_MAX_FRAME - self.header_len()
    }

    fn write_header(&self, frame_type: u8, _payload_len: usize, out: &mut Vec<u8>) {
        out.extend_from_slice(&NET_MAGIC);
        out.push(frame_type);
    }

    fn split_header<'a>(&self, bytes: &'a [u8]) -> Result<(u8, &'a [u8]), FrameDecodeError> {
        if bytes.len() < self.header_len() {
            return Err(FrameDecodeError::Truncated);
        }
        if bytes[..4] != NET_MAGIC {
            return Err(FrameDecodeError::BadMagic);
        }
        Ok((bytes[4], &bytes[5..]))
    }

    fn supports(&self, frame_type: FrameType) -> bool {
        !matches!(
            frame_type,
            FrameType::StatsRequest | FrameType::StatsUpload | FrameType::StatsResponse
        )
    }

    fn icon_chunk_size(&self) -> usize {
        NET_ICON_CHUNK_SIZE
    }

    fn icon_max_chunks(&self) -> u32 {
        u16::MAX as u32
    }

    fn icon_max_size(&self) -> u32 {
        u32::MAX
    }

    fn icon_verification(&self) -> Verification {
        Verification::Crc32
    }

    fn encode_payload(&self, msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
        let mut out = Vec::new();
        match msg {
            Message::Heartbeat {
                uptime_seconds,
                strength,
            } => {
                out.extend_from_slice(&uptime_seconds.to_le_bytes());
                out.push(*strength);
            }
            Message::GameInfo(info) => {
                put_str(&mut out, &info.id, ID_LEN);
                put_str(&mut out, &info.title, TITLE_LEN);
                out.extend_from_slice(&info.start_time.to_le_bytes());
                out.push(info.state as u8);
                out.push(info.has_icon as u8);
                out.push(info.persistent as u8);
                put_str(&mut out, &info.peer_name, NAME_LEN);
            }
            Message::IconChunk(chunk) => {
                put_str(&mut out, &chunk.id, ID_LEN);
                out.extend_from_slice(&chunk.chunk_index.to_le_bytes());
                out.extend_from_slice(&chunk.total_chunks.to_le_bytes());
                out.extend_from_slice(&(chunk.data.len() as u16).to_le_bytes());
                out.extend_from_slice(&chunk.data);
            }
            Message::IconEnd {
                id,
                total_size,
                crc32,
            } => {
                put_str(&mut out, id, ID_LEN);
                out.extend_from_slice(&total_size.to_le_bytes());
                out.extend_from_slice(&crc32.to_le_bytes());
            }
            Message::Ack => {}
            Message::IconRequest { id } => put_str(&mut out, id, ID_LEN),
            Message::DiscoveryRequest {
                listen_port,
                version,
            } => {
                out.extend_from_slice(&listen_port.to_le_bytes());
                put_str(&mut out, version, VERSION_LEN);
            }
            Message::DiscoveryResponse {
                peer_name,
                version,
                battery_percent,
            } => {
                put_str(&mut out, peer_name, NAME_LEN);
                put_str(&mut out, version, VERSION_LEN);
                out.push(*battery_percent);
            }
            other => {
                return Err(FrameEncodeError::Unsupported(other.frame_type(), self.name()))
            }
        }
        Ok(out)
    }

    fn decode_payload(
        &self,
        frame_type: FrameType,
        payload: &[u8],
    ) -> Result<Message, FrameDecodeError> {
        let mut r = Reader::new(payload);
        let msg = match frame_type {
            FrameType::Heartbeat => Message::Heartbeat {
                uptime_seconds: r.u32()?,
                strength: r.u8()?,
            },
            FrameType::GameInfo => {
                let id = r.str(ID_LEN)?;
                let title = r.str(TITLE_LEN)?;
                let start_time = r.u32()?;
                let state = GameState::try_from(r.u8()?).unwrap_or_default();
                let has_icon = r.u8()? != 0;
                let persistent = r.u8()? != 0;
                let peer_name = r.str(NAME_LEN)?;
                Message::GameInfo(GameInfo {
                    id,
                    title,
                    state,
                    start_time,
                    has_icon,
                    persistent,
                    peer_name,
                })
            }
            FrameType::IconChunk => {
                let id = r.str(ID_LEN)?;
                let chunk_index = r.u16()?;
                let total_chunks = r.u16()?;
                let len = r.u16()? as usize;
                Message::IconChunk(IconChunk {
                    id,
                    total_size: 0,
                    offset: 0,
                    chunk_index,
                    total_chunks,
                    data: r.bytes(len)?.to_vec(),
                })
            }
            FrameType::IconEnd => Message::IconEnd {
                id: r.str(ID_LEN)?,
                total_size: r.u32()?,
                crc32: r.u32()?,
            },
            FrameType::Ack => Message::Ack,
            FrameType::IconRequest => Message::IconRequest { id: r.str(ID_LEN)? },
            FrameType::DiscoveryRequest => Message::DiscoveryRequest {
                listen_port: r.u16()?,
                version: r.str(VERSION_LEN)?,
            },
            FrameType::DiscoveryResponse => Message::DiscoveryResponse {
                peer_name: r.str(NAME_LEN)?,
                version: r.str(VERSION_LEN)?,
                battery_percent: r.u8()?,
            },
            other => return Err(FrameDecodeError::UnknownType(other as u8)),
        };
        Ok(msg)
    }
}

/// Bulk-endpoint (USB-style) profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkProfile;

impl BulkProfile {
    /// Length of the complete frame at the front of `bytes`, once its header is buffered.
    /// Used by stream transports to cut frames out of a byte stream.
    pub fn frame_len(&self, bytes: &[u8]) -> Result<Option<usize>, FrameDecodeError> {
        if bytes.len() < self.header_len() {
            return Ok(None);
        }
        if read_u32(&bytes[..4]) != BULK_MAGIC {
            return Err(FrameDecodeError::BadMagic);
        }
        let len = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        if len > self.max_payload() {
            return Err(FrameDecodeError::Truncated);
        }
        Ok(Some(self.header_len() + len))
    }
}

impl TransportProfile for BulkProfile {
    fn name(&self) -> &'static str {
        "bulk"
    }

    fn header_len(&self) -> usize {
        8
    }

    fn max_payload(&self) -> usize {
        BULK_MAX_FRAME - self.header_len()
    }

    fn write_header(&self, frame_type: u8, payload_len: usize, out: &mut Vec<u8>) {
        out.extend_from_slice(&BULK_MAGIC.to_le_bytes());
        out.push(frame_type);
        out.push(0);
        out.extend_from_slice(&(payload_len as u16).to_le_bytes());
    }

    fn split_header<'a>(&self, bytes: &'a [u8]) -> Result<(u8, &'a [u8]), FrameDecodeError> {
        if bytes.len() < self.header_len() {
            return Err(FrameDecodeError::Truncated);
        }
        if read_u32(&bytes[..4]) != BULK_MAGIC {
            return Err(FrameDecodeError::BadMagic);
        }
        let len = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        let end = self.header_len() + len;
        if bytes.len() < end {
            return Err(FrameDecodeError::Truncated);
        }
        // Bytes past `length` are bulk padding.
        Ok((bytes[4], &bytes[self.header_len()..end]))
    }

    fn supports(&self, frame_type: FrameType) -> bool {
        !matches!(
            frame_type,
            FrameType::IconEnd | FrameType::DiscoveryRequest | FrameType::DiscoveryResponse
        )
    }

    fn icon_chunk_size(&self) -> usize {
        BULK_ICON_CHUNK_SIZE
    }

    fn icon_max_chunks(&self) -> u32 {
        u8::MAX as u32
    }

    fn icon_max_size(&self) -> u32 {
        u16::MAX as u32
    }

    fn icon_verification(&self) -> Verification {
        Verification::ByteCount
    }

    fn heartbeat_reports_battery(&self) -> bool {
        true
    }

    fn encode_payload(&self, msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
        let mut out = Vec::new();
        match msg {
            Message::Heartbeat {
                uptime_seconds,
                strength,
            } => {
                out.extend_from_slice(&uptime_seconds.to_le_bytes());
                out.push(*strength);
                out.extend_from_slice(&[0; 3]);
            }
            Message::GameInfo(info) => {
                put_str(&mut out, &info.id, ID_LEN);
                put_str(&mut out, &info.title, BULK_TITLE_LEN);
                out.push(info.state as u8);
                out.push(info.has_icon as u8);
                out.extend_from_slice(&info.start_time.to_le_bytes());
                out.push(info.persistent as u8);
                put_str(&mut out, &info.peer_name, NAME_LEN);
                out.extend_from_slice(&[0; 7]);
            }
            Message::IconChunk(chunk) => {
                put_str(&mut out, &chunk.id, ID_LEN);
                out.extend_from_slice(&(chunk.total_size as u16).to_le_bytes());
                out.extend_from_slice(&(chunk.offset as u16).to_le_bytes());
                out.extend_from_slice(&(chunk.data.len() as u16).to_le_bytes());
                out.push(chunk.chunk_index as u8);
                out.push(chunk.total_chunks as u8);
                out.extend_from_slice(&chunk.data);
            }
            Message::StatsRequest { local_timestamp } => {
                out.extend_from_slice(&local_timestamp.to_le_bytes());
            }
            Message::StatsUpload(chunk) => {
                out.extend_from_slice(&chunk.timestamp.to_le_bytes());
                put_stats_body(&mut out, chunk);
            }
            Message::StatsResponse(chunk) => {
                out.extend_from_slice(&chunk.timestamp.to_le_bytes());
                let total = chunk.total_bytes.unwrap_or(chunk.data.len() as u32);
                out.extend_from_slice(&total.to_le_bytes());
                put_stats_body(&mut out, chunk);
            }
            Message::Ack => {}
            Message::IconRequest { id } => {
                put_str(&mut out, id, ID_LEN);
                out.extend_from_slice(&[0; 6]);
            }
            other => {
                return Err(FrameEncodeError::Unsupported(other.frame_type(), self.name()))
            }
        }
        Ok(out)
    }

    fn decode_payload(
        &self,
        frame_type: FrameType,
        payload: &[u8],
    ) -> Result<Message, FrameDecodeError> {
        let mut r = Reader::new(payload);
        let msg = match frame_type {
            FrameType::Heartbeat => Message::Heartbeat {
                uptime_seconds: r.u32()?,
                strength: r.u8()?,
            },
            FrameType::GameInfo => {
                let id = r.str(ID_LEN)?;
                let title = r.str(BULK_TITLE_LEN)?;
                let state = GameState::try_from(r.u8()?).unwrap_or_default();
                let has_icon = r.u8()? != 0;
                let start_time = r.u32()?;
                let persistent = r.u8()? != 0;
                let peer_name = r.str(NAME_LEN)?;
                Message::GameInfo(GameInfo {
                    id,
                    title,
                    state,
                    start_time,
                    has_icon,
                    persistent,
                    peer_name,
                })
            }
            FrameType::IconChunk => {
                let id = r.str(ID_LEN)?;
                let total_size = r.u16()? as u32;
                let offset = r.u16()? as u32;
                let len = r.u16()? as usize;
                let chunk_index = r.u8()? as u16;
                let total_chunks = r.u8()? as u16;
                Message::IconChunk(IconChunk {
                    id,
                    total_size,
                    offset,
                    chunk_index,
                    total_chunks,
                    data: r.bytes(len)?.to_vec(),
                })
            }
            FrameType::StatsRequest => Message::StatsRequest {
                local_timestamp: r.u64()?,
            },
            FrameType::StatsUpload => {
                let timestamp = r.u64()?;
                Message::StatsUpload(read_stats_body(&mut r, timestamp, None)?)
            }
            FrameType::StatsResponse => {
                let timestamp = r.u64()?;
                let total = r.u32()?;
                Message::StatsResponse(read_stats_body(&mut r, timestamp, Some(total))?)
            }
            FrameType::Ack => Message::Ack,
            FrameType::IconRequest => Message::IconRequest { id: r.str(ID_LEN)? },
            other => return Err(FrameDecodeError::UnknownType(other as u8)),
        };
        Ok(msg)
    }
}

fn put_stats_body(out: &mut Vec<u8>, chunk: &StatsChunk) {
    out.extend_from_slice(&chunk.chunk_index.to_le_bytes());
    out.extend_from_slice(&chunk.total_chunks.to_le_bytes());
    out.extend_from_slice(&(chunk.data.len() as u16).to_le_bytes());
    out.extend_from_slice(&chunk.data);
}

fn read_stats_body(
    r: &mut Reader<'_>,
    timestamp: u64,
    total_bytes: Option<u32>,
) -> Result<StatsChunk, FrameDecodeError> {
    let chunk_index = r.u16()?;
    let total_chunks = r.u16()?;
    let len = r.u16()? as usize;
    if len > STATS_CHUNK_SIZE {
        return Err(FrameDecodeError::Truncated);
    }
    Ok(StatsChunk {
        timestamp,
        total_bytes,
        chunk_index,
        total_chunks,
        data: r.bytes(len)?.to_vec(),
    })
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Write `s` into a fixed NUL-padded field, always leaving room for the terminator.
fn put_str(out: &mut Vec<u8>, s: &str, width: usize) {
    let mut len = s.len().min(width - 1);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    out.extend_from_slice(&s.as_bytes()[..len]);
    out.resize(out.len() + (width - len), 0);
}

/// Bounds-checked little-endian cursor over a payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], FrameDecodeError> {
        let end = self.pos.checked_add(n).ok_or(FrameDecodeError::Truncated)?;
        let out = self
            .buf
            .get(self.pos..end)
            .ok_or(FrameDecodeError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FrameDecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameDecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameDecodeError> {
        Ok(read_u32(self.bytes(4)?))
    }

    fn u64(&mut self) -> Result<u64, FrameDecodeError> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn str(&mut self, width: usize) -> Result<String, FrameDecodeError> {
        let field = self.bytes(width)?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        Ok(String::from_utf8_lossy(&field[..end]).into_owned())
    }
}
