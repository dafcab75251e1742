//! DRP wire protocol: frame types, constants and typed messages.

use serde::{Deserialize, Serialize};

/// Protocol version string. Exchanged during discovery, compared for logging only.
pub const PROTOCOL_VERSION: &str = "0.2.0";

/// Default data port of the desktop companion.
pub const DEFAULT_PORT: u16 = 9276;
/// Default discovery broadcast port.
pub const DISCOVERY_PORT: u16 = 9277;

/// Fixed field widths (bytes, NUL-padded).
pub const ID_LEN: usize = 10;
pub const TITLE_LEN: usize = 128;
pub const NAME_LEN: usize = 32;
pub const VERSION_LEN: usize = 8;

/// Icon data carried by one network-profile chunk.
pub const NET_ICON_CHUNK_SIZE: usize = 1024;
/// Icon data carried by one bulk-profile chunk.
pub const BULK_ICON_CHUNK_SIZE: usize = 450;
/// Stats JSON data carried by one bulk-profile chunk.
pub const STATS_CHUNK_SIZE: usize = 480;

/// All frame types. Values are shared between profiles; a profile may not support every type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Heartbeat = 0x01,
    GameInfo = 0x02,
    IconChunk = 0x03,
    IconEnd = 0x04,
    StatsRequest = 0x05,
    StatsUpload = 0x06,
    Ack = 0x10,
    IconRequest = 0x11,
    StatsResponse = 0x12,
    DiscoveryRequest = 0x20,
    DiscoveryResponse = 0x21,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Heartbeat),
            0x02 => Ok(Self::GameInfo),
            0x03 => Ok(Self::IconChunk),
            0x04 => Ok(Self::IconEnd),
            0x05 => Ok(Self::StatsRequest),
            0x06 => Ok(Self::StatsUpload),
            0x10 => Ok(Self::Ack),
            0x11 => Ok(Self::IconRequest),
            0x12 => Ok(Self::StatsResponse),
            0x20 => Ok(Self::DiscoveryRequest),
            0x21 => Ok(Self::DiscoveryResponse),
            other => Err(other),
        }
    }
}

/// What the handheld is doing right now.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    #[default]
    Browser = 0,
    Playing = 1,
    Homebrew = 2,
    Video = 3,
    Music = 4,
}

impl TryFrom<u8> for GameState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Browser),
            1 => Ok(Self::Playing),
            2 => Ok(Self::Homebrew),
            3 => Ok(Self::Video),
            4 => Ok(Self::Music),
            other => Err(other),
        }
    }
}

/// Id published while the system shell is in the foreground.
pub const BROWSER_ID: &str = "XMB";
const BROWSER_TITLE: &str = "Browsing XMB";

/// Record published to the peer. Produced by the host's game detector.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GameInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: GameState,
    /// Unix seconds when the title was started.
    #[serde(default)]
    pub start_time: u32,
    #[serde(default)]
    pub has_icon: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub peer_name: String,
}

impl GameInfo {
    /// The system shell placeholder, published before anything was detected.
    pub fn browser() -> Self {
        Self {
            id: BROWSER_ID.to_string(),
            title: BROWSER_TITLE.to_string(),
            state: GameState::Browser,
            ..Self::default()
        }
    }

    /// Two records describe the same activity when id and state match.
    pub fn same_activity(&self, other: &GameInfo) -> bool {
        self.id == other.id && self.state == other.state
    }

    /// Fold the shell's module names (`Xmb*`, `SystemCon*`) into the single browser id.
    pub fn normalized(mut self) -> Self {
        let shell = self.id.starts_with("Xmb")
            || self.id == BROWSER_ID
            || self.id.starts_with("SystemCon");
        if shell {
            self.id = BROWSER_ID.to_string();
            self.title = BROWSER_TITLE.to_string();
            self.state = GameState::Browser;
            self.has_icon = false;
        }
        self
    }
}

/// One fragment of an icon transfer.
///
/// The network profile carries neither `total_size` nor `offset` (both decode as 0 there;
/// the total arrives in [`Message::IconEnd`]). The bulk profile carries no chunk end frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconChunk {
    pub id: String,
    pub total_size: u32,
    pub offset: u32,
    pub chunk_index: u16,
    pub total_chunks: u16,
    pub data: Vec<u8>,
}

/// One fragment of a stats JSON transfer (upload or response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsChunk {
    /// Sender's `last_updated` logical clock.
    pub timestamp: u64,
    /// Whole-blob size. Only responses carry it.
    pub total_bytes: Option<u32>,
    pub chunk_index: u16,
    pub total_chunks: u16,
    pub data: Vec<u8>,
}

/// All protocol messages with decoded payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness: seconds since the engine started and a signal/battery byte.
    Heartbeat { uptime_seconds: u32, strength: u8 },
    GameInfo(GameInfo),
    IconChunk(IconChunk),
    /// Terminal frame of a network icon transfer.
    IconEnd {
        id: String,
        total_size: u32,
        crc32: u32,
    },
    StatsRequest { local_timestamp: u64 },
    StatsUpload(StatsChunk),
    Ack,
    IconRequest { id: String },
    StatsResponse(StatsChunk),
    DiscoveryRequest { listen_port: u16, version: String },
    DiscoveryResponse {
        peer_name: String,
        version: String,
        battery_percent: u8,
    },
}

impl Message {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Message::Heartbeat { .. } => FrameType::Heartbeat,
            Message::GameInfo(_) => FrameType::GameInfo,
            Message::IconChunk(_) => FrameType::IconChunk,
            Message::IconEnd { .. } => FrameType::IconEnd,
            Message::StatsRequest { .. } => FrameType::StatsRequest,
            Message::StatsUpload(_) => FrameType::StatsUpload,
            Message::Ack => FrameType::Ack,
            Message::IconRequest { .. } => FrameType::IconRequest,
            Message::StatsResponse(_) => FrameType::StatsResponse,
            Message::DiscoveryRequest { .. } => FrameType::DiscoveryRequest,
            Message::DiscoveryResponse { .. } => FrameType::DiscoveryResponse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_roundtrip_and_unknown() {
        for t in [
            FrameType::Heartbeat,
            FrameType::GameInfo,
            FrameType::IconEnd,
            FrameType::StatsResponse,
            FrameType::DiscoveryResponse,
        ] {
            assert_eq!(FrameType::try_from(t as u8), Ok(t));
        }
        assert_eq!(FrameType::try_from(0x7f), Err(0x7f));
    }

    #[test]
    fn same_activity_ignores_title() {
        let a = GameInfo {
            id: "ULUS10001".into(),
            title: "One".into(),
            state: GameState::Playing,
            ..GameInfo::default()
        };
        let mut b = a.clone();
        b.title = "Other".into();
        assert!(a.same_activity(&b));
        b.state = GameState::Homebrew;
        assert!(!a.same_activity(&b));
    }

    #[test]
    fn shell_ids_normalize_to_browser() {
        let g = GameInfo {
            id: "SystemControl".into(),
            state: GameState::Playing,
            has_icon: true,
            ..GameInfo::default()
        }
        .normalized();
        assert_eq!(g, GameInfo::browser());

        let game = GameInfo {
            id: "UCUS98632".into(),
            state: GameState::Playing,
            ..GameInfo::default()
        };
        assert_eq!(game.clone().normalized(), game);
    }
}
