//! Engine configuration. Deserialized from the host's config file; every field has a default.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{DEFAULT_PORT, DISCOVERY_PORT};

const MIN_POLL_MS: u64 = 500;
const MIN_HEARTBEAT_MS: u64 = 1_000;
const MAX_HEARTBEAT_MS: u64 = 300_000;
const MIN_RESEND_MS: u64 = 1_000;
const MAX_RESEND_MS: u64 = 3_600_000;

/// Per-session engine settings. Out-of-range values are clamped by the accessors, not
/// rejected, so a hand-edited file never stops the engine from starting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed peer address. When unset (or with `auto_discovery`), the peer is discovered.
    #[serde(default)]
    pub peer_address: Option<IpAddr>,
    /// Peer's data port. The local socket binds an ephemeral port instead.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port discovery broadcasts go to and are listened for on.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_true")]
    pub auto_discovery: bool,
    #[serde(default = "default_true")]
    pub send_icons: bool,
    #[serde(default = "default_peer_name")]
    pub peer_name: String,
    /// Game detection cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Unconditional game-info resend cadence; 0 disables.
    #[serde(default)]
    pub game_update_interval_ms: u64,
    /// 0 disables.
    #[serde(default)]
    pub connect_timeout_s: u64,
    #[serde(default)]
    pub send_once: bool,
    /// Stop the session entirely when the initial connect times out.
    #[serde(default)]
    pub shutdown_on_timeout: bool,
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
    #[serde(default = "default_stats_sync_interval_s")]
    pub stats_sync_interval_s: u64,
    /// Delay between chunk frames.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    #[serde(default = "default_loop_sleep_ms")]
    pub loop_sleep_ms: u64,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}
fn default_true() -> bool {
    true
}
fn default_peer_name() -> String {
    "handheld".to_string()
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_connect_retry_ms() -> u64 {
    5_000
}
fn default_stats_sync_interval_s() -> u64 {
    300
}
fn default_chunk_delay_ms() -> u64 {
    10
}
fn default_loop_sleep_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_address: None,
            port: default_port(),
            discovery_port: default_discovery_port(),
            auto_discovery: true,
            send_icons: true,
            peer_name: default_peer_name(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            game_update_interval_ms: 0,
            connect_timeout_s: 0,
            send_once: false,
            shutdown_on_timeout: false,
            connect_retry_ms: default_connect_retry_ms(),
            stats_sync_interval_s: default_stats_sync_interval_s(),
            chunk_delay_ms: default_chunk_delay_ms(),
            loop_sleep_ms: default_loop_sleep_ms(),
            enable_logging: true,
        }
    }
}

impl EngineConfig {
    /// Discovery is used when asked for or when no fixed address is known.
    pub fn uses_discovery(&self) -> bool {
        self.auto_discovery || self.peer_address.is_none()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_MS))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval_ms
                .clamp(MIN_HEARTBEAT_MS, MAX_HEARTBEAT_MS),
        )
    }

    pub fn game_update_interval(&self) -> Option<Duration> {
        match self.game_update_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms.clamp(MIN_RESEND_MS, MAX_RESEND_MS))),
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_s {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms.max(1))
    }

    pub fn stats_sync_interval(&self) -> Duration {
        Duration::from_secs(self.stats_sync_interval_s.max(1))
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn loop_sleep(&self) -> Duration {
        Duration::from_millis(self.loop_sleep_ms)
    }
}
