//! Load config from file and environment; write discovered peers back.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use drp_core::{EngineConfig, PeerStore};
use serde::{Deserialize, Serialize};

/// Which sessions the daemon runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Net,
    Bulk,
    Both,
}

impl TransportKind {
    pub fn has_net(self) -> bool {
        matches!(self, TransportKind::Net | TransportKind::Both)
    }

    pub fn has_bulk(self) -> bool {
        matches!(self, TransportKind::Bulk | TransportKind::Both)
    }
}

/// Daemon configuration. File: ~/.config/drp/config.toml or /etc/drp/config.toml.
/// Env overrides: DRP_TRANSPORT, DRP_PEER_ADDRESS, DRP_PORT, DRP_DISCOVERY_PORT, DRP_BULK_BRIDGE.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// Address of the USB bridge that exposes the bulk endpoints as a byte stream.
    #[serde(default = "default_bulk_bridge")]
    pub bulk_bridge: String,
    /// JSON game-info file written by the launcher hook.
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    /// Directory of `<id>.png` icons.
    #[serde(default)]
    pub icon_dir: Option<PathBuf>,
    /// Local usage record: play sessions are added to it and it is synced over bulk.
    #[serde(default)]
    pub usage_file: Option<PathBuf>,
    #[serde(default)]
    pub link: EngineConfig,
}

fn default_transport() -> TransportKind {
    TransportKind::Net
}
fn default_bulk_bridge() -> String {
    "127.0.0.1:9280".to_string()
}
fn default_status_file() -> PathBuf {
    std::env::temp_dir().join("drp-status.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            bulk_bridge: default_bulk_bridge(),
            status_file: default_status_file(),
            icon_dir: None,
            usage_file: None,
            link: EngineConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// Also returns the path discovered peers are written back to.
pub fn load(explicit: Option<PathBuf>) -> (Config, PathBuf) {
    let candidates = match explicit {
        Some(p) => vec![p],
        None => config_paths(),
    };
    let mut c = Config::default();
    let mut store_path = None;
    for p in &candidates {
        if p.exists() {
            match read_file(p) {
                Ok(file) => c = file,
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "ignoring unreadable config")
                }
            }
            store_path = Some(p.clone());
            break;
        }
    }
    apply_env(&mut c);
    let store_path = store_path
        .or_else(|| candidates.first().cloned())
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    (c, store_path)
}

fn apply_env(c: &mut Config) {
    if let Ok(s) = std::env::var("DRP_TRANSPORT") {
        match s.to_ascii_lowercase().as_str() {
            "net" => c.transport = TransportKind::Net,
            "bulk" => c.transport = TransportKind::Bulk,
            "both" => c.transport = TransportKind::Both,
            _ => {}
        }
    }
    if let Ok(s) = std::env::var("DRP_PEER_ADDRESS") {
        if let Ok(ip) = s.parse::<IpAddr>() {
            c.link.peer_address = Some(ip);
            c.link.auto_discovery = false;
        }
    }
    if let Ok(s) = std::env::var("DRP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.link.port = p;
        }
    }
    if let Ok(s) = std::env::var("DRP_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.link.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("DRP_BULK_BRIDGE") {
        c.bulk_bridge = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/drp/config.toml"));
    }
    out.push(PathBuf::from("/etc/drp/config.toml"));
    out
}

fn read_file(p: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(p)?;
    Ok(toml::from_str(&s)?)
}

/// Writes a discovered peer into the `[link]` table, keeping everything else in the file.
/// Discovery is switched off so the next start connects directly.
#[derive(Debug, Clone)]
pub struct ConfigPeerStore {
    path: PathBuf,
}

impl ConfigPeerStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let mut doc: toml::Table = match std::fs::read_to_string(&self.path) {
            Ok(s) => toml::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(e) => return Err(e.into()),
        };
        let link = doc
            .entry("link")
            .or_insert(toml::Value::Table(toml::Table::new()));
        let Some(link) = link.as_table_mut() else {
            anyhow::bail!("[link] in {} is not a table", self.path.display());
        };
        link.insert(
            "peer_address".into(),
            toml::Value::String(addr.ip().to_string()),
        );
        link.insert("port".into(), toml::Value::Integer(addr.port() as i64));
        link.insert("auto_discovery".into(), toml::Value::Boolean(false));

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, toml::to_string_pretty(&doc)?)?;
        Ok(())
    }
}

impl PeerStore for ConfigPeerStore {
    fn persist_peer(&mut self, addr: SocketAddr) -> std::io::Result<()> {
        self.write(addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        tracing::info!(peer = %addr, path = %self.path.display(), "peer saved to config");
        Ok(())
    }
}
