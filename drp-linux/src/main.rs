// drp-linux: publishes what this handheld is running to the desktop companion over UDP
// and/or a USB bulk bridge, and keeps the usage record in sync.

mod bulk;
mod config;
mod game;
mod net;
mod storage;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use drp_core::wire::{BulkProfile, NetProfile};
use drp_core::{EngineContext, EngineEvent, PeerTarget, StopReason};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ConfigPeerStore, TransportKind};

#[derive(Parser, Debug)]
#[command(name = "drp-linux", version, about = "Rich presence link for the desktop companion")]
struct Args {
    /// Config file (default: ~/.config/drp/config.toml, then /etc/drp/config.toml)
    #[arg(short, long, env = "DRP_CONFIG")]
    config: Option<PathBuf>,

    /// Sessions to run
    #[arg(short, long, value_enum)]
    transport: Option<TransportKind>,

    /// Desktop address; disables discovery
    #[arg(long)]
    peer: Option<IpAddr>,

    /// USB bridge address for the bulk session
    #[arg(long)]
    bridge: Option<String>,

    /// JSON status file written by the launcher
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Directory of <id>.png icons
    #[arg(long)]
    icon_dir: Option<PathBuf>,

    /// Local usage record: play time is tracked here and synced over the bulk session
    #[arg(long)]
    usage_file: Option<PathBuf>,

    /// Exit after the first game info is delivered
    #[arg(long)]
    send_once: bool,
}

impl Args {
    fn apply(self, cfg: &mut Config) {
        if let Some(t) = self.transport {
            cfg.transport = t;
        }
        if let Some(ip) = self.peer {
            cfg.link.peer_address = Some(ip);
            cfg.link.auto_discovery = false;
        }
        if let Some(b) = self.bridge {
            cfg.bulk_bridge = b;
        }
        if let Some(p) = self.status_file {
            cfg.status_file = p;
        }
        if self.icon_dir.is_some() {
            cfg.icon_dir = self.icon_dir;
        }
        if self.usage_file.is_some() {
            cfg.usage_file = self.usage_file;
        }
        if self.send_once {
            cfg.link.send_once = true;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (mut cfg, cfg_path) = config::load(args.config.clone());
    args.apply(&mut cfg);

    let default_level = if cfg.link.enable_logging { "drp=info" } else { "drp=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = drp_core::PROTOCOL_VERSION,
        transport = ?cfg.transport,
        config = %cfg_path.display(),
        "starting"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut sessions = JoinSet::new();
        if cfg.transport.has_net() {
            let (cfg, path, flag) = (cfg.clone(), cfg_path.clone(), shutdown.clone());
            sessions.spawn_blocking(move || ("net", run_net(cfg, path, &flag)));
        }
        if cfg.transport.has_bulk() {
            let (cfg, flag) = (cfg.clone(), shutdown.clone());
            sessions.spawn_blocking(move || ("bulk", run_bulk(cfg, &flag)));
        }

        tokio::select! {
            r = shutdown_signal() => {
                r?;
                tracing::info!("shutdown requested");
            }
            _ = drain(&mut sessions) => {}
        }
        shutdown.store(true, Ordering::Relaxed);
        drain(&mut sessions).await;
        anyhow::Ok(())
    })?;
    Ok(())
}

async fn drain(sessions: &mut JoinSet<(&'static str, StopReason)>) {
    while let Some(done) = sessions.join_next().await {
        match done {
            Ok((name, reason)) => tracing::info!(session = name, ?reason, "session ended"),
            Err(e) => tracing::error!(error = %e, "session task failed"),
        }
    }
}

fn games(cfg: &Config) -> Box<game::StatusFileSource> {
    Box::new(game::StatusFileSource::new(
        cfg.status_file.clone(),
        cfg.icon_dir.clone(),
    ))
}

fn run_net(cfg: Config, cfg_path: PathBuf, shutdown: &AtomicBool) -> StopReason {
    let _span = tracing::info_span!("net").entered();
    let target = PeerTarget::from_config(&cfg.link);
    let transport = net::UdpTransport::new(cfg.link.discovery_port);
    let mut engine =
        EngineContext::new(NetProfile, transport, cfg.link.clone(), target, games(&cfg))
            .with_peer_store(Box::new(ConfigPeerStore::new(cfg_path)));
    if !cfg.transport.has_bulk() {
        if let Some(path) = cfg.usage_file.clone() {
            engine = engine.with_stats_store(Box::new(storage::FileStatsStore::new(path)));
        }
    }
    engine.run(shutdown, log_event)
}

fn run_bulk(cfg: Config, shutdown: &AtomicBool) -> StopReason {
    let _span = tracing::info_span!("bulk").entered();
    let transport = bulk::StreamTransport::new(cfg.bulk_bridge.clone());
    let mut engine = EngineContext::new(
        BulkProfile,
        transport,
        cfg.link.clone(),
        PeerTarget::Link,
        games(&cfg),
    );
    if let Some(path) = cfg.usage_file.clone() {
        engine = engine.with_stats_store(Box::new(storage::FileStatsStore::new(path)));
    }
    engine.run(shutdown, log_event)
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Connected(peer) => tracing::info!(%peer, "connected"),
        EngineEvent::Disconnected => tracing::info!("disconnected"),
        EngineEvent::ConnectTimedOut => tracing::warn!("connect timed out"),
        EngineEvent::GameSent(info) => {
            tracing::info!(
                id = %info.id,
                title = %info.title,
                state = ?info.state,
                "game info sent"
            )
        }
        EngineEvent::IconSent { id, bytes } => tracing::info!(%id, bytes, "icon sent"),
        EngineEvent::IconFailed { id } => tracing::warn!(%id, "icon transfer failed"),
        EngineEvent::StatsSynced {
            remote_timestamp,
            bytes,
        } => tracing::info!(remote_timestamp, bytes, "usage record synced"),
        EngineEvent::StatsFailed => tracing::warn!("usage sync incomplete"),
        EngineEvent::StatsUploaded { bytes } => tracing::info!(bytes, "usage record uploaded"),
        EngineEvent::PeerPersisted(addr) => tracing::info!(peer = %addr, "peer remembered"),
        EngineEvent::Stopped(reason) => tracing::info!(?reason, "stopped"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "drp-linux",
            "--transport",
            "both",
            "--peer",
            "192.168.0.7",
            "--usage-file",
            "/tmp/usage.json",
            "--send-once",
        ]);
        let mut cfg = Config::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.transport, TransportKind::Both);
        assert_eq!(cfg.link.peer_address, Some("192.168.0.7".parse().unwrap()));
        assert!(!cfg.link.auto_discovery);
        assert!(cfg.link.send_once);
        assert_eq!(cfg.usage_file, Some(PathBuf::from("/tmp/usage.json")));
    }
}
