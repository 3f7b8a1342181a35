// Meshlink Linux daemon: LAN discovery, link transport and the handshake pool.

mod bootstrap;
mod config;
mod discovery;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use mesh_core::memory::{MemoryNetwork, RecordingBootstrap};
use mesh_core::{DiscoveryMode, SessionPool};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SIMULATED_PEERS: usize = 2;

fn main() -> anyhow::Result<()> {
    let mut cfg_mode = None;
    let mut simulate = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("meshlink {}", VERSION);
                return Ok(());
            }
            "--once" => cfg_mode = Some(config::Mode::Once),
            "--simulate" => simulate = true,
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = config::load()?;
    if let Some(mode) = cfg_mode {
        cfg.mode = mode;
    }
    cfg.simulate |= simulate;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let pool = if cfg.simulate {
        simulated_pool(&cfg)?
    } else {
        lan_pool(&cfg).await?
    };
    info!(identity = %pool.identity().current(), mode = ?cfg.mode, "meshlink up");

    let mut results = Box::pin(pool.results());
    tokio::spawn(async move {
        while let Some(event) = results.next().await {
            match event {
                Ok(result) if result.is_success() => info!(?result, "handshake done"),
                Ok(result) => warn!(?result, "handshake failed"),
                Err(e) => error!(error = %e, "pool error"),
            }
        }
    });

    let discovery = pool.discover(DiscoveryMode::from(cfg.mode));
    tokio::select! {
        r = shutdown_signal() => r?,
        _ = discovery => info!("discovery finished"),
    }
    pool.shutdown();
    info!(in_flight = pool.in_flight(), "shutting down");
    Ok(())
}

async fn lan_pool(cfg: &config::Config) -> anyhow::Result<SessionPool> {
    let node = uuid::Uuid::new_v4();
    let peers = discovery::PeerTable::new();
    let listener = TcpListener::bind(("0.0.0.0", cfg.transport_port))
        .await
        .with_context(|| format!("binding link port {}", cfg.transport_port))?;
    let radio = transport::LanRadio::new(node, peers.clone());

    let accept = Arc::clone(&radio);
    tokio::spawn(async move {
        if let Err(e) = accept.accept_links(listener).await {
            error!(error = %e, "link listener failed");
        }
    });
    let (disc_port, transport_port) = (cfg.discovery_port, cfg.transport_port);
    tokio::spawn(async move {
        if let Err(e) = discovery::run_discovery(node, peers, disc_port, transport_port).await {
            error!(error = %e, "discovery failed");
        }
    });

    let target = bootstrap::LoggingBootstrap::new(cfg.mesh.capabilities.clone());
    let pool = SessionPool::builder(radio, Arc::new(target))
        .config(cfg.mesh.clone())
        .build()?;
    info!(%node, "lan radio up");
    Ok(pool)
}

/// A local pool plus a few in-process peers on a memory network.
fn simulated_pool(cfg: &config::Config) -> anyhow::Result<SessionPool> {
    let net = MemoryNetwork::new();
    for i in 0..SIMULATED_PEERS {
        let caps = cfg.mesh.capabilities.clone();
        let peer = SessionPool::builder(
            Arc::new(net.radio(&format!("sim-{i}"))),
            Arc::new(RecordingBootstrap::new(caps)),
        )
        .config(cfg.mesh.clone())
        .build()?;
        peer.discover(DiscoveryMode::from(cfg.mode));
    }
    let target = bootstrap::LoggingBootstrap::new(cfg.mesh.capabilities.clone());
    let pool = SessionPool::builder(Arc::new(net.radio("local")), Arc::new(target))
        .config(cfg.mesh.clone())
        .build()?;
    Ok(pool)
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
