// peerbusd: standalone bus node. Claims and advertises the configured names and logs
// discovery activity until Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use peerbus_core::{NameFlags, RequestNameReply, TransportMask, UniqueName};
use peerbus_node::{config, BusAttachment, BusListener, Config};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "peerbusd", version, about = "peerbus node daemon")]
struct Args {
    /// Config file (default: ~/.config/peerbus/config.toml, then /etc/peerbus/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address, e.g. tcp:addr=0.0.0.0,port=9955. Repeatable; replaces the config list.
    #[arg(long)]
    listen: Vec<String>,
    #[arg(long)]
    no_discovery: bool,
    /// Well-known name to claim and advertise. Repeatable; added to the config list.
    #[arg(long)]
    advertise: Vec<String>,
}

struct LogListener;

impl BusListener for LogListener {
    fn found_advertised_name(&self, name: &str, transport: TransportMask, prefix: &str) {
        tracing::info!(name, %transport, prefix, "found advertised name");
    }

    fn lost_advertised_name(&self, name: &str, transport: TransportMask, prefix: &str) {
        tracing::info!(name, %transport, prefix, "lost advertised name");
    }

    fn name_owner_changed(&self, name: &str, previous: Option<&UniqueName>, new: Option<&UniqueName>) {
        tracing::info!(name, ?previous, ?new, "name owner changed");
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cfg = config::load(args.config.as_deref()).context("loading config")?;
    if !args.listen.is_empty() {
        cfg.listen = args.listen;
    }
    if args.no_discovery {
        cfg.discovery_enabled = false;
    }
    cfg.advertise.extend(args.advertise);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let names = cfg.advertise.clone();
    let bus = BusAttachment::builder(cfg).start().await.context("starting bus")?;
    bus.register_bus_listener(Arc::new(LogListener))?;
    // empty prefix matches every advertised name
    bus.find_advertised_name("", TransportMask::ANY).await?;

    for name in &names {
        match bus.request_name(name, NameFlags::NONE).await? {
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {
                bus.advertise_name(name, TransportMask::ANY).await?;
                tracing::info!(name = %name, "advertising");
            }
            other => tracing::warn!(name = %name, reply = ?other, "name not granted"),
        }
    }

    shutdown_signal().await?;
    tracing::info!("shutting down");
    bus.stop().await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
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
