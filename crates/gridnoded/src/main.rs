//! gridnoded — the gridnode daemon.
//!
//! Assembles one session node from a config file:
//! - Relay slots, `max_sessions` per configured stereotype
//! - A health monitor per relay service
//! - Background sweeps and heartbeats
//!
//! Ctrl-C drains the node and waits for the last session to finish; a
//! second Ctrl-C exits immediately.
//!
//! # Usage
//!
//! ```text
//! gridnoded run --config /etc/gridnode/gridnode.toml
//! gridnoded check --config /etc/gridnode/gridnode.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridnode_core::{LocalEventBus, NodeConfig, NodeEvent};
use gridnode_node::{NodeBuilder, NodeOptions};
use gridnode_relay::{RelayHealthMonitor, RelaySessionFactory};

const DEFAULT_LOG_FILTER: &str = "info,gridnode=debug,gridnoded=debug";

#[derive(Parser)]
#[command(name = "gridnoded", about = "gridnode session node daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until interrupted.
    Run {
        /// Path to gridnode.toml.
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Validate a config file and print the slots it declares.
    Check {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Check { config } => check(&config),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: &Path) -> anyhow::Result<NodeConfig> {
    NodeConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    println!("external uri: {}", config.node.external_uri()?);
    for relay in &config.relay {
        for slot in &relay.configs {
            println!("{} x {} via {}", slot.max_sessions, slot.stereotype, relay.url);
        }
    }
    println!("{} slot(s)", config.slot_count());
    Ok(())
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let options = NodeOptions::from_config(&config.node)?;
    info!(config = %path.display(), "gridnode daemon starting");

    let bus = Arc::new(LocalEventBus::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Slots and relay monitors ───────────────────────────────

    let mut builder = NodeBuilder::new(options, bus.clone());
    let mut monitors = Vec::new();
    for relay in &config.relay {
        let service_url = relay.service_url()?;
        let healthy = Arc::new(AtomicBool::new(true));

        for slot in &relay.configs {
            for _ in 0..slot.max_sessions {
                let factory = RelaySessionFactory::new(service_url.clone(), slot.stereotype.clone())
                    .with_health(Arc::clone(&healthy));
                builder = builder.add(slot.stereotype.clone(), Arc::new(factory));
            }
        }

        let monitor = RelayHealthMonitor::new(relay, healthy)?;
        info!(url = %monitor.status_url(), "relay health monitor starting");
        monitors.push(monitor.spawn(shutdown_rx.clone()));
    }

    let node = Arc::new(builder.build());
    if config.slot_count() == 0 {
        warn!("no slots configured, node will reject every session");
    }

    let workers = node.start_background_tasks(shutdown_rx);
    node.heartbeat().await;
    info!(node_id = %node.id(), "node up");

    // ── Drain on Ctrl-C ────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");

    let mut events = bus.subscribe();
    node.drain().await;
    if !node.is_drained() {
        tokio::select! {
            _ = wait_for_drain(&mut events) => {}
            _ = tokio::signal::ctrl_c() => {
                warn!(sessions = node.session_count().await, "second interrupt, exiting without waiting for sessions");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    for handle in workers.into_iter().chain(monitors) {
        let _ = handle.await;
    }

    info!("gridnode daemon stopped");
    Ok(())
}

async fn wait_for_drain(events: &mut broadcast::Receiver<NodeEvent>) {
    loop {
        match events.recv().await {
            Ok(NodeEvent::DrainComplete(_)) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
