mod config;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use clap::{Parser, Subcommand};
use crate::config::{parse_contact, RelayConfig};
use particle_crypto::keys::{parse_secret_key_hex, KeyError};
use particle_crypto::signing::{Ed25519Signer, Signer};
use particle_node::script_storage::spawn_script_storage;
use particle_node::{Node, NodeParams};
use particle_transport::adapter::{InMemoryAdapter, TransportAdapter};
use particle_transport::dispatch::drive_dispatches;
use particle_transport::routing::StaticResolver;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum RelayError {
    #[error("failed to load config: {0}")]
    Config(#[from] ::config::ConfigError),
    #[error("invalid node_key: {0}")]
    NodeKey(#[from] KeyError),
    #[error("invalid contact: {0}")]
    Contact(String),
    #[error("script storage: {0}")]
    Scripts(#[from] particle_node::script_storage::ScriptStorageError),
    #[error("signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the relay (default)
    Run,
    /// Print the peer id derived from the configured node key
    Identity,
}

fn node_secret(config: &RelayConfig) -> Result<[u8; 32], RelayError> {
    match &config.node_key {
        Some(hex_key) => Ok(parse_secret_key_hex(hex_key)?),
        None => {
            warn!("no node_key configured, using an ephemeral identity");
            Ok(rand::random())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    let cli = Cli::parse();
    let config = RelayConfig::new(cli.config)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let signer = Arc::new(Ed25519Signer::from_secret(node_secret(&config)?));
    if cli.command == Some(Commands::Identity) {
        println!("{}", signer.peer_id());
        return Ok(());
    }

    let resolver = Arc::new(StaticResolver::default());
    for entry in &config.contacts {
        resolver.insert(parse_contact(entry).map_err(RelayError::Contact)?);
    }

    let (node, backend, dispatches) =
        Node::new(NodeParams::new(config.node_config(), signer).with_resolver(resolver));
    info!(
        peer_id = %node.peer_id(),
        pool_size = config.pool_size,
        backend = ?config.vm_backend,
        "particle relay starting"
    );
    let backend = backend.start();

    let adapter = Arc::new(Mutex::new(InMemoryAdapter::default()));
    let driver = tokio::spawn(drive_dispatches(adapter.clone(), dispatches));

    let (scripts, storage) = spawn_script_storage(&node);
    for script in &config.scripts {
        let id = scripts.add_script(script.src.clone(), script.interval)?;
        info!(script_id = %id, interval = ?script.interval, "configured script stored");
    }

    let mut stats_tick = tokio::time::interval(config.stats_interval);
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                info!("shutdown requested");
                break;
            }
            _ = stats_tick.tick() => {
                pump_loopback(&node, &adapter);
                let stats = node.stats();
                info!(
                    ingested = stats.ingested,
                    live = stats.live_particles,
                    awaiting_peer = stats.awaiting_peer,
                    completed = stats.completed,
                    expired = stats.expired,
                    faulted = stats.faulted,
                    dispatched = stats.particles_dispatched,
                    delivery_faults = stats.delivery_faults,
                    vms_in_use = node.vms_in_use(),
                    "pipeline stats"
                );
            }
        }
    }

    drop(scripts);
    storage.await.ok();
    drop(node);
    backend.await.ok();
    driver.await.ok();
    info!("particle relay stopped");
    Ok(())
}

/// Feeds loopback inbound traffic to the node and drops captured sends,
/// since the in-memory transport has no remote side.
fn pump_loopback(node: &Node, adapter: &Mutex<InMemoryAdapter>) {
    let mut adapter = adapter.lock().unwrap_or_else(PoisonError::into_inner);
    while let Some((from, bytes)) = adapter.recv() {
        if let Err(err) = node.ingest_bytes(from, &bytes) {
            warn!(peer = %from, "inbound particle refused: {err}");
        }
    }
    for (contact, bytes) in adapter.take_outbound() {
        debug!(peer = %contact.peer_id, len = bytes.len(), "outbound particle captured");
    }
}
