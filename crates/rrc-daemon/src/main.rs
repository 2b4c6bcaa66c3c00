//! rrc-daemon: the gateway process tying identity, hub connection, room
//! rate limiting, and hub discovery into one coordinator.
//!
//! Unlike the teacher daemon this is adapted from, this process does not
//! bind a JSON-RPC-over-socket (or any other) server: the UI-facing command
//! and event surface is realized here purely as typed in-process channels
//! (see [`backend::Backend`] and [`events::EventBus`]); wire-level framing
//! for an outer UI is the job of a surface outside this crate's scope.
//!
//! `RRC_DAEMON_CONFIG` and `RRC_DATA_DIR` override the config file and data
//! directory locations, mirroring the teacher daemon's env-var override
//! convention rather than adding a CLI-argument-parsing dependency for a
//! single-process gateway with no subcommands.

mod backend;
mod config;
mod events;
mod identity;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use rrc_mesh::fake::FakeTransport;

use crate::backend::{Backend, ConnectParams};
use crate::config::DaemonConfig;
use crate::events::EventBus;

const ANNOUNCE_ASPECT: &str = "rrc.hub";
const STALE_HUB_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("rrc=info".parse()?),
        )
        .init();

    info!("rrc-daemon starting");

    let config = DaemonConfig::load();
    std::fs::create_dir_all(config::data_dir())?;

    if config.hub_hash_bytes().is_none() {
        anyhow::bail!("no hub configured (set `hub.hash` in {:?})", config::config_path());
    }

    // The concrete mesh transport is supplied by the deployment; this
    // workspace carries no production Reticulum binding, so the entrypoint
    // wires the in-repo deterministic transport as a stand-in. Swapping in
    // a real `MeshTransport` implementation here is the only change needed
    // to run against an actual mesh.
    let transport = Arc::new(FakeTransport::new());

    let event_bus = EventBus::new(1000);
    let catalog = rrc_discovery::HubCatalog::load(&config.hub_cache_path());

    let (announce_tx, announce_rx) = mpsc::channel(64);
    transport.register_announce_handler(ANNOUNCE_ASPECT, announce_tx);

    let backend = Backend::new(Arc::clone(&transport), config.clone(), event_bus, catalog);
    backend.spawn_announce_bridge(announce_rx, ANNOUNCE_ASPECT);
    backend.spawn_stale_hub_cleanup(STALE_HUB_CLEANUP_INTERVAL);

    backend.event_bus().emit(
        "system",
        serde_json::json!({"text": "rrc-daemon starting", "version": env!("CARGO_PKG_VERSION")}),
    );

    match backend.connect(ConnectParams::default()).await {
        Ok(connected) => info!(identity_hash = %connected.identity_hash, "connected to hub"),
        Err(err) => {
            error!(error = %err, "initial connect failed, continuing with daemon running");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");

    backend.disconnect().await;
    info!("rrc-daemon stopped");
    Ok(())
}
