//! # concord-federation
//!
//! why: run one federation node as a long-lived process
//! relations: binary entry point over the concord-federation library
//! what: config loading (CONCORD_CONFIG, CONCORD_NODE_ID), one narrative sync, run until Ctrl-C

use anyhow::Context;
use concord_federation::{
    telemetry, ConsensusManager, FederationConfig, FederationService, LocalNetwork, SyncOutcome,
};
use tracing::{info, warn};
use uuid::Uuid;

fn load_config() -> anyhow::Result<FederationConfig> {
    let mut config = match std::env::var_os("CONCORD_CONFIG") {
        Some(path) => FederationConfig::load(&path)
            .with_context(|| format!("loading {}", path.to_string_lossy()))?,
        None => FederationConfig::default(),
    };
    if let Ok(node_id) = std::env::var("CONCORD_NODE_ID") {
        config.node_id = node_id;
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info");

    let config = load_config()?;
    info!(node_id = %config.node_id, members = ?config.cluster_members(), "starting federation node");

    let network = LocalNetwork::new();
    let manager = ConsensusManager::start(config, &network).context("starting node")?;
    let service = FederationService::new(manager.clone());

    match service.sync_narrative(&Uuid::new_v4().to_string()).await? {
        SyncOutcome::Committed => info!("demo narrative committed"),
        SyncOutcome::Rejected => warn!("demo narrative rejected"),
        SyncOutcome::Locked => warn!("demo narrative was locked"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("received Ctrl-C, shutting down");
    manager.shutdown().await?;
    Ok(())
}
