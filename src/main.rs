// src/main.rs

use anyhow::{Context, Result};
use asset_orchestrator::prelude::*;
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,asset_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("ASSETS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("assets.toml"));
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    let client = Arc::new(FsBundleClient::new(&config.store));
    let manager = Arc::new(OrchestrationManager::with_catalog(client, config.bundles.clone()));

    // Keep one logging observer per bundle alive for the whole run.
    let _observers: Vec<ObserverHandle> = config
        .bundles
        .iter()
        .map(|spec| {
            let id = spec.id.clone();
            manager.subscribe(spec.id.clone(), move |state| {
                info!("[{}] {}", id, state);
            })
        })
        .collect();

    let mut runs = Vec::new();
    for spec in &config.bundles {
        let stream = match spec.policy {
            DownloadPolicy::Essential | DownloadPolicy::Prefetch => {
                manager.check_availability(spec.id.clone()).await
            }
            DownloadPolicy::OnDemand => manager.download_with_progress(spec.id.clone()).await,
        };
        runs.push(stream.settle());
    }
    join_all(runs).await;

    for snapshot in manager.snapshots().await {
        println!("{}", serde_json::to_string(&snapshot)?);
    }

    for spec in config
        .bundles
        .iter()
        .filter(|spec| spec.policy == DownloadPolicy::OnDemand)
    {
        let state = manager.remove_bundle(spec.id.clone()).await;
        info!("[{}] after removal: {}", spec.id, state);
    }

    manager.shutdown().await;
    Ok(())
}
