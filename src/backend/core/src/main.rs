//! Keel dispatcher process.
//!
//! Runs the configured dispatchers against PostgreSQL until SIGINT or
//! SIGTERM. Workers and recurring tasks need application job classes and are
//! started by embedding [`keel_core::runtime::Launcher`].

use anyhow::Context;
use std::sync::Arc;

use keel_core::{
    config::Config,
    db::{PgStore, SharedStore},
    runtime::{signals, Launcher},
    telemetry::{init_logging, register_metrics},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = match std::env::var("KEEL_CONFIG") {
        Ok(path) => Config::from_file(&path),
        Err(_) => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_logging(&config.logging)?;
    register_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting keel");

    let shutdown = signals::install()?;

    let store = PgStore::connect(&config.database).await?;
    store.migrate().await?;
    tracing::info!("Connected to database, migrations applied");

    let store: SharedStore = Arc::new(store);
    Launcher::new(config, store).run(shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
