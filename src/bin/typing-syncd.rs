//! `typing-syncd`: runs the sync engine against Redis and SQLite.
//!
//! Configuration comes from `TYPING_SYNC_*` environment variables (see
//! [`SyncConfig::from_env`]); log filtering from `RUST_LOG`.

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use typing_sync_engine::{RedisPrimaryStore, SqliteSecondaryStore, SyncConfig, SyncEngine};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "typing_sync_engine=info,typing_syncd=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let primary = Arc::new(RedisPrimaryStore::new(config.primary.clone()));
    let secondary = Arc::new(SqliteSecondaryStore::new(
        config.secondary.sqlite_path.clone(),
        config.secondary.wal_mode,
    ));

    let mut engine = SyncEngine::new(config, primary, secondary);
    if let Err(e) = engine.start().await {
        error!(error = %e, "Failed to start sync engine");
        return ExitCode::FAILURE;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    engine.shutdown().await;
    ExitCode::SUCCESS
}
