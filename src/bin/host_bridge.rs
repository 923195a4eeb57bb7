//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! This binary reads `CommandEnvelope` messages as newline-delimited JSON
//! from stdin, dispatches them to the sync scheduler, and writes
//! `ResponseEnvelope` and `EventEnvelope` messages to stdout.
//!
//! The vault root is `VAULT_SYNC_VAULT`, or the working directory when unset.
//! Settings live in `VAULT_SYNC_SETTINGS` or the platform config directory.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use std::path::PathBuf;
use std::sync::Arc;
use vault_sync::host::stdio::run_stdio_bridge;
use vault_sync::{JsonFileStore, SchedulerConfig};

const VAULT_ENV: &str = "VAULT_SYNC_VAULT";
const SETTINGS_ENV: &str = "VAULT_SYNC_SETTINGS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout is reserved for the JSON protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vault_sync=info")),
        )
        .init();

    let vault = match std::env::var_os(VAULT_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir()?,
    };
    let store = match std::env::var_os(SETTINGS_ENV) {
        Some(path) => JsonFileStore::new(path),
        None => JsonFileStore::default_location(),
    };

    tracing::info!(
        vault = %vault.display(),
        settings = %store.path().display(),
        "vault-sync-host starting"
    );

    run_stdio_bridge(SchedulerConfig::new(vault, Arc::new(store)))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "vault-sync-host exited with error");
            anyhow::anyhow!("vault-sync-host failed: {e}")
        })?;

    tracing::info!("vault-sync-host shut down cleanly");
    Ok(())
}
