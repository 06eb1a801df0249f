use anyhow::{Context, Result};
use patchbay::applet::AppletStore;
use patchbay::config::{self, EngineConfig};
use patchbay::credential::CredentialStore;
use patchbay::engine::Registry;
use patchbay::provider::Catalog;
use patchbay::providers;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "patchbay=info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "patchbay.toml".to_string());
    let config = if Path::new(&config_path).exists() {
        config::load_config(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", config_path, e))?
    } else {
        info!(path = %config_path, "No config file, using defaults");
        EngineConfig::default()
    };

    let encryption_key = std::env::var("PATCHBAY_ENCRYPTION_KEY")
        .context("PATCHBAY_ENCRYPTION_KEY is not set (base64-encoded 32-byte key)")?;

    let applets = Arc::new(AppletStore::new(&config.storage.applets_db)?);
    let credentials = Arc::new(CredentialStore::new(
        &config.storage.credentials_db,
        &encryption_key,
    )?);

    let catalog = Arc::new(Catalog::new(providers::builtin()));
    info!(providers = ?catalog.names(), "Provider catalog loaded");

    let log_dir = (!config.logs.disabled).then(|| PathBuf::from(&config.logs.directory));
    let registry = Arc::new(Registry::new(catalog, applets, credentials, log_dir));

    let resumed = registry.resume_persisted().await?;
    info!(resumed, "Patchbay running, press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    registry.shutdown().await;

    Ok(())
}
