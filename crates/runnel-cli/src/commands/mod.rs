//! CLI command implementations.

pub mod builds;
pub mod schedule;

use anyhow::{Context as _, Result};
use runnel_core::SystemClock;
use runnel_config::SystemConfig;
use runnel_db::{BuildStore, FileStore, PgStore};
use runnel_executor::{GitProvider, LocalProcessRunner, PostgresProvisioner};
use runnel_hosting::HostingRegistry;
use runnel_scheduler::{Context, Services};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Where builds are persisted.
pub struct StoreLocation {
    pub database_url: Option<String>,
    pub state: Option<PathBuf>,
}

async fn open_store(
    config: &SystemConfig,
    location: &StoreLocation,
) -> Result<Arc<dyn BuildStore>> {
    if let Some(url) = &location.database_url {
        let pool = runnel_db::create_pool(url)
            .await
            .context("connecting to the build database")?;
        runnel_db::run_migrations(&pool)
            .await
            .context("migrating the build database")?;
        info!("Using PostgreSQL build store");
        return Ok(Arc::new(PgStore::new(pool)));
    }

    let state = location
        .state
        .clone()
        .unwrap_or_else(|| config.settings.root.join("state.json"));
    let store = FileStore::open(&state)
        .with_context(|| format!("opening build store {}", state.display()))?;
    info!(path = %state.display(), "Using file build store");
    Ok(Arc::new(store))
}

/// Load the configuration and wire the production collaborators.
pub async fn open(config_path: &Path, location: &StoreLocation) -> Result<Context> {
    let config = runnel_config::load_system_config(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let host = match &config.settings.host {
        Some(host) => host.clone(),
        None => nix::unistd::gethostname()
            .context("resolving hostname")?
            .to_string_lossy()
            .into_owned(),
    };
    let store = open_store(&config, location).await?;
    let hosting = HostingRegistry::new(&config.repositories);
    info!(
        host = %host,
        repositories = config.repositories.len(),
        hosting_clients = hosting.len(),
        "Loaded configuration"
    );

    let services = Services {
        store,
        runner: Arc::new(LocalProcessRunner::new()),
        provisioner: Arc::new(PostgresProvisioner::new()),
        sources: Arc::new(GitProvider::new(config.settings.root.clone())),
        hosting: Arc::new(hosting),
        clock: Arc::new(SystemClock),
    };
    Ok(Context::new(config, host, services))
}

pub fn validate(path: &Path) -> Result<()> {
    match runnel_config::load_system_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  stages: {}", config.pipeline.stages.len());
            println!("  repositories: {}", config.repositories.len());
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
