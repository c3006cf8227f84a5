use crate::config::parse::{load_config, ConfigError};
use crate::config::types::{LoaderMode, ServiceConfig};
use crate::context::LoaderContext;
use crate::coordinator::CoordinatorError;
use crate::event::{normalize_configured_prefix, Notification};
use crate::handler::{EventHandler, HandlerError};
use crate::loader::{DryRunExecutor, LoadDispatcher, LoadExecutor, ReferenceDecryptor};
use crate::notify::{self, NotifyError};
use crate::server::start_server;
use crate::storage::duckdb::DuckDbStore;
use crate::storage::StorageError;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::info;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config not found; searched ~/.config/batchload/config.yml and /etc/batchload/config.yml. Use --config <path> or run 'batchload config init'")]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("notifier error: {0}")]
    Notify(#[from] NotifyError),

    #[error("invocation failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("flush failed: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("invalid listen address '{0}'")]
    ListenAddress(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid event JSON: {0}")]
    Event(#[from] serde_json::Error),

    #[error("server error: {0}")]
    Server(std::io::Error),

    #[error("no configuration for prefix {0}")]
    UnknownPrefix(String),
}

/// Load the service config and open the state store.
pub fn load(config_path: Option<PathBuf>) -> Result<(ServiceConfig, Arc<DuckDbStore>), RunError> {
    let config_path = config_path.ok_or(RunError::ConfigNotFound)?;
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(&config_path)?;
    let store = open_store(&config.storage.path)?;
    Ok((config, store))
}

fn open_store(path: &Path) -> Result<Arc<DuckDbStore>, RunError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if path.as_os_str() != ":memory:" {
            std::fs::create_dir_all(parent).map_err(|source| RunError::Read {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }
    let store = DuckDbStore::open(path)?;
    Ok(Arc::new(store))
}

async fn build_handler(
    config: &ServiceConfig,
    store: Arc<DuckDbStore>,
) -> Result<EventHandler, RunError> {
    store.init_schema().await?;

    let executor: Arc<dyn LoadExecutor> = match config.loader.mode {
        LoaderMode::DryRun => Arc::new(DryRunExecutor),
    };
    let dispatcher = LoadDispatcher::new(executor, Arc::new(ReferenceDecryptor));
    let notifier = notify::from_config(&config.notifications)?;

    let ctx = LoaderContext::new(store, dispatcher, notifier, config.retry.clone());
    Ok(EventHandler::new(ctx))
}

/// `batchload run`: serve the intake API until Ctrl+C.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    serve(config_path).await.map_err(|e| e.into())
}

async fn serve(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let (config, store) = load(config_path)?;
    let listen: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|_| RunError::ListenAddress(config.server.listen.clone()))?;
    let handler = build_handler(&config, store).await?;

    info!("Batch loader started, press Ctrl+C to shutdown");
    tokio::select! {
        result = start_server(listen, handler) => result.map_err(RunError::Server)?,
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }
    Ok(())
}

/// `batchload handle <event.json>`: run a single invocation.
pub async fn handle(
    config_path: Option<PathBuf>,
    event_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let (config, store) = load(config_path)?;
    let handler = build_handler(&config, store).await?;

    let body = std::fs::read_to_string(event_path).map_err(|source| RunError::Read {
        path: event_path.display().to_string(),
        source,
    })?;
    let notification: Notification = serde_json::from_str(&body).map_err(RunError::Event)?;
    let disposition = handler.handle(notification).await.map_err(RunError::Handler)?;

    println!("{}", serde_json::to_string_pretty(&disposition)?);
    Ok(())
}

/// `batchload flush <prefix>`: check the prefix's current batch now.
pub async fn flush(
    config_path: Option<PathBuf>,
    prefix: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (config, store) = load(config_path)?;
    let handler = build_handler(&config, store).await?;

    let prefix = normalize_configured_prefix(prefix);
    let outcome = handler
        .coordinator()
        .check_flush(&prefix)
        .await
        .map_err(RunError::Coordinator)?
        .ok_or_else(|| RunError::UnknownPrefix(prefix.clone()))?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

/// `batchload setup <records.yml>`
pub async fn setup(
    config_path: Option<PathBuf>,
    records_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_config, store) = load(config_path)?;
    store.init_schema().await?;

    let prefixes = super::setup::setup(store.as_ref(), records_path).await?;
    for prefix in prefixes {
        println!("Configured {}", prefix);
    }
    Ok(())
}

/// `batchload add-destination <prefix> <destination.yml>`
pub async fn add_destination(
    config_path: Option<PathBuf>,
    prefix: &str,
    destination_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_config, store) = load(config_path)?;
    store.init_schema().await?;

    let destination =
        super::setup::add_destination(store.as_ref(), prefix, destination_path).await?;
    println!("Added {} to {}", destination.label(), prefix);
    Ok(())
}
