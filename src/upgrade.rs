//! Forward migration of stored load configurations.
//!
//! A record of any older schema version is walked step by step up to
//! [`CURRENT_SCHEMA_VERSION`]; each step knows only how to go from `n` to `n + 1`.

use crate::storage::{ConfigStore, LoadConfiguration, StorageError, CURRENT_SCHEMA_VERSION};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("configuration for {prefix} has schema version {found}, newer than supported {supported}")]
    NewerThanSupported {
        prefix: String,
        found: u32,
        supported: u32,
    },

    #[error("configuration for {prefix} has invalid schema version {found}")]
    InvalidVersion { prefix: String, found: u32 },

    #[error("failed to store upgraded configuration: {0}")]
    Storage(#[from] StorageError),
}

type UpgradeStep = fn(&mut LoadConfiguration);

/// Step `i` upgrades version `i + 1` to `i + 2`.
const STEPS: &[UpgradeStep] = &[inline_cluster_to_destinations];

/// Version 1 kept a single destination inline; version 2 holds an ordered list.
fn inline_cluster_to_destinations(config: &mut LoadConfiguration) {
    if let Some(cluster) = config.cluster.take() {
        config.destinations.insert(0, cluster);
    }
}

/// Bring `config` to the running schema version in memory.
///
/// Returns `true` if anything changed.
pub fn upgrade_in_memory(config: &mut LoadConfiguration) -> Result<bool, UpgradeError> {
    let found = config.schema_version;
    if found == CURRENT_SCHEMA_VERSION {
        return Ok(false);
    }
    if found == 0 {
        return Err(UpgradeError::InvalidVersion {
            prefix: config.prefix.clone(),
            found,
        });
    }
    if found > CURRENT_SCHEMA_VERSION {
        return Err(UpgradeError::NewerThanSupported {
            prefix: config.prefix.clone(),
            found,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    for step in &STEPS[(found - 1) as usize..] {
        step(config);
    }
    config.schema_version = CURRENT_SCHEMA_VERSION;
    Ok(true)
}

/// Upgrade a configuration read from the store and persist the new document.
///
/// A matching version passes through untouched.
pub async fn upgrade_config(
    store: &dyn ConfigStore,
    mut config: LoadConfiguration,
) -> Result<LoadConfiguration, UpgradeError> {
    let from = config.schema_version;
    if upgrade_in_memory(&mut config)? {
        store.store_upgrade(&config).await?;
        info!(
            prefix = %config.prefix,
            from = from,
            to = CURRENT_SCHEMA_VERSION,
            "Upgraded load configuration"
        );
    }
    Ok(config)
}
