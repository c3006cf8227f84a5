use crate::event::normalize_configured_prefix;
use crate::storage::{ConfigStore, Destination, LoadConfiguration, StorageError, CURRENT_SCHEMA_VERSION};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("invalid record for {prefix}:\n{}", .errors.join("\n"))]
    Invalid { prefix: String, errors: Vec<String> },

    #[error("{prefix} already loads into {label}")]
    DuplicateDestination { prefix: String, label: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A load configuration as an operator writes it. The batch pointer and
/// schema version are filled in on import.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRecord {
    pub prefix: String,
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub filename_filter: Option<String>,
    pub batch_max_entries: u32,
    #[serde(default)]
    pub batch_max_age_seconds: Option<u64>,
    pub mount_dir: String,
    #[serde(default)]
    pub copy_options: Option<String>,
    #[serde(default)]
    pub on_success: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
}

impl SetupRecord {
    pub fn into_configuration(self) -> Result<LoadConfiguration, SetupError> {
        let prefix = normalize_configured_prefix(&self.prefix);
        let mut errors = Vec::new();

        if prefix.is_empty() {
            errors.push("prefix must not be empty".to_string());
        }
        if self.destinations.is_empty() {
            errors.push("at least one destination is required".to_string());
        }
        if self.batch_max_entries == 0 {
            errors.push("batchMaxEntries must be at least 1".to_string());
        }
        if self.mount_dir.trim().is_empty() {
            errors.push("mountDir must not be empty".to_string());
        }
        if let Some(filter) = &self.filename_filter {
            if let Err(e) = Regex::new(filter) {
                errors.push(format!("filenameFilter is not a valid regex: {}", e));
            }
        }
        // Per-destination results are keyed by label.
        let mut labels = HashSet::new();
        for destination in &self.destinations {
            if destination.target_table.trim().is_empty() {
                errors.push(format!(
                    "destination {} has no targetTable",
                    destination.endpoint
                ));
            }
            let label = destination.label();
            if !labels.insert(label.clone()) {
                errors.push(format!("destination {} is listed twice", label));
            }
        }

        if !errors.is_empty() {
            return Err(SetupError::Invalid { prefix, errors });
        }

        Ok(LoadConfiguration {
            prefix,
            current_batch_id: Uuid::new_v4().to_string(),
            schema_version: CURRENT_SCHEMA_VERSION,
            destinations: self.destinations,
            cluster: None,
            filename_filter: self.filename_filter,
            batch_max_entries: self.batch_max_entries,
            batch_max_age_seconds: self.batch_max_age_seconds,
            mount_dir: self.mount_dir,
            copy_options: self.copy_options,
            on_success: self.on_success,
            on_failure: self.on_failure,
            last_batch_rotation: None,
        })
    }
}

fn read(path: &Path) -> Result<String, SetupError> {
    std::fs::read_to_string(path).map_err(|source| SetupError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Parse a YAML list of setup records.
pub fn parse_records(yaml: &str) -> Result<Vec<LoadConfiguration>, SetupError> {
    let records: Vec<SetupRecord> = serde_yaml::from_str(yaml)?;
    records
        .into_iter()
        .map(SetupRecord::into_configuration)
        .collect()
}

/// Write every record in `path` to the store, replacing existing ones.
pub async fn setup(store: &dyn ConfigStore, path: &Path) -> Result<Vec<String>, SetupError> {
    let configs = parse_records(&read(path)?)?;
    let mut prefixes = Vec::with_capacity(configs.len());
    for config in configs {
        store.put(&config).await?;
        info!(
            prefix = %config.prefix,
            batch_id = %config.current_batch_id,
            destinations = config.destinations.len(),
            "Stored load configuration"
        );
        prefixes.push(config.prefix);
    }
    Ok(prefixes)
}

/// Append the destination described in `path` to an existing prefix.
pub async fn add_destination(
    store: &dyn ConfigStore,
    prefix: &str,
    path: &Path,
) -> Result<Destination, SetupError> {
    let prefix = normalize_configured_prefix(prefix);
    let destination: Destination = serde_yaml::from_str(&read(path)?)?;
    let label = destination.label();
    if let Some(existing) = store.get(&prefix).await? {
        if existing.destinations.iter().any(|d| d.label() == label) {
            return Err(SetupError::DuplicateDestination { prefix, label });
        }
    }
    store.add_destination(&prefix, &destination).await?;
    info!(prefix = %prefix, destination = %destination.label(), "Added destination");
    Ok(destination)
}
