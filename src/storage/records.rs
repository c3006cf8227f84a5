use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Schema version written by this build. Older records are upgraded on read.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Load configuration for one watched prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadConfiguration {
    pub prefix: String,
    pub current_batch_id: String,
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    /// Single destination stored inline by schema version 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Destination>,
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
    #[serde(default)]
    pub last_batch_rotation: Option<DateTime<Utc>>,
}

fn legacy_schema_version() -> u32 {
    1
}

/// One target cluster/table a batch is loaded into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub endpoint: String,
    pub port: u16,
    pub user: String,
    pub credentials_ref: String,
    pub target_table: String,
    #[serde(default)]
    pub pre_load_statement: Option<String>,
    #[serde(default)]
    pub post_load_statement: Option<String>,
}

impl Destination {
    /// Key used for this destination in per-destination outcome maps.
    pub fn label(&self) -> String {
        format!("{}:{}/{}", self.endpoint, self.port, self.target_table)
    }
}

/// Marker written once per accepted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub file_id: String,
    pub registered_at: DateTime<Utc>,
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Open,
    Locked,
    Complete,
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Open => "open",
            BatchStatus::Locked => "locked",
            BatchStatus::Complete => "complete",
            BatchStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Complete | BatchStatus::Error)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(BatchStatus::Open),
            "locked" => Ok(BatchStatus::Locked),
            "complete" => Ok(BatchStatus::Complete),
            "error" => Ok(BatchStatus::Error),
            other => Err(format!("unknown batch status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    pub batch_id: String,
    pub prefix: String,
}

impl BatchKey {
    pub fn new(batch_id: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            prefix: prefix.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.batch_id, self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub batch_id: String,
    pub prefix: String,
    /// `None` only for a record that has never been written.
    pub status: Option<BatchStatus>,
    pub entries: BTreeSet<String>,
    pub last_update: DateTime<Utc>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub destination_status: BTreeMap<String, DestinationStatus>,
    #[serde(default)]
    pub destination_statements: BTreeMap<String, LoadStatements>,
}

impl BatchRecord {
    pub fn empty(key: &BatchKey, at: DateTime<Utc>) -> Self {
        Self {
            batch_id: key.batch_id.clone(),
            prefix: key.prefix.clone(),
            status: None,
            entries: BTreeSet::new(),
            last_update: at,
            error_message: None,
            destination_status: BTreeMap::new(),
            destination_statements: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.batch_id.clone(), self.prefix.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A statement as it was sent to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedStatement {
    pub text: String,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadStatements {
    pub pre_load: Option<ExecutedStatement>,
    pub load: Option<ExecutedStatement>,
    pub post_load: Option<ExecutedStatement>,
}

/// Aggregated result of loading one batch into every destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub destination_status: BTreeMap<String, DestinationStatus>,
    pub destination_statements: BTreeMap<String, LoadStatements>,
}

impl BatchOutcome {
    pub fn all_ok(&self) -> bool {
        self.destination_status.values().all(|s| s.ok)
    }

    pub fn final_status(&self) -> BatchStatus {
        if self.all_ok() {
            BatchStatus::Complete
        } else {
            BatchStatus::Error
        }
    }

    /// Serialized failures of every destination that did not load, if any.
    pub fn error_message(&self) -> Option<String> {
        let failed: BTreeMap<&String, &DestinationStatus> = self
            .destination_status
            .iter()
            .filter(|(_, s)| !s.ok)
            .collect();
        if failed.is_empty() {
            return None;
        }
        Some(serde_json::to_string(&failed).unwrap_or_else(|_| format!("{:?}", failed)))
    }
}
