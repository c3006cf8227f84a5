use super::records::{
    BatchKey, BatchOutcome, BatchRecord, BatchStatus, Destination, LoadConfiguration,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Transient overload of the backing store. Safe to retry after a delay.
    #[error("store throttled: {0}")]
    Throttled(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, StorageError::Throttled(_))
    }
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        let message = e.to_string();
        // Write-write conflicts and file lock contention clear on their own.
        if message.contains("Conflict") || message.contains("Could not set lock") {
            StorageError::Throttled(message)
        } else {
            StorageError::Database(message)
        }
    }
}

/// Condition a batch record must satisfy for a transition to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPrecondition {
    /// Record absent, status unset, or status `open`.
    OpenOrUnset,
    /// Status exactly `open`.
    Open,
}

impl BatchPrecondition {
    pub fn admits(&self, status: Option<BatchStatus>) -> bool {
        match self {
            BatchPrecondition::OpenOrUnset => matches!(status, None | Some(BatchStatus::Open)),
            BatchPrecondition::Open => status == Some(BatchStatus::Open),
        }
    }
}

/// Mutation applied to a batch record once its precondition holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchMutation {
    /// Add a file to the entry set, bump `last_update`, mark `open`.
    Append { file_id: String, at: DateTime<Utc> },
    /// Move `open` to `locked` and bump `last_update`.
    Lock { at: DateTime<Utc> },
}

impl BatchMutation {
    pub fn apply(&self, record: &mut BatchRecord) {
        match self {
            BatchMutation::Append { file_id, at } => {
                record.entries.insert(file_id.clone());
                record.last_update = *at;
                record.status = Some(BatchStatus::Open);
            }
            BatchMutation::Lock { at } => {
                record.status = Some(BatchStatus::Locked);
                record.last_update = *at;
            }
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            BatchMutation::Append { at, .. } | BatchMutation::Lock { at } => *at,
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<T> {
    /// The write happened; carries the record as it stands after the write.
    Applied(T),
    /// The precondition did not hold; nothing was written.
    PreconditionFailed { observed: Option<BatchStatus> },
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    AlreadyExists,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Strongly consistent read of the configuration for `prefix`.
    async fn get(&self, prefix: &str) -> Result<Option<LoadConfiguration>, StorageError>;

    /// Point the prefix at a fresh current batch.
    async fn rotate(
        &self,
        prefix: &str,
        new_batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Create or replace a whole record.
    async fn put(&self, config: &LoadConfiguration) -> Result<(), StorageError>;

    /// Persist an upgraded document without touching the current batch pointer.
    async fn store_upgrade(&self, config: &LoadConfiguration) -> Result<(), StorageError>;

    async fn add_destination(
        &self,
        prefix: &str,
        destination: &Destination,
    ) -> Result<(), StorageError>;
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Insert `file_id` only if it has never been seen.
    async fn register_if_absent(
        &self,
        file_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, StorageError>;

    /// Record which batch the file ended up in.
    async fn annotate(&self, file_id: &str, batch_id: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Strongly consistent read.
    async fn get(&self, key: &BatchKey) -> Result<Option<BatchRecord>, StorageError>;

    /// Apply `mutation` atomically iff `precondition` admits the stored status.
    async fn transition(
        &self,
        key: &BatchKey,
        precondition: BatchPrecondition,
        mutation: BatchMutation,
    ) -> Result<Transition<BatchRecord>, StorageError>;

    /// Attach per-destination results. Unconditional.
    async fn record_outcome(
        &self,
        key: &BatchKey,
        outcome: &BatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Final status write. Unconditional.
    async fn close(
        &self,
        key: &BatchKey,
        status: BatchStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn list_by_status(&self, status: BatchStatus) -> Result<Vec<BatchRecord>, StorageError>;
}
