use super::records::{
    BatchKey, BatchOutcome, BatchRecord, BatchStatus, DedupRecord, Destination, LoadConfiguration,
};
use super::traits::{
    BatchMutation, BatchPrecondition, BatchStore, ConfigStore, DedupStore, Registration,
    StorageError, Transition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    configurations: HashMap<String, LoadConfiguration>,
    processed_files: HashMap<String, DedupRecord>,
    batches: BTreeMap<BatchKey, BatchRecord>,
}

/// In-memory implementation of all three stores.
///
/// Every operation holds the lock for its whole read-check-write, which gives
/// the same single-item atomicity the persistent store provides.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a batch record as-is, bypassing the transition rules.
    pub async fn insert_batch(&self, record: BatchRecord) {
        let mut inner = self.inner.lock().await;
        inner.batches.insert(record.key(), record);
    }

    pub async fn batches_for_prefix(&self, prefix: &str) -> Vec<BatchRecord> {
        let inner = self.inner.lock().await;
        inner
            .batches
            .values()
            .filter(|b| b.prefix == prefix)
            .cloned()
            .collect()
    }

    pub async fn dedup_record(&self, file_id: &str) -> Option<DedupRecord> {
        let inner = self.inner.lock().await;
        inner.processed_files.get(file_id).cloned()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, prefix: &str) -> Result<Option<LoadConfiguration>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.configurations.get(prefix).cloned())
    }

    async fn rotate(
        &self,
        prefix: &str,
        new_batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let config = inner
            .configurations
            .get_mut(prefix)
            .ok_or_else(|| StorageError::NotFound(format!("configuration for {}", prefix)))?;
        config.current_batch_id = new_batch_id.to_string();
        config.last_batch_rotation = Some(now);
        Ok(())
    }

    async fn put(&self, config: &LoadConfiguration) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner
            .configurations
            .insert(config.prefix.clone(), config.clone());
        Ok(())
    }

    async fn store_upgrade(&self, config: &LoadConfiguration) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .configurations
            .get_mut(&config.prefix)
            .ok_or_else(|| StorageError::NotFound(format!("configuration for {}", config.prefix)))?;
        let current_batch_id = std::mem::take(&mut stored.current_batch_id);
        let last_batch_rotation = stored.last_batch_rotation;
        *stored = config.clone();
        stored.current_batch_id = current_batch_id;
        stored.last_batch_rotation = last_batch_rotation;
        Ok(())
    }

    async fn add_destination(
        &self,
        prefix: &str,
        destination: &Destination,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let config = inner
            .configurations
            .get_mut(prefix)
            .ok_or_else(|| StorageError::NotFound(format!("configuration for {}", prefix)))?;
        config.destinations.push(destination.clone());
        Ok(())
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn register_if_absent(
        &self,
        file_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.processed_files.contains_key(file_id) {
            return Ok(Registration::AlreadyExists);
        }
        inner.processed_files.insert(
            file_id.to_string(),
            DedupRecord {
                file_id: file_id.to_string(),
                registered_at: now,
                batch_id: None,
            },
        );
        Ok(Registration::Inserted)
    }

    async fn annotate(&self, file_id: &str, batch_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .processed_files
            .get_mut(file_id)
            .ok_or_else(|| StorageError::NotFound(format!("processed file {}", file_id)))?;
        record.batch_id = Some(batch_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn get(&self, key: &BatchKey) -> Result<Option<BatchRecord>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.batches.get(key).cloned())
    }

    async fn transition(
        &self,
        key: &BatchKey,
        precondition: BatchPrecondition,
        mutation: BatchMutation,
    ) -> Result<Transition<BatchRecord>, StorageError> {
        let mut inner = self.inner.lock().await;
        let observed = inner.batches.get(key).and_then(|b| b.status);
        if !precondition.admits(observed) {
            return Ok(Transition::PreconditionFailed { observed });
        }

        let record = inner
            .batches
            .entry(key.clone())
            .or_insert_with(|| BatchRecord::empty(key, mutation.at()));
        mutation.apply(record);
        Ok(Transition::Applied(record.clone()))
    }

    async fn record_outcome(
        &self,
        key: &BatchKey,
        outcome: &BatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .batches
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(format!("batch {}", key)))?;
        record.destination_status = outcome.destination_status.clone();
        record.destination_statements = outcome.destination_statements.clone();
        record.last_update = now;
        Ok(())
    }

    async fn close(
        &self,
        key: &BatchKey,
        status: BatchStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .batches
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(format!("batch {}", key)))?;
        record.status = Some(status);
        record.error_message = error_message.map(str::to_string);
        record.last_update = now;
        Ok(())
    }

    async fn list_by_status(&self, status: BatchStatus) -> Result<Vec<BatchRecord>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .batches
            .values()
            .filter(|b| b.status == Some(status))
            .cloned()
            .collect())
    }
}
