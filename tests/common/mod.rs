#![allow(dead_code)]

use async_trait::async_trait;
use batchload::config::types::RetryConfig;
use batchload::context::LoaderContext;
use batchload::event::Notification;
use batchload::handler::EventHandler;
use batchload::loader::{
    ConnectTarget, CredentialDecryptor, LoadDispatcher, LoadError, LoadExecutor, LoadSession,
    ReferenceDecryptor,
};
use batchload::notify::{self, Notifier};
use batchload::storage::memory::MemoryStore;
use batchload::storage::{
    BatchKey, BatchMutation, BatchOutcome, BatchPrecondition, BatchRecord, BatchStatus,
    BatchStore, ConfigStore, DedupStore, Destination, LoadConfiguration, Registration,
    StorageError, Transition, CURRENT_SCHEMA_VERSION,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PREFIX: &str = "bucket/in";

/// Executor that fails any statement containing one of `fail_on`.
#[derive(Default, Clone)]
pub struct ScriptedExecutor {
    pub fail_on: Vec<String>,
    pub executed: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedExecutor {
    pub fn failing_on(needles: &[&str]) -> Self {
        Self {
            fail_on: needles.iter().map(|s| s.to_string()).collect(),
            executed: Arc::default(),
        }
    }

    pub fn statements(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }
}

struct ScriptedSession {
    host: String,
    fail_on: Vec<String>,
    executed: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl LoadExecutor for ScriptedExecutor {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn LoadSession>, LoadError> {
        Ok(Box::new(ScriptedSession {
            host: target.host.clone(),
            fail_on: self.fail_on.clone(),
            executed: self.executed.clone(),
        }))
    }
}

#[async_trait]
impl LoadSession for ScriptedSession {
    async fn execute(&mut self, statement: &str) -> Result<(), LoadError> {
        self.executed
            .lock()
            .unwrap()
            .push((self.host.clone(), statement.to_string()));
        if self.fail_on.iter().any(|n| statement.contains(n.as_str())) {
            return Err(LoadError::Statement(format!("rejected {}", statement)));
        }
        Ok(())
    }
}

/// Decryptor backed by a fixed table.
#[derive(Default)]
pub struct TableDecryptor {
    pub secrets: HashMap<String, String>,
}

#[async_trait]
impl CredentialDecryptor for TableDecryptor {
    async fn decrypt(&self, credentials_ref: &str) -> Result<String, LoadError> {
        self.secrets
            .get(credentials_ref)
            .cloned()
            .ok_or_else(|| LoadError::Decryption(format!("unknown key {}", credentials_ref)))
    }
}

#[derive(Debug, Clone)]
pub struct Published {
    pub target: String,
    pub subject: String,
    pub payload: serde_json::Value,
}

#[derive(Default, Clone)]
pub struct RecordingNotifier {
    pub published: Arc<Mutex<Vec<Published>>>,
}

impl RecordingNotifier {
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(
        &self,
        target: &str,
        subject: &str,
        payload: &serde_json::Value,
    ) -> notify::Result<()> {
        self.published.lock().unwrap().push(Published {
            target: target.to_string(),
            subject: subject.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

pub fn destination(endpoint: &str, table: &str) -> Destination {
    Destination {
        endpoint: endpoint.to_string(),
        port: 5433,
        user: "loader".to_string(),
        credentials_ref: "plain-secret".to_string(),
        target_table: table.to_string(),
        pre_load_statement: None,
        post_load_statement: None,
    }
}

pub fn load_config(max_entries: u32, destinations: Vec<Destination>) -> LoadConfiguration {
    LoadConfiguration {
        prefix: PREFIX.to_string(),
        current_batch_id: "batch-0".to_string(),
        schema_version: CURRENT_SCHEMA_VERSION,
        destinations,
        cluster: None,
        filename_filter: None,
        batch_max_entries: max_entries,
        batch_max_age_seconds: None,
        mount_dir: "/mnt/s3/".to_string(),
        copy_options: None,
        on_success: Some("success-hook".to_string()),
        on_failure: Some("failure-hook".to_string()),
        last_batch_rotation: None,
    }
}

pub fn notification(key: &str) -> Notification {
    notification_with_name(key, "ObjectCreated:Put")
}

pub fn notification_with_name(key: &str, event_name: &str) -> Notification {
    serde_json::from_value(serde_json::json!({
        "Records": [{
            "eventSource": "aws:s3",
            "eventName": event_name,
            "s3": {
                "s3SchemaVersion": "1.0",
                "bucket": { "name": "bucket" },
                "object": { "key": key }
            }
        }]
    }))
    .unwrap()
}

pub fn fast_retry(append_attempts: usize) -> RetryConfig {
    RetryConfig {
        config_lookup_attempts: 5,
        config_lookup_backoff: Duration::from_millis(2),
        append_attempts,
        append_contention_backoff: Duration::from_millis(2),
    }
}

pub fn handler_with<S>(
    store: Arc<S>,
    executor: ScriptedExecutor,
    notifier: RecordingNotifier,
    retry: RetryConfig,
) -> EventHandler
where
    S: ConfigStore + DedupStore + BatchStore + 'static,
{
    let dispatcher = LoadDispatcher::new(Arc::new(executor), Arc::new(ReferenceDecryptor));
    EventHandler::new(LoaderContext::new(
        store,
        dispatcher,
        Arc::new(notifier),
        retry,
    ))
}

/// Every batch ever written for the test prefix.
pub async fn all_batches(store: &MemoryStore) -> Vec<BatchRecord> {
    store.batches_for_prefix(PREFIX).await
}

/// Store wrapper that injects failures into selected operations.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    /// Configuration reads that answer `Throttled` before succeeding.
    pub throttled_lookups: AtomicUsize,
    pub lookups: AtomicUsize,
    pub fail_rotate: AtomicBool,
    pub fail_record_outcome: AtomicBool,
}

impl FaultyStore {
    pub fn throttling(lookups: usize) -> Self {
        let store = Self::default();
        store.throttled_lookups.store(lookups, Ordering::SeqCst);
        store
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigStore for FaultyStore {
    async fn get(&self, prefix: &str) -> Result<Option<LoadConfiguration>, StorageError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let throttled = self
            .throttled_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(StorageError::Throttled("provisioned throughput exceeded".to_string()));
        }
        ConfigStore::get(&self.inner, prefix).await
    }

    async fn rotate(
        &self,
        prefix: &str,
        new_batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if self.fail_rotate.load(Ordering::SeqCst) {
            return Err(StorageError::Database("conditional check failed".to_string()));
        }
        self.inner.rotate(prefix, new_batch_id, now).await
    }

    async fn put(&self, config: &LoadConfiguration) -> Result<(), StorageError> {
        self.inner.put(config).await
    }

    async fn store_upgrade(&self, config: &LoadConfiguration) -> Result<(), StorageError> {
        self.inner.store_upgrade(config).await
    }

    async fn add_destination(
        &self,
        prefix: &str,
        destination: &Destination,
    ) -> Result<(), StorageError> {
        self.inner.add_destination(prefix, destination).await
    }
}

#[async_trait]
impl DedupStore for FaultyStore {
    async fn register_if_absent(
        &self,
        file_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, StorageError> {
        self.inner.register_if_absent(file_id, now).await
    }

    async fn annotate(&self, file_id: &str, batch_id: &str) -> Result<(), StorageError> {
        self.inner.annotate(file_id, batch_id).await
    }
}

#[async_trait]
impl BatchStore for FaultyStore {
    async fn get(&self, key: &BatchKey) -> Result<Option<BatchRecord>, StorageError> {
        BatchStore::get(&self.inner, key).await
    }

    async fn transition(
        &self,
        key: &BatchKey,
        precondition: BatchPrecondition,
        mutation: BatchMutation,
    ) -> Result<Transition<BatchRecord>, StorageError> {
        self.inner.transition(key, precondition, mutation).await
    }

    async fn record_outcome(
        &self,
        key: &BatchKey,
        outcome: &BatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if self.fail_record_outcome.load(Ordering::SeqCst) {
            return Err(StorageError::Database("disk full".to_string()));
        }
        self.inner.record_outcome(key, outcome, now).await
    }

    async fn close(
        &self,
        key: &BatchKey,
        status: BatchStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.inner.close(key, status, error_message, now).await
    }

    async fn list_by_status(&self, status: BatchStatus) -> Result<Vec<BatchRecord>, StorageError> {
        self.inner.list_by_status(status).await
    }
}

/// An open batch for the test prefix whose last append was `idle_seconds` ago.
pub fn idle_batch(batch_id: &str, idle_seconds: i64, files: &[&str]) -> BatchRecord {
    let mut record = BatchRecord::empty(
        &BatchKey::new(batch_id, PREFIX),
        Utc::now() - chrono::Duration::seconds(idle_seconds),
    );
    record.status = Some(BatchStatus::Open);
    for file in files {
        record.entries.insert(format!("bucket/{}", file));
    }
    record
}
