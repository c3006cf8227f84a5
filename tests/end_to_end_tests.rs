mod common;

use batchload::coordinator::FlushOutcome;
use batchload::handler::Disposition;
use batchload::storage::duckdb::DuckDbStore;
use batchload::storage::memory::MemoryStore;
use batchload::storage::{BatchKey, BatchRecord, BatchStatus, BatchStore, ConfigStore};
use chrono::{Duration, Utc};
use common::*;
use std::sync::Arc;

async fn accept(handler: &batchload::handler::EventHandler, key: &str) -> FlushOutcome {
    match handler.handle(notification(key)).await.unwrap() {
        Disposition::Accepted { flush, .. } => flush,
        other => panic!("expected {} to be accepted, got {:?}", key, other),
    }
}

#[tokio::test]
async fn test_partial_destination_failure_marks_batch_error() {
    let store = Arc::new(MemoryStore::new());
    ConfigStore::put(
        store.as_ref(),
        &load_config(2, vec![destination("primary", "events"), destination("replica", "events_copy")]),
    )
    .await
    .unwrap();

    let executor = ScriptedExecutor::failing_on(&["COPY events_copy"]);
    let notifier = RecordingNotifier::default();
    let handler = handler_with(
        store.clone(),
        executor.clone(),
        notifier.clone(),
        fast_retry(10),
    );

    assert!(matches!(
        accept(&handler, "in/a.csv").await,
        FlushOutcome::NotDue { entries: 1, .. }
    ));
    let flush = accept(&handler, "in/b.csv").await;
    assert_eq!(
        flush,
        FlushOutcome::Loaded {
            batch_id: "batch-0".to_string(),
            status: BatchStatus::Error,
            entries: 2
        }
    );

    let batch = BatchStore::get(store.as_ref(), &BatchKey::new("batch-0", PREFIX))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.status, Some(BatchStatus::Error));
    assert!(batch.destination_status["primary:5433/events"].ok);
    assert!(!batch.destination_status["replica:5433/events_copy"].ok);
    assert_eq!(batch.destination_statements.len(), 2);
    let error_message = batch.error_message.unwrap();
    assert!(error_message.contains("replica:5433/events_copy"));
    assert!(!error_message.contains("primary:5433/events\""));

    // Both destinations ran despite the failure.
    assert_eq!(executor.statements().len(), 2);

    let published = notifier.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].target, "failure-hook");
    assert_eq!(published[0].subject, "Batch Load batch-0 Failure");
    assert_eq!(published[0].payload["status"], "error");
    assert_eq!(published[0].payload["batchId"], "batch-0");
}

#[tokio::test]
async fn test_size_trigger_rotates_and_notifies_success() {
    let store = Arc::new(MemoryStore::new());
    ConfigStore::put(store.as_ref(), &load_config(3, vec![destination("db", "events")]))
        .await
        .unwrap();
    let executor = ScriptedExecutor::default();
    let notifier = RecordingNotifier::default();
    let handler = handler_with(store.clone(), executor.clone(), notifier.clone(), fast_retry(10));

    accept(&handler, "in/a.csv").await;
    accept(&handler, "in/b.csv").await;
    assert!(executor.statements().is_empty());
    assert!(matches!(
        accept(&handler, "in/c.csv").await,
        FlushOutcome::Loaded {
            status: BatchStatus::Complete,
            entries: 3,
            ..
        }
    ));

    let statements = executor.statements();
    assert_eq!(
        statements[0].1,
        "COPY events FROM '/mnt/s3/bucket/in/a.csv', '/mnt/s3/bucket/in/b.csv', '/mnt/s3/bucket/in/c.csv'"
    );

    // The next file starts a fresh batch.
    let flush = accept(&handler, "in/d.csv").await;
    let config = ConfigStore::get(store.as_ref(), PREFIX).await.unwrap().unwrap();
    assert_eq!(
        flush,
        FlushOutcome::NotDue {
            batch_id: config.current_batch_id.clone(),
            entries: 1
        }
    );

    let published = notifier.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].target, "success-hook");
    assert_eq!(published[0].payload["status"], "ok");
}

#[tokio::test]
async fn test_filtered_event_flushes_idle_batch() {
    let store = Arc::new(MemoryStore::new());
    let mut config = load_config(100, vec![destination("db", "events")]);
    config.batch_max_age_seconds = Some(30);
    config.filename_filter = Some(r"\.csv$".to_string());
    ConfigStore::put(store.as_ref(), &config).await.unwrap();

    let mut idle = BatchRecord::empty(
        &BatchKey::new("batch-0", PREFIX),
        Utc::now() - Duration::seconds(31),
    );
    idle.status = Some(BatchStatus::Open);
    idle.entries.insert("bucket/in/old.csv".to_string());
    store.insert_batch(idle).await;

    let handler = handler_with(
        store.clone(),
        ScriptedExecutor::default(),
        RecordingNotifier::default(),
        fast_retry(10),
    );

    match handler.handle(notification("in/skip.json")).await.unwrap() {
        Disposition::FilteredOut { file_id, flush } => {
            assert_eq!(file_id, "bucket/in/skip.json");
            assert!(matches!(
                flush,
                FlushOutcome::Loaded {
                    status: BatchStatus::Complete,
                    entries: 1,
                    ..
                }
            ));
        }
        other => panic!("unexpected disposition {:?}", other),
    }
    assert!(store.dedup_record("bucket/in/skip.json").await.is_none());
}

#[tokio::test]
async fn test_recent_batch_is_not_flushed_by_age() {
    let store = Arc::new(MemoryStore::new());
    let mut config = load_config(100, vec![destination("db", "events")]);
    config.batch_max_age_seconds = Some(30);
    ConfigStore::put(store.as_ref(), &config).await.unwrap();

    let mut recent = BatchRecord::empty(
        &BatchKey::new("batch-0", PREFIX),
        Utc::now() - Duration::seconds(29),
    );
    recent.status = Some(BatchStatus::Open);
    recent.entries.insert("bucket/in/old.csv".to_string());
    store.insert_batch(recent).await;

    let handler = handler_with(
        store.clone(),
        ScriptedExecutor::default(),
        RecordingNotifier::default(),
        fast_retry(10),
    );
    let outcome = handler
        .coordinator()
        .check_flush(PREFIX)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, FlushOutcome::NotDue { entries: 1, .. }));
}

#[tokio::test]
async fn test_encoded_and_literal_plus_load_the_same_path() {
    let store = Arc::new(MemoryStore::new());
    ConfigStore::put(store.as_ref(), &load_config(1, vec![destination("db", "events")]))
        .await
        .unwrap();
    let executor = ScriptedExecutor::default();
    let handler = handler_with(
        store.clone(),
        executor.clone(),
        RecordingNotifier::default(),
        fast_retry(10),
    );

    // The event key is percent-encoded; %252B decodes to a literal "%2B".
    accept(&handler, "in/a%252Bb.csv").await;
    let statements = executor.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(statements[0].1, "COPY events FROM '/mnt/s3/bucket/in/a+b.csv'");
}

#[tokio::test]
async fn test_legacy_configuration_is_upgraded_before_loading() {
    let store = Arc::new(MemoryStore::new());
    let mut legacy = load_config(1, vec![]);
    legacy.schema_version = 1;
    legacy.cluster = Some(destination("legacy", "events"));
    ConfigStore::put(store.as_ref(), &legacy).await.unwrap();

    let executor = ScriptedExecutor::default();
    let handler = handler_with(
        store.clone(),
        executor.clone(),
        RecordingNotifier::default(),
        fast_retry(10),
    );
    accept(&handler, "in/a.csv").await;

    assert_eq!(executor.statements()[0].0, "legacy");
    let stored = ConfigStore::get(store.as_ref(), PREFIX).await.unwrap().unwrap();
    assert_eq!(stored.schema_version, 2);
    assert!(stored.cluster.is_none());
    assert_eq!(stored.destinations.len(), 1);
    assert_ne!(stored.current_batch_id, "batch-0");
}

#[tokio::test]
async fn test_duckdb_backed_flow() {
    let store = Arc::new(DuckDbStore::in_memory().unwrap());
    store.init_schema().await.unwrap();
    ConfigStore::put(store.as_ref(), &load_config(2, vec![destination("db", "events")]))
        .await
        .unwrap();
    let handler = handler_with(
        store.clone(),
        ScriptedExecutor::default(),
        RecordingNotifier::default(),
        fast_retry(10),
    );

    accept(&handler, "in/a.csv").await;
    assert!(matches!(
        handler.handle(notification("in/a.csv")).await.unwrap(),
        Disposition::Duplicate { .. }
    ));
    assert!(matches!(
        accept(&handler, "in/b.csv").await,
        FlushOutcome::Loaded {
            status: BatchStatus::Complete,
            ..
        }
    ));

    let complete = store.list_by_status(BatchStatus::Complete).await.unwrap();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].entries.len(), 2);
    let annotated = store.processed_file("bucket/in/a.csv").await.unwrap().unwrap();
    assert_eq!(annotated.batch_id.as_deref(), Some("batch-0"));
}
