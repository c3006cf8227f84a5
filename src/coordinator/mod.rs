//! Batch coordination over the shared stores.
//!
//! Appends race rotations through conditional writes only. A batch accepts
//! entries while `open` (or not yet written); whoever wins the `open -> locked`
//! write rotates the prefix to a fresh batch id and loads the locked entries.
//! Appenders that hit a locked batch reload the configuration and retry
//! against the new current batch.

pub mod trigger;

use crate::context::LoaderContext;
use crate::notify::{publish_best_effort, BatchNotification};
use crate::retry::{retry, RetryError};
use crate::storage::{
    BatchKey, BatchMutation, BatchOutcome, BatchPrecondition, BatchRecord, BatchStatus,
    LoadConfiguration, StorageError, Transition,
};
use crate::upgrade::{upgrade_config, UpgradeError};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use trigger::should_flush;

/// Alarm subject for a file that could not be added to any batch.
pub const STUCK_BATCH_SUBJECT: &str = "unable to write to open pending batch";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("configuration lookup for {prefix} still throttled after {attempts} attempts: {source}")]
    LookupExhausted {
        prefix: String,
        attempts: usize,
        source: StorageError,
    },

    #[error("configuration for {0} disappeared during append")]
    ConfigurationMissing(String),

    /// Carries the stored record's failure target, since no usable
    /// configuration exists to read it from.
    #[error("{source}")]
    Upgrade {
        on_failure: Option<String>,
        source: UpgradeError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(
        "batch {batch_id} for {prefix} stayed locked through {attempts} append attempts; \
         {file_id} was not added to any batch"
    )]
    StuckBatch {
        prefix: String,
        batch_id: String,
        file_id: String,
        attempts: usize,
    },

    #[error("locked batch {batch_id} for {prefix} but could not rotate: {source}")]
    Rotation {
        prefix: String,
        batch_id: String,
        source: StorageError,
    },

    #[error("could not persist the outcome of batch {batch_id} for {prefix}: {source}")]
    Closure {
        prefix: String,
        batch_id: String,
        source: StorageError,
    },
}

impl CoordinatorError {
    /// Subject used when this error is raised as an operational alarm.
    pub fn alarm_subject(&self) -> &'static str {
        match self {
            CoordinatorError::StuckBatch { .. } => STUCK_BATCH_SUBJECT,
            CoordinatorError::Closure { .. } => "unable to record batch outcome",
            CoordinatorError::Rotation { .. } => "unable to rotate batch",
            _ => "batch loader failure",
        }
    }

    /// Failure target known only from the raw stored record.
    pub fn stored_alarm_target(&self) -> Option<&str> {
        match self {
            CoordinatorError::Upgrade { on_failure, .. } => on_failure.as_deref(),
            _ => None,
        }
    }

    /// Add the batch id and recovery hint, where known, to an alarm payload.
    pub fn annotate_alarm(&self, payload: &mut serde_json::Value) {
        match self {
            CoordinatorError::StuckBatch { batch_id, .. }
            | CoordinatorError::Rotation { batch_id, .. }
            | CoordinatorError::Closure { batch_id, .. } => {
                payload["batchId"] = serde_json::Value::from(batch_id.as_str());
            }
            _ => {}
        }
        if let Some(hint) = self.recovery_hint() {
            payload["recovery"] = serde_json::Value::from(hint);
        }
    }

    /// Manual recovery hint for errors an operator has to resolve.
    pub fn recovery_hint(&self) -> Option<String> {
        match self {
            CoordinatorError::StuckBatch {
                prefix, batch_id, ..
            } => Some(format!(
                "batch {} for {} is locked but still current; rotate the prefix to a new batch \
                 or mark the batch open, then resubmit the file",
                batch_id, prefix
            )),
            CoordinatorError::Rotation {
                prefix, batch_id, ..
            } => Some(format!(
                "batch {} for {} is locked but still current; rotate the prefix to a new batch",
                batch_id, prefix
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
enum AppendAttemptError {
    #[error("batch {batch_id} no longer accepts entries (status {observed:?})")]
    Contended {
        batch_id: String,
        observed: Option<BatchStatus>,
    },

    #[error(transparent)]
    Fatal(CoordinatorError),
}

/// A file durably recorded in a batch.
#[derive(Debug, Clone)]
pub struct Appended {
    /// Configuration as it stood when the winning write happened.
    pub config: LoadConfiguration,
    pub batch: BatchRecord,
}

/// What a flush check did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    /// The current batch has never been written.
    NoBatch { batch_id: String },
    /// The batch is past `open`; somebody else owns it.
    NotOpen {
        batch_id: String,
        status: Option<BatchStatus>,
    },
    NotDue { batch_id: String, entries: usize },
    /// Another invocation locked the batch first.
    LostRace { batch_id: String },
    Loaded {
        batch_id: String,
        status: BatchStatus,
        entries: usize,
    },
}

#[derive(Clone)]
pub struct Coordinator {
    ctx: LoaderContext,
}

impl Coordinator {
    pub fn new(ctx: LoaderContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &LoaderContext {
        &self.ctx
    }

    /// Strongly consistent configuration read, retried while the store is
    /// throttled and upgraded to the running schema version.
    pub async fn configuration(
        &self,
        prefix: &str,
    ) -> Result<Option<LoadConfiguration>, CoordinatorError> {
        let policy = self.ctx.retry.config_lookup_policy();
        let found = retry(
            &policy,
            |_| self.ctx.configs.get(prefix),
            StorageError::is_throttled,
        )
        .await;

        let found = match found {
            Ok(found) => found,
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(prefix = %prefix, attempts = attempts, error = %last, "Configuration lookup exhausted retries");
                return Err(CoordinatorError::LookupExhausted {
                    prefix: prefix.to_string(),
                    attempts,
                    source: last,
                });
            }
            Err(RetryError::Failed(e)) => return Err(e.into()),
        };

        let Some(config) = found else {
            return Ok(None);
        };
        let on_failure = config.on_failure.clone();
        match upgrade_config(self.ctx.configs.as_ref(), config).await {
            Ok(config) => Ok(Some(config)),
            Err(source) => {
                error!(prefix = %prefix, error = %source, "Configuration upgrade failed");
                Err(CoordinatorError::Upgrade { on_failure, source })
            }
        }
    }

    /// Add `file_id` to the prefix's current batch, following rotations.
    pub async fn append(
        &self,
        config: LoadConfiguration,
        file_id: &str,
    ) -> Result<Appended, CoordinatorError> {
        let policy = self.ctx.retry.append_policy();
        let prefix = config.prefix.clone();
        let prefix = prefix.as_str();
        let current = Mutex::new(config);
        let current = &current;

        let result = retry(
            &policy,
            move |attempt| async move {
                let mut config = current.lock().await;
                if attempt > 1 {
                    // A locked batch means a rotation moved the pointer forward.
                    match self.configuration(prefix).await {
                        Ok(Some(reloaded)) => *config = reloaded,
                        Ok(None) => {
                            return Err(AppendAttemptError::Fatal(
                                CoordinatorError::ConfigurationMissing(prefix.to_string()),
                            ))
                        }
                        Err(e) => return Err(AppendAttemptError::Fatal(e)),
                    }
                }

                let key = BatchKey::new(config.current_batch_id.clone(), prefix);
                let mutation = BatchMutation::Append {
                    file_id: file_id.to_string(),
                    at: Utc::now(),
                };
                match self
                    .ctx
                    .batches
                    .transition(&key, BatchPrecondition::OpenOrUnset, mutation)
                    .await
                {
                    Ok(Transition::Applied(record)) => Ok((config.clone(), record)),
                    Ok(Transition::PreconditionFailed { observed }) => {
                        debug!(
                            prefix = %prefix,
                            batch_id = %key.batch_id,
                            file_id = %file_id,
                            attempt = attempt,
                            "Batch no longer open, reloading configuration"
                        );
                        Err(AppendAttemptError::Contended {
                            batch_id: key.batch_id,
                            observed,
                        })
                    }
                    Err(e) => Err(AppendAttemptError::Fatal(e.into())),
                }
            },
            |e: &AppendAttemptError| matches!(e, AppendAttemptError::Contended { .. }),
        )
        .await;

        match result {
            Ok((config, batch)) => {
                info!(
                    prefix = %prefix,
                    batch_id = %batch.batch_id,
                    file_id = %file_id,
                    entries = batch.entries.len(),
                    "Appended file to batch"
                );
                Ok(Appended { config, batch })
            }
            Err(e) => {
                let attempts = match &e {
                    RetryError::Exhausted { attempts, .. } => *attempts,
                    RetryError::Failed(_) => 1,
                };
                match e.into_inner() {
                    AppendAttemptError::Contended { batch_id, .. } => {
                        error!(
                            prefix = %prefix,
                            batch_id = %batch_id,
                            file_id = %file_id,
                            attempts = attempts,
                            "Append retries exhausted, batch is stuck"
                        );
                        Err(CoordinatorError::StuckBatch {
                            prefix: prefix.to_string(),
                            batch_id,
                            file_id: file_id.to_string(),
                            attempts,
                        })
                    }
                    AppendAttemptError::Fatal(e) => Err(e),
                }
            }
        }
    }

    /// Append, annotate the dedup marker, then run the flush check.
    pub async fn ingest(
        &self,
        config: LoadConfiguration,
        file_id: &str,
    ) -> Result<FlushOutcome, CoordinatorError> {
        let appended = self.append(config, file_id).await?;

        if let Err(e) = self
            .ctx
            .dedup
            .annotate(file_id, &appended.batch.batch_id)
            .await
        {
            warn!(file_id = %file_id, batch_id = %appended.batch.batch_id, error = %e, "Failed to annotate processed file");
        }

        self.flush_if_due(&appended.config, &appended.batch.batch_id)
            .await
    }

    /// Run the flush check against the prefix's current batch. Returns `None`
    /// for an unmanaged prefix. Failures are alarmed before they are returned.
    pub async fn check_flush(&self, prefix: &str) -> Result<Option<FlushOutcome>, CoordinatorError> {
        let config = match self.configuration(prefix).await {
            Ok(Some(config)) => config,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.raise_alarm(e.stored_alarm_target(), prefix, &e).await;
                return Err(e);
            }
        };

        let batch_id = config.current_batch_id.clone();
        match self.flush_if_due(&config, &batch_id).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                error!(prefix = %prefix, batch_id = %batch_id, error = %e, "Flush check failed");
                self.raise_alarm(config.on_failure.as_deref(), prefix, &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Publish an operator alarm for `e` to `target`. Best effort.
    pub async fn raise_alarm(&self, target: Option<&str>, prefix: &str, e: &CoordinatorError) {
        let mut payload = serde_json::json!({
            "error": e.to_string(),
            "prefix": prefix,
        });
        e.annotate_alarm(&mut payload);
        publish_best_effort(self.ctx.notifier.as_ref(), target, e.alarm_subject(), &payload)
            .await;
    }

    /// Lock, rotate and load `batch_id` if its size or age says so.
    pub async fn flush_if_due(
        &self,
        config: &LoadConfiguration,
        batch_id: &str,
    ) -> Result<FlushOutcome, CoordinatorError> {
        let key = BatchKey::new(batch_id, config.prefix.clone());
        let Some(record) = self.ctx.batches.get(&key).await? else {
            return Ok(FlushOutcome::NoBatch {
                batch_id: batch_id.to_string(),
            });
        };
        if record.status != Some(BatchStatus::Open) {
            if record.status.is_some_and(|status| status.is_terminal()) {
                debug!(prefix = %config.prefix, batch_id = %batch_id, "Batch already closed");
            } else {
                debug!(prefix = %config.prefix, batch_id = %batch_id, "Batch locked by another invocation");
            }
            return Ok(FlushOutcome::NotOpen {
                batch_id: batch_id.to_string(),
                status: record.status,
            });
        }

        let now = Utc::now();
        if !should_flush(record.entries.len(), record.last_update, now, config) {
            debug!(
                prefix = %config.prefix,
                batch_id = %batch_id,
                entries = record.entries.len(),
                "Batch not due"
            );
            return Ok(FlushOutcome::NotDue {
                batch_id: batch_id.to_string(),
                entries: record.entries.len(),
            });
        }

        let locked = match self
            .ctx
            .batches
            .transition(&key, BatchPrecondition::Open, BatchMutation::Lock { at: now })
            .await?
        {
            Transition::Applied(locked) => locked,
            Transition::PreconditionFailed { observed } => {
                info!(
                    prefix = %config.prefix,
                    batch_id = %batch_id,
                    observed = ?observed,
                    "Batch already locked by another invocation"
                );
                return Ok(FlushOutcome::LostRace {
                    batch_id: batch_id.to_string(),
                });
            }
        };
        info!(prefix = %config.prefix, batch_id = %batch_id, entries = locked.entries.len(), "Locked batch");

        self.rotate(&key).await?;

        let outcome = self
            .ctx
            .dispatcher
            .dispatch(config, batch_id, &locked.entries)
            .await;
        let status = self.close(&key, &outcome).await?;
        self.notify(config, &key, status, &outcome).await;

        Ok(FlushOutcome::Loaded {
            batch_id: batch_id.to_string(),
            status,
            entries: locked.entries.len(),
        })
    }

    async fn rotate(&self, locked: &BatchKey) -> Result<(), CoordinatorError> {
        let new_batch_id = Uuid::new_v4().to_string();
        let policy = self.ctx.retry.config_lookup_policy();
        let rotated = retry(
            &policy,
            |_| {
                self.ctx
                    .configs
                    .rotate(&locked.prefix, &new_batch_id, Utc::now())
            },
            StorageError::is_throttled,
        )
        .await;

        match rotated {
            Ok(()) => {
                info!(
                    prefix = %locked.prefix,
                    locked_batch_id = %locked.batch_id,
                    batch_id = %new_batch_id,
                    "Rotated to new batch"
                );
                Ok(())
            }
            Err(e) => {
                let source = e.into_inner();
                error!(prefix = %locked.prefix, batch_id = %locked.batch_id, error = %source, "Rotation failed");
                Err(CoordinatorError::Rotation {
                    prefix: locked.prefix.clone(),
                    batch_id: locked.batch_id.clone(),
                    source,
                })
            }
        }
    }

    async fn close(
        &self,
        key: &BatchKey,
        outcome: &BatchOutcome,
    ) -> Result<BatchStatus, CoordinatorError> {
        let status = outcome.final_status();
        let error_message = outcome.error_message();
        let now = Utc::now();
        let closure_error = |source| CoordinatorError::Closure {
            prefix: key.prefix.clone(),
            batch_id: key.batch_id.clone(),
            source,
        };

        self.ctx
            .batches
            .record_outcome(key, outcome, now)
            .await
            .map_err(closure_error)?;
        self.ctx
            .batches
            .close(key, status, error_message.as_deref(), now)
            .await
            .map_err(closure_error)?;

        match &error_message {
            None => info!(prefix = %key.prefix, batch_id = %key.batch_id, status = %status, "Closed batch"),
            Some(message) => {
                warn!(prefix = %key.prefix, batch_id = %key.batch_id, status = %status, error = %message, "Closed batch with errors")
            }
        }
        Ok(status)
    }

    async fn notify(
        &self,
        config: &LoadConfiguration,
        key: &BatchKey,
        status: BatchStatus,
        outcome: &BatchOutcome,
    ) {
        let ok = status == BatchStatus::Complete;
        let payload = BatchNotification {
            batch_id: key.batch_id.clone(),
            prefix: key.prefix.clone(),
            status: if ok { "ok" } else { "error" }.to_string(),
            error: outcome.error_message(),
            load_statements: outcome.destination_statements.clone(),
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(batch_id = %key.batch_id, error = %e, "Failed to encode batch notification");
                return;
            }
        };

        let (target, subject) = if ok {
            (
                config.on_success.as_deref(),
                format!("Batch Load {} OK", key.batch_id),
            )
        } else {
            (
                config.on_failure.as_deref(),
                format!("Batch Load {} Failure", key.batch_id),
            )
        };
        publish_best_effort(self.ctx.notifier.as_ref(), target, &subject, &payload).await;
    }
}
