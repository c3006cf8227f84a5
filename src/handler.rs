use crate::context::LoaderContext;
use crate::coordinator::{Coordinator, CoordinatorError, FlushOutcome};
use crate::event::{EventError, FileArrival, Notification};
use crate::notify::publish_best_effort;
use crate::storage::{LoadConfiguration, Registration, StorageError};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

const FAILURE_SUBJECT: &str = "batch loader failure";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unsupported event: {0}")]
    Unsupported(#[from] EventError),

    #[error("invalid filename filter for {prefix}: {source}")]
    InvalidFilter {
        prefix: String,
        source: regex::Error,
    },

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl HandlerError {
    /// Fatal errors fail the invocation and raise an alarm. An unsupported
    /// event is the sender's problem.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HandlerError::Unsupported(_))
    }

    fn alarm_subject(&self) -> &'static str {
        match self {
            HandlerError::Coordinator(e) => e.alarm_subject(),
            _ => FAILURE_SUBJECT,
        }
    }
}

/// How one invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    /// The delivery carried no records.
    Ignored,
    /// Nothing is configured for the prefix; the file is unmanaged.
    NoConfiguration { prefix: String },
    Duplicate { file_id: String },
    /// Excluded by the filename filter. The current batch was still checked.
    FilteredOut { file_id: String, flush: FlushOutcome },
    Accepted { file_id: String, flush: FlushOutcome },
}

/// Runs one independent invocation per delivered notification.
#[derive(Clone)]
pub struct EventHandler {
    coordinator: Coordinator,
}

impl EventHandler {
    pub fn new(ctx: LoaderContext) -> Self {
        Self {
            coordinator: Coordinator::new(ctx),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub async fn handle(&self, notification: Notification) -> Result<Disposition, HandlerError> {
        let Some(arrival) = notification.into_arrival()? else {
            info!("Notification carried no records");
            return Ok(Disposition::Ignored);
        };
        let file_id = arrival.file_id();

        let config = match self.coordinator.configuration(&arrival.prefix).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                info!(prefix = %arrival.prefix, file_id = %file_id, "No configuration for prefix");
                return Ok(Disposition::NoConfiguration {
                    prefix: arrival.prefix,
                });
            }
            Err(e) => {
                error!(prefix = %arrival.prefix, file_id = %file_id, error = %e, "Configuration lookup failed");
                let target = e.stored_alarm_target().map(str::to_string);
                let e = HandlerError::from(e);
                self.raise_alarm(target.as_deref(), &arrival, &file_id, &e)
                    .await;
                return Err(e);
            }
        };

        let on_failure = config.on_failure.clone();
        match self.process(&arrival, &file_id, config).await {
            Ok(disposition) => Ok(disposition),
            Err(e) => {
                error!(prefix = %arrival.prefix, file_id = %file_id, error = %e, "Invocation failed");
                self.raise_alarm(on_failure.as_deref(), &arrival, &file_id, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        arrival: &FileArrival,
        file_id: &str,
        config: LoadConfiguration,
    ) -> Result<Disposition, HandlerError> {
        if let Some(filter) = config.filename_filter.as_deref().filter(|f| !f.is_empty()) {
            let re = Regex::new(filter).map_err(|source| HandlerError::InvalidFilter {
                prefix: config.prefix.clone(),
                source,
            })?;
            if !re.is_match(&arrival.key) {
                info!(prefix = %config.prefix, file_id = %file_id, filter = %filter, "File excluded by filename filter");
                let batch_id = config.current_batch_id.clone();
                let flush = self.coordinator.flush_if_due(&config, &batch_id).await?;
                return Ok(Disposition::FilteredOut {
                    file_id: file_id.to_string(),
                    flush,
                });
            }
        }

        let registration = self
            .coordinator
            .context()
            .dedup
            .register_if_absent(file_id, Utc::now())
            .await?;
        if registration == Registration::AlreadyExists {
            info!(prefix = %config.prefix, file_id = %file_id, "Duplicate file, already processed");
            return Ok(Disposition::Duplicate {
                file_id: file_id.to_string(),
            });
        }

        let flush = self.coordinator.ingest(config, file_id).await?;
        Ok(Disposition::Accepted {
            file_id: file_id.to_string(),
            flush,
        })
    }

    async fn raise_alarm(
        &self,
        target: Option<&str>,
        arrival: &FileArrival,
        file_id: &str,
        e: &HandlerError,
    ) {
        if !e.is_fatal() {
            return;
        }
        let mut payload = serde_json::json!({
            "error": e.to_string(),
            "prefix": arrival.prefix,
            "fileId": file_id,
        });
        if let HandlerError::Coordinator(inner) = e {
            inner.annotate_alarm(&mut payload);
        }
        publish_best_effort(
            self.coordinator.context().notifier.as_ref(),
            target,
            e.alarm_subject(),
            &payload,
        )
        .await;
    }
}
