use crate::config::types::RetryConfig;
use crate::loader::LoadDispatcher;
use crate::notify::Notifier;
use crate::storage::{BatchStore, ConfigStore, DedupStore};
use std::sync::Arc;

/// Everything an invocation needs, built once at startup and handed to each
/// component explicitly.
#[derive(Clone)]
pub struct LoaderContext {
    pub configs: Arc<dyn ConfigStore>,
    pub dedup: Arc<dyn DedupStore>,
    pub batches: Arc<dyn BatchStore>,
    pub dispatcher: LoadDispatcher,
    pub notifier: Arc<dyn Notifier>,
    pub retry: RetryConfig,
}

impl LoaderContext {
    /// Context backed by a single store implementing all three tables.
    pub fn new<S>(
        store: Arc<S>,
        dispatcher: LoadDispatcher,
        notifier: Arc<dyn Notifier>,
        retry: RetryConfig,
    ) -> Self
    where
        S: ConfigStore + DedupStore + BatchStore + 'static,
    {
        Self {
            configs: store.clone(),
            dedup: store.clone(),
            batches: store,
            dispatcher,
            notifier,
            retry,
        }
    }
}
