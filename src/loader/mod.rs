pub mod executor;
pub mod statement;

use crate::storage::{
    BatchOutcome, Destination, DestinationStatus, ExecutedStatement, LoadConfiguration,
    LoadStatements,
};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

pub use executor::{
    ConnectTarget, CredentialDecryptor, DryRunExecutor, LoadError, LoadExecutor, LoadSession,
    ReferenceDecryptor,
};
pub use statement::{copy_statement, normalize_entry, path_list};

/// Result of loading a batch into a single destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationResult {
    pub label: String,
    pub status: DestinationStatus,
    pub statements: LoadStatements,
}

impl DestinationResult {
    fn failed(label: String, error: String, statements: LoadStatements) -> Self {
        Self {
            label,
            status: DestinationStatus {
                ok: false,
                error: Some(error),
            },
            statements,
        }
    }
}

/// Fans a locked batch out to every configured destination.
#[derive(Clone)]
pub struct LoadDispatcher {
    executor: Arc<dyn LoadExecutor>,
    decryptor: Arc<dyn CredentialDecryptor>,
}

impl LoadDispatcher {
    pub fn new(executor: Arc<dyn LoadExecutor>, decryptor: Arc<dyn CredentialDecryptor>) -> Self {
        Self {
            executor,
            decryptor,
        }
    }

    /// Load `entries` into every destination concurrently and wait for all of
    /// them. One destination failing never cancels another.
    pub async fn dispatch(
        &self,
        config: &LoadConfiguration,
        batch_id: &str,
        entries: &BTreeSet<String>,
    ) -> BatchOutcome {
        let paths = path_list(&config.mount_dir, entries);

        let loads = config
            .destinations
            .iter()
            .map(|destination| self.load_destination(config, destination, batch_id, &paths));
        let results = join_all(loads).await;

        let mut outcome = BatchOutcome::default();
        for result in results {
            outcome
                .destination_status
                .insert(result.label.clone(), result.status);
            outcome
                .destination_statements
                .insert(result.label, result.statements);
        }
        outcome
    }

    async fn load_destination(
        &self,
        config: &LoadConfiguration,
        destination: &Destination,
        batch_id: &str,
        paths: &str,
    ) -> DestinationResult {
        let label = destination.label();
        let mut statements = LoadStatements::default();

        let password = match self.decryptor.decrypt(&destination.credentials_ref).await {
            Ok(password) => password,
            Err(e) => {
                warn!(destination = %label, batch_id = %batch_id, error = %e, "Credential decryption failed");
                return DestinationResult::failed(label, "decryption failure".to_string(), statements);
            }
        };

        let target = ConnectTarget {
            host: destination.endpoint.clone(),
            port: destination.port,
            user: destination.user.clone(),
            password,
        };
        let mut session = match self.executor.connect(&target).await {
            Ok(session) => session,
            Err(e) => {
                warn!(destination = %label, batch_id = %batch_id, error = %e, "Connect failed");
                return DestinationResult::failed(label, e.to_string(), statements);
            }
        };

        if let Some(pre_load) = destination.pre_load_statement.as_deref() {
            let result = session.execute(pre_load).await;
            if let Err(e) = &result {
                // Advisory only.
                warn!(destination = %label, batch_id = %batch_id, error = %e, "Pre-load statement failed");
            }
            statements.pre_load = Some(executed(pre_load, &result));
        }

        let load = copy_statement(config, destination, paths);
        let result = session.execute(&load).await;
        statements.load = Some(executed(&load, &result));
        if let Err(e) = result {
            warn!(destination = %label, batch_id = %batch_id, error = %e, "Load statement failed");
            return DestinationResult::failed(label, e.to_string(), statements);
        }

        if let Some(post_load) = destination.post_load_statement.as_deref() {
            let result = session.execute(post_load).await;
            statements.post_load = Some(executed(post_load, &result));
            if let Err(e) = result {
                warn!(destination = %label, batch_id = %batch_id, error = %e, "Post-load statement failed");
                return DestinationResult::failed(label, e.to_string(), statements);
            }
        }

        info!(destination = %label, batch_id = %batch_id, "Destination loaded");
        DestinationResult {
            label,
            status: DestinationStatus {
                ok: true,
                error: None,
            },
            statements,
        }
    }
}

fn executed(text: &str, result: &Result<(), LoadError>) -> ExecutedStatement {
    ExecutedStatement {
        text: text.to_string(),
        succeeded: result.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails any statement containing one of the configured needles.
    struct ScriptedExecutor {
        fail_on: Vec<String>,
        refuse_hosts: Vec<String>,
        log: Arc<Mutex<Vec<(String, String)>>>,
    }

    struct ScriptedSession {
        host: String,
        fail_on: Vec<String>,
        log: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl LoadExecutor for ScriptedExecutor {
        async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn LoadSession>, LoadError> {
            if self.refuse_hosts.contains(&target.host) {
                return Err(LoadError::Connect {
                    endpoint: target.host.clone(),
                    message: "refused".to_string(),
                });
            }
            Ok(Box::new(ScriptedSession {
                host: target.host.clone(),
                fail_on: self.fail_on.clone(),
                log: self.log.clone(),
            }))
        }
    }

    #[async_trait]
    impl LoadSession for ScriptedSession {
        async fn execute(&mut self, statement: &str) -> Result<(), LoadError> {
            self.log
                .lock()
                .unwrap()
                .push((self.host.clone(), statement.to_string()));
            if self.fail_on.iter().any(|needle| statement.contains(needle.as_str())) {
                return Err(LoadError::Statement(format!("rejected: {}", statement)));
            }
            Ok(())
        }
    }

    struct FailingDecryptor;

    #[async_trait]
    impl CredentialDecryptor for FailingDecryptor {
        async fn decrypt(&self, _credentials_ref: &str) -> Result<String, LoadError> {
            Err(LoadError::Decryption("key revoked".to_string()))
        }
    }

    fn destination(endpoint: &str, table: &str) -> Destination {
        Destination {
            endpoint: endpoint.to_string(),
            port: 5433,
            user: "loader".to_string(),
            credentials_ref: "secret".to_string(),
            target_table: table.to_string(),
            pre_load_statement: None,
            post_load_statement: None,
        }
    }

    fn config(destinations: Vec<Destination>) -> LoadConfiguration {
        LoadConfiguration {
            prefix: "bucket/in".to_string(),
            current_batch_id: "b-1".to_string(),
            schema_version: 2,
            destinations,
            cluster: None,
            filename_filter: None,
            batch_max_entries: 2,
            batch_max_age_seconds: None,
            mount_dir: "/mnt/s3/".to_string(),
            copy_options: None,
            on_success: None,
            on_failure: None,
            last_batch_rotation: None,
        }
    }

    fn entries() -> BTreeSet<String> {
        ["bucket/in/a.csv", "bucket/in/b.csv"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn dispatcher(
        fail_on: &[&str],
        refuse_hosts: &[&str],
    ) -> (LoadDispatcher, Arc<Mutex<Vec<(String, String)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = ScriptedExecutor {
            fail_on: fail_on.iter().map(|s| s.to_string()).collect(),
            refuse_hosts: refuse_hosts.iter().map(|s| s.to_string()).collect(),
            log: log.clone(),
        };
        (
            LoadDispatcher::new(Arc::new(executor), Arc::new(ReferenceDecryptor)),
            log,
        )
    }

    #[tokio::test]
    async fn test_all_destinations_ok() {
        let (dispatcher, log) = dispatcher(&[], &[]);
        let config = config(vec![destination("a", "t1"), destination("b", "t2")]);

        let outcome = dispatcher.dispatch(&config, "b-1", &entries()).await;
        assert!(outcome.all_ok());
        assert_eq!(outcome.destination_status.len(), 2);
        assert_eq!(log.lock().unwrap().len(), 2);

        let statements = &outcome.destination_statements["a:5433/t1"];
        assert_eq!(
            statements.load.as_ref().unwrap().text,
            "COPY t1 FROM '/mnt/s3/bucket/in/a.csv', '/mnt/s3/bucket/in/b.csv'"
        );
    }

    #[tokio::test]
    async fn test_one_failing_load_does_not_stop_the_other() {
        let (dispatcher, _log) = dispatcher(&["COPY t2"], &[]);
        let config = config(vec![destination("a", "t1"), destination("b", "t2")]);

        let outcome = dispatcher.dispatch(&config, "b-1", &entries()).await;
        assert!(!outcome.all_ok());
        assert!(outcome.destination_status["a:5433/t1"].ok);
        assert!(!outcome.destination_status["b:5433/t2"].ok);
        let failed = outcome.destination_statements["b:5433/t2"].load.as_ref().unwrap();
        assert!(!failed.succeeded);
        assert!(outcome.destination_statements["a:5433/t1"].load.as_ref().unwrap().succeeded);
    }

    #[tokio::test]
    async fn test_pre_load_failure_is_advisory() {
        let (dispatcher, log) = dispatcher(&["TRUNCATE"], &[]);
        let mut dest = destination("a", "t1");
        dest.pre_load_statement = Some("TRUNCATE staging".to_string());
        let config = config(vec![dest]);

        let outcome = dispatcher.dispatch(&config, "b-1", &entries()).await;
        assert!(outcome.all_ok());
        let statements = &outcome.destination_statements["a:5433/t1"];
        assert!(!statements.pre_load.as_ref().unwrap().succeeded);
        assert!(statements.load.as_ref().unwrap().succeeded);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_post_load_failure_fails_destination() {
        let (dispatcher, _log) = dispatcher(&["ANALYZE"], &[]);
        let mut dest = destination("a", "t1");
        dest.post_load_statement = Some("ANALYZE t1".to_string());
        let config = config(vec![dest]);

        let outcome = dispatcher.dispatch(&config, "b-1", &entries()).await;
        assert!(!outcome.all_ok());
        let statements = &outcome.destination_statements["a:5433/t1"];
        assert!(statements.load.as_ref().unwrap().succeeded);
        assert!(!statements.post_load.as_ref().unwrap().succeeded);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_destination() {
        let (dispatcher, _log) = dispatcher(&[], &["b"]);
        let config = config(vec![destination("a", "t1"), destination("b", "t2")]);

        let outcome = dispatcher.dispatch(&config, "b-1", &entries()).await;
        assert!(outcome.destination_status["a:5433/t1"].ok);
        let status = &outcome.destination_status["b:5433/t2"];
        assert!(!status.ok);
        assert!(status.error.as_ref().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_decryption_failure_reports_decryption_failure() {
        let executor = ScriptedExecutor {
            fail_on: vec![],
            refuse_hosts: vec![],
            log: Arc::new(Mutex::new(Vec::new())),
        };
        let dispatcher = LoadDispatcher::new(Arc::new(executor), Arc::new(FailingDecryptor));
        let config = config(vec![destination("a", "t1")]);

        let outcome = dispatcher.dispatch(&config, "b-1", &entries()).await;
        let status = &outcome.destination_status["a:5433/t1"];
        assert!(!status.ok);
        assert_eq!(status.error.as_deref(), Some("decryption failure"));
        assert_eq!(outcome.destination_statements["a:5433/t1"], LoadStatements::default());
    }
}
