use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("credential decryption failed: {0}")]
    Decryption(String),

    #[error("connection to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    #[error("statement failed: {0}")]
    Statement(String),
}

/// Connection parameters for one destination.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Transport that runs statements against a destination engine.
#[async_trait]
pub trait LoadExecutor: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn LoadSession>, LoadError>;
}

#[async_trait]
pub trait LoadSession: Send {
    async fn execute(&mut self, statement: &str) -> Result<(), LoadError>;
}

/// Turns a stored credential reference into the plaintext password.
#[async_trait]
pub trait CredentialDecryptor: Send + Sync {
    async fn decrypt(&self, credentials_ref: &str) -> Result<String, LoadError>;
}

/// Executor that only logs what it would run.
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

struct DryRunSession {
    host: String,
    port: u16,
}

#[async_trait]
impl LoadExecutor for DryRunExecutor {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn LoadSession>, LoadError> {
        info!(host = %target.host, port = target.port, user = %target.user, "Dry-run connect");
        Ok(Box::new(DryRunSession {
            host: target.host.clone(),
            port: target.port,
        }))
    }
}

#[async_trait]
impl LoadSession for DryRunSession {
    async fn execute(&mut self, statement: &str) -> Result<(), LoadError> {
        info!(host = %self.host, port = self.port, statement = %statement, "Dry-run execute");
        Ok(())
    }
}

/// Resolves `env:NAME` references from the environment and passes every
/// other value through unchanged.
#[derive(Debug, Default, Clone)]
pub struct ReferenceDecryptor;

#[async_trait]
impl CredentialDecryptor for ReferenceDecryptor {
    async fn decrypt(&self, credentials_ref: &str) -> Result<String, LoadError> {
        match credentials_ref.strip_prefix("env:") {
            Some(name) => std::env::var(name).map_err(|_| {
                LoadError::Decryption(format!("environment variable {} is not set", name))
            }),
            None => Ok(credentials_ref.to_string()),
        }
    }
}
