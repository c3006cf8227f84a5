use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// DuckDB database file, or `:memory:`.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:7120".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_config_lookup_attempts")]
    pub config_lookup_attempts: usize,
    #[serde(default = "default_config_lookup_backoff", with = "humantime_serde")]
    pub config_lookup_backoff: Duration,
    #[serde(default = "default_append_attempts")]
    pub append_attempts: usize,
    #[serde(default = "default_append_contention_backoff", with = "humantime_serde")]
    pub append_contention_backoff: Duration,
}

fn default_config_lookup_attempts() -> usize {
    10
}

fn default_config_lookup_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_append_attempts() -> usize {
    100
}

fn default_append_contention_backoff() -> Duration {
    Duration::from_millis(20)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            config_lookup_attempts: default_config_lookup_attempts(),
            config_lookup_backoff: default_config_lookup_backoff(),
            append_attempts: default_append_attempts(),
            append_contention_backoff: default_append_contention_backoff(),
        }
    }
}

impl RetryConfig {
    /// Policy for configuration reads hitting a throttled store.
    pub fn config_lookup_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config_lookup_attempts, self.config_lookup_backoff)
    }

    /// Policy for appends racing a rotation. The first retry follows the
    /// reload immediately; later ones back off.
    pub fn append_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.append_attempts, self.append_contention_backoff)
            .with_immediate_retries(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub mode: LoaderMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderMode {
    /// Log statements instead of sending them anywhere.
    #[default]
    DryRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub mode: NotificationMode,
    #[serde(default = "default_notification_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_notification_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            mode: NotificationMode::default(),
            timeout: default_notification_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMode {
    /// Write notifications to the log only.
    #[default]
    Log,
    /// POST notifications as JSON to the target URL.
    Webhook,
}
