pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# BATCHLOAD CONFIGURATION
# =============================================================================
# Service settings for the batch loader. Per-prefix load configurations
# (destinations, batch thresholds, filters) live in the state store and are
# written with `batchload setup <records.yml>`.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/batchload/config.yml
#   3. /etc/batchload/config.yml

# -----------------------------------------------------------------------------
# STORAGE
# -----------------------------------------------------------------------------
# DuckDB file holding configurations, processed-file markers and batches.
# Use ':memory:' for a throwaway store.
storage:
  path: ~/.local/share/batchload/state.duckdb

# -----------------------------------------------------------------------------
# EVENT INTAKE
# -----------------------------------------------------------------------------
server:
  listen: 127.0.0.1:7120

# -----------------------------------------------------------------------------
# RETRIES
# -----------------------------------------------------------------------------
retry:
  # Configuration reads retried while the store reports throttling
  config_lookup_attempts: 10
  # Maximum random delay between configuration read attempts
  config_lookup_backoff: 1s
  # Attempts to add a file to the open batch while rotations race it
  append_attempts: 100
  # Maximum random delay after the second consecutive locked batch
  append_contention_backoff: 20ms

# -----------------------------------------------------------------------------
# LOADER
# -----------------------------------------------------------------------------
loader:
  # dry_run: log every statement instead of executing it
  mode: dry_run

# -----------------------------------------------------------------------------
# NOTIFICATIONS
# -----------------------------------------------------------------------------
notifications:
  # log: write notifications to the log
  # webhook: POST {subject, message} JSON to the prefix's onSuccess/onFailure URL
  mode: log
  timeout: 10s
"#
    .to_string()
}
