use crate::storage::LoadConfiguration;
use chrono::{DateTime, Utc};

/// Decide whether a batch is ready to load.
///
/// Fires when the batch holds at least `batch_max_entries` files, or when a
/// maximum age is configured, the batch is non-empty, and it has not been
/// touched for strictly longer than that age.
pub fn should_flush(
    entries: usize,
    last_update: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &LoadConfiguration,
) -> bool {
    if entries >= config.batch_max_entries as usize {
        return true;
    }

    match config.batch_max_age_seconds {
        Some(max_age) if entries > 0 => {
            let age = now.signed_duration_since(last_update);
            let max_age_ms = i64::try_from(max_age)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000);
            age.num_milliseconds() > max_age_ms
        }
        _ => false,
    }
}
