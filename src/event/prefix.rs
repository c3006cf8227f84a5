use regex::Regex;
use std::sync::OnceLock;

/// One or more consecutive `=<digits>` runs, as produced by partition-style
/// folder names such as `year=2015`.
fn partition_value_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(=\d+)+").ok()).as_ref()
}

/// Derive the configuration lookup key for an object.
///
/// The file name is removed from `key`, partition values are collapsed to
/// `=*` until none remain, and the result is joined to the bucket name. An
/// object at the bucket root maps to the bare bucket name.
pub fn derive_prefix(bucket: &str, key: &str) -> String {
    let folder = match key.rfind('/') {
        Some(idx) => &key[..idx],
        None => "",
    };
    let folder = folder.trim_end_matches('/');
    if folder.is_empty() {
        return bucket.to_string();
    }

    let mut folder = folder.to_string();
    if let Some(pattern) = partition_value_pattern() {
        while pattern.is_match(&folder) {
            folder = pattern.replace(&folder, "=*").into_owned();
        }
    }

    format!("{}/{}", bucket, folder)
}

/// Normalize a prefix typed by an operator: drop any `s3://` scheme and
/// trailing slashes.
pub fn normalize_configured_prefix(raw: &str) -> String {
    let stripped = raw.trim().replace("s3://", "");
    let trimmed = stripped.trim_end_matches('/');
    trimmed.to_string()
}
