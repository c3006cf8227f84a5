use crate::storage::{Destination, LoadConfiguration};

/// Normalize a batch entry into the object path the destination reads.
///
/// A literal `+` and its encoded form `%2B` name the same character, so both
/// end up as `+`.
pub fn normalize_entry(entry: &str) -> String {
    entry.replace("%2B", "+").replace("%2b", "+")
}

/// Quoted, comma-separated list of mounted file paths for a batch.
pub fn path_list<'a, I>(mount_dir: &str, entries: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    entries
        .into_iter()
        .map(|entry| format!("'{}{}'", mount_dir, normalize_entry(entry).replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Bulk-load statement for one destination.
pub fn copy_statement(config: &LoadConfiguration, destination: &Destination, paths: &str) -> String {
    let mut statement = format!("COPY {} FROM {}", destination.target_table, paths);
    if let Some(options) = config.copy_options.as_deref().map(str::trim) {
        if !options.is_empty() {
            statement.push(' ');
            statement.push_str(options);
        }
    }
    statement
}
