use super::records::{
    BatchKey, BatchOutcome, BatchRecord, BatchStatus, DedupRecord, Destination, LoadConfiguration,
};
use super::traits::{
    BatchMutation, BatchPrecondition, BatchStore, ConfigStore, DedupStore, Registration,
    StorageError, Transition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::Corrupt(format!("invalid timestamp {}", micros)))
}

/// DuckDB implementation of the config, dedup and batch stores.
///
/// All statements run on one connection behind a mutex, and every conditional
/// write runs inside a transaction, so a read-check-write is atomic for the
/// process owning the database file.
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Open (or create) a database file. `:memory:` opens a private in-memory database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if path.as_os_str() == ":memory:" {
            return Self::in_memory();
        }
        tracing::info!(path = %path.display(), "Opening DuckDB store");
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StorageError::Database("connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    pub async fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS configurations (
                    prefix VARCHAR PRIMARY KEY,
                    current_batch_id VARCHAR NOT NULL,
                    last_batch_rotation BIGINT,
                    schema_version UINTEGER NOT NULL,
                    document VARCHAR NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS processed_files (
                    file_id VARCHAR PRIMARY KEY,
                    registered_at BIGINT NOT NULL,
                    batch_id VARCHAR
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS batches (
                    batch_id VARCHAR NOT NULL,
                    prefix VARCHAR NOT NULL,
                    status VARCHAR,
                    last_update BIGINT NOT NULL,
                    error_message VARCHAR,
                    destination_status VARCHAR,
                    destination_statements VARCHAR,
                    PRIMARY KEY (batch_id, prefix)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS batch_entries (
                    batch_id VARCHAR NOT NULL,
                    prefix VARCHAR NOT NULL,
                    file_id VARCHAR NOT NULL,
                    PRIMARY KEY (batch_id, prefix, file_id)
                )",
                [],
            )?;

            Ok(())
        })
        .await
    }

    pub async fn processed_file(&self, file_id: &str) -> Result<Option<DedupRecord>, StorageError> {
        let file_id = file_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT file_id, registered_at, batch_id FROM processed_files WHERE file_id = ?",
            )?;
            let mut rows = stmt.query(duckdb::params![file_id])?;
            if let Some(row) = rows.next()? {
                Ok(Some(DedupRecord {
                    file_id: row.get(0)?,
                    registered_at: from_micros(row.get(1)?)?,
                    batch_id: row.get(2)?,
                }))
            } else {
                Ok(None)
            }
        })
        .await
    }
}

/// Status column of a batch row: `None` if the row is missing.
fn read_status(conn: &Connection, key: &BatchKey) -> Result<Option<Option<BatchStatus>>, StorageError> {
    let mut stmt = conn.prepare("SELECT status FROM batches WHERE batch_id = ? AND prefix = ?")?;
    let mut rows = stmt.query(duckdb::params![key.batch_id, key.prefix])?;
    match rows.next()? {
        Some(row) => {
            let status: Option<String> = row.get(0)?;
            let status = status
                .map(|s| s.parse::<BatchStatus>().map_err(StorageError::Corrupt))
                .transpose()?;
            Ok(Some(status))
        }
        None => Ok(None),
    }
}

fn read_batch(conn: &Connection, key: &BatchKey) -> Result<Option<BatchRecord>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT status, last_update, error_message, destination_status, destination_statements
         FROM batches WHERE batch_id = ? AND prefix = ?",
    )?;
    let mut rows = stmt.query(duckdb::params![key.batch_id, key.prefix])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let status: Option<String> = row.get(0)?;
    let last_update: i64 = row.get(1)?;
    let error_message: Option<String> = row.get(2)?;
    let destination_status: Option<String> = row.get(3)?;
    let destination_statements: Option<String> = row.get(4)?;

    let mut entries_stmt = conn.prepare(
        "SELECT file_id FROM batch_entries WHERE batch_id = ? AND prefix = ? ORDER BY file_id",
    )?;
    let entries = entries_stmt
        .query_map(duckdb::params![key.batch_id, key.prefix], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<BTreeSet<String>, _>>()?;

    Ok(Some(BatchRecord {
        batch_id: key.batch_id.clone(),
        prefix: key.prefix.clone(),
        status: status
            .map(|s| s.parse::<BatchStatus>().map_err(StorageError::Corrupt))
            .transpose()?,
        entries,
        last_update: from_micros(last_update)?,
        error_message,
        destination_status: destination_status
            .map(|s| serde_json::from_str(&s))
            .transpose()?
            .unwrap_or_default(),
        destination_statements: destination_statements
            .map(|s| serde_json::from_str(&s))
            .transpose()?
            .unwrap_or_default(),
    }))
}

fn read_configuration(
    conn: &Connection,
    prefix: &str,
) -> Result<Option<LoadConfiguration>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT current_batch_id, last_batch_rotation, schema_version, document
         FROM configurations WHERE prefix = ?",
    )?;
    let mut rows = stmt.query(duckdb::params![prefix])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let current_batch_id: String = row.get(0)?;
    let last_batch_rotation: Option<i64> = row.get(1)?;
    let schema_version: u32 = row.get(2)?;
    let document: String = row.get(3)?;

    let mut config: LoadConfiguration = serde_json::from_str(&document)?;
    // The pointer columns are authoritative; the document copy may be stale.
    config.prefix = prefix.to_string();
    config.current_batch_id = current_batch_id;
    config.last_batch_rotation = last_batch_rotation.map(from_micros).transpose()?;
    config.schema_version = schema_version;
    Ok(Some(config))
}

#[async_trait]
impl ConfigStore for DuckDbStore {
    async fn get(&self, prefix: &str) -> Result<Option<LoadConfiguration>, StorageError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| read_configuration(conn, &prefix)).await
    }

    async fn rotate(
        &self,
        prefix: &str,
        new_batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let prefix = prefix.to_string();
        let new_batch_id = new_batch_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE configurations SET current_batch_id = ?, last_batch_rotation = ? WHERE prefix = ?",
                duckdb::params![new_batch_id, to_micros(now), prefix],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("configuration for {}", prefix)));
            }
            Ok(())
        })
        .await
    }

    async fn put(&self, config: &LoadConfiguration) -> Result<(), StorageError> {
        let config = config.clone();
        self.with_conn(move |conn| {
            let document = serde_json::to_string(&config)?;
            conn.execute(
                "INSERT OR REPLACE INTO configurations
                    (prefix, current_batch_id, last_batch_rotation, schema_version, document)
                 VALUES (?, ?, ?, ?, ?)",
                duckdb::params![
                    config.prefix,
                    config.current_batch_id,
                    config.last_batch_rotation.map(to_micros),
                    config.schema_version,
                    document,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn store_upgrade(&self, config: &LoadConfiguration) -> Result<(), StorageError> {
        let config = config.clone();
        self.with_conn(move |conn| {
            let document = serde_json::to_string(&config)?;
            let changed = conn.execute(
                "UPDATE configurations SET schema_version = ?, document = ? WHERE prefix = ?",
                duckdb::params![config.schema_version, document, config.prefix],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!(
                    "configuration for {}",
                    config.prefix
                )));
            }
            Ok(())
        })
        .await
    }

    async fn add_destination(
        &self,
        prefix: &str,
        destination: &Destination,
    ) -> Result<(), StorageError> {
        let prefix = prefix.to_string();
        let destination = destination.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut config = read_configuration(&tx, &prefix)?
                .ok_or_else(|| StorageError::NotFound(format!("configuration for {}", prefix)))?;
            config.destinations.push(destination);
            let document = serde_json::to_string(&config)?;
            tx.execute(
                "UPDATE configurations SET document = ? WHERE prefix = ?",
                duckdb::params![document, prefix],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DedupStore for DuckDbStore {
    async fn register_if_absent(
        &self,
        file_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Registration, StorageError> {
        let file_id = file_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let exists = {
                let mut stmt = tx.prepare("SELECT 1 FROM processed_files WHERE file_id = ?")?;
                let mut rows = stmt.query(duckdb::params![file_id])?;
                rows.next()?.is_some()
            };
            if exists {
                tx.rollback()?;
                return Ok(Registration::AlreadyExists);
            }
            tx.execute(
                "INSERT INTO processed_files (file_id, registered_at) VALUES (?, ?)",
                duckdb::params![file_id, to_micros(now)],
            )?;
            tx.commit()?;
            Ok(Registration::Inserted)
        })
        .await
    }

    async fn annotate(&self, file_id: &str, batch_id: &str) -> Result<(), StorageError> {
        let file_id = file_id.to_string();
        let batch_id = batch_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE processed_files SET batch_id = ? WHERE file_id = ?",
                duckdb::params![batch_id, file_id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("processed file {}", file_id)));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BatchStore for DuckDbStore {
    async fn get(&self, key: &BatchKey) -> Result<Option<BatchRecord>, StorageError> {
        let key = key.clone();
        self.with_conn(move |conn| read_batch(conn, &key)).await
    }

    async fn transition(
        &self,
        key: &BatchKey,
        precondition: BatchPrecondition,
        mutation: BatchMutation,
    ) -> Result<Transition<BatchRecord>, StorageError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let row = read_status(&tx, &key)?;
            let observed = row.flatten();
            if !precondition.admits(observed) {
                tx.rollback()?;
                return Ok(Transition::PreconditionFailed { observed });
            }

            match &mutation {
                BatchMutation::Append { file_id, at } => {
                    if row.is_some() {
                        tx.execute(
                            "UPDATE batches SET status = 'open', last_update = ?
                             WHERE batch_id = ? AND prefix = ?",
                            duckdb::params![to_micros(*at), key.batch_id, key.prefix],
                        )?;
                    } else {
                        tx.execute(
                            "INSERT INTO batches (batch_id, prefix, status, last_update)
                             VALUES (?, ?, 'open', ?)",
                            duckdb::params![key.batch_id, key.prefix, to_micros(*at)],
                        )?;
                    }
                    tx.execute(
                        "INSERT INTO batch_entries (batch_id, prefix, file_id) VALUES (?, ?, ?)
                         ON CONFLICT DO NOTHING",
                        duckdb::params![key.batch_id, key.prefix, file_id],
                    )?;
                }
                BatchMutation::Lock { at } => {
                    tx.execute(
                        "UPDATE batches SET status = 'locked', last_update = ?
                         WHERE batch_id = ? AND prefix = ?",
                        duckdb::params![to_micros(*at), key.batch_id, key.prefix],
                    )?;
                }
            }

            let record = read_batch(&tx, &key)?
                .ok_or_else(|| StorageError::NotFound(format!("batch {}", key)))?;
            tx.commit()?;
            Ok(Transition::Applied(record))
        })
        .await
    }

    async fn record_outcome(
        &self,
        key: &BatchKey,
        outcome: &BatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let key = key.clone();
        let outcome = outcome.clone();
        self.with_conn(move |conn| {
            let status_json = serde_json::to_string(&outcome.destination_status)?;
            let statements_json = serde_json::to_string(&outcome.destination_statements)?;
            let changed = conn.execute(
                "UPDATE batches SET destination_status = ?, destination_statements = ?, last_update = ?
                 WHERE batch_id = ? AND prefix = ?",
                duckdb::params![
                    status_json,
                    statements_json,
                    to_micros(now),
                    key.batch_id,
                    key.prefix
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("batch {}", key)));
            }
            Ok(())
        })
        .await
    }

    async fn close(
        &self,
        key: &BatchKey,
        status: BatchStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let key = key.clone();
        let error_message = error_message.map(str::to_string);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE batches SET status = ?, error_message = ?, last_update = ?
                 WHERE batch_id = ? AND prefix = ?",
                duckdb::params![
                    status.as_str(),
                    error_message,
                    to_micros(now),
                    key.batch_id,
                    key.prefix
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("batch {}", key)));
            }
            Ok(())
        })
        .await
    }

    async fn list_by_status(&self, status: BatchStatus) -> Result<Vec<BatchRecord>, StorageError> {
        self.with_conn(move |conn| {
            let keys = {
                let mut stmt = conn.prepare(
                    "SELECT batch_id, prefix FROM batches WHERE status = ? ORDER BY last_update",
                )?;
                let rows = stmt.query_map(duckdb::params![status.as_str()], |row| {
                    Ok(BatchKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            let mut batches = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(record) = read_batch(conn, &key)? {
                    batches.push(record);
                }
            }
            Ok(batches)
        })
        .await
    }
}
