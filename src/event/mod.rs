pub mod prefix;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use prefix::{derive_prefix, normalize_configured_prefix};

const SUPPORTED_SOURCE: &str = "aws:s3";
const SUPPORTED_SCHEMA_VERSION: &str = "1.0";
const SUPPORTED_EVENT_NAMES: &[&str] = &[
    "ObjectCreated:Put",
    "ObjectCreated:Copy",
    "ObjectCreated:CompleteMultipartUpload",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("unable to process multi-record events ({0} records)")]
    MultipleRecords(usize),

    #[error("invalid event source {0}")]
    InvalidSource(String),

    #[error("invalid event name {0}")]
    InvalidEventName(String),

    #[error("unknown object notification schema version {0}")]
    UnknownSchemaVersion(String),

    #[error("object key is not valid percent-encoded UTF-8: {0}")]
    InvalidKey(String),

    #[error("object key {0} has no file name")]
    EmptyFileName(String),
}

/// A delivery from the event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "Records", default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<NotificationRecord>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub event_source: String,
    pub event_name: String,
    pub s3: ObjectNotification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectNotification {
    pub s3_schema_version: String,
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
}

/// A newly created file, resolved to the configuration prefix that governs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArrival {
    pub bucket: String,
    /// Decoded object key, relative to the bucket.
    pub key: String,
    pub file_name: String,
    pub prefix: String,
}

impl FileArrival {
    /// Identifier used for dedup and batch entries: `<bucket>/<key>`.
    pub fn file_id(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

impl Notification {
    /// Validate the delivery and extract the single file it announces.
    ///
    /// Returns `Ok(None)` for deliveries that carry no records at all.
    pub fn into_arrival(self) -> Result<Option<FileArrival>, EventError> {
        let Some(mut records) = self.records else {
            return Ok(None);
        };
        match records.len() {
            0 => Ok(None),
            1 => records.pop().map(FileArrival::try_from).transpose(),
            n => Err(EventError::MultipleRecords(n)),
        }
    }
}

impl TryFrom<NotificationRecord> for FileArrival {
    type Error = EventError;

    fn try_from(record: NotificationRecord) -> Result<Self, Self::Error> {
        if record.event_source != SUPPORTED_SOURCE {
            return Err(EventError::InvalidSource(record.event_source));
        }
        if !SUPPORTED_EVENT_NAMES.contains(&record.event_name.as_str()) {
            return Err(EventError::InvalidEventName(record.event_name));
        }
        if record.s3.s3_schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(EventError::UnknownSchemaVersion(record.s3.s3_schema_version));
        }

        let bucket = record.s3.bucket.name;
        let decoded = urlencoding::decode(&record.s3.object.key)
            .map_err(|_| EventError::InvalidKey(record.s3.object.key.clone()))?
            .into_owned();

        // Copy events may carry the bucket name in front of the key.
        let bucket_prefix = format!("{}/", bucket);
        let key = decoded
            .strip_prefix(&bucket_prefix)
            .map(str::to_string)
            .unwrap_or(decoded);

        let file_name = key.rsplit('/').next().unwrap_or_default().to_string();
        if file_name.is_empty() {
            return Err(EventError::EmptyFileName(key));
        }

        let prefix = derive_prefix(&bucket, &key);
        Ok(FileArrival {
            bucket,
            key,
            file_name,
            prefix,
        })
    }
}
