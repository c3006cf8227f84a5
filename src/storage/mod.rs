pub mod duckdb;
pub mod memory;
pub mod records;
pub mod traits;

pub use records::{
    BatchKey, BatchOutcome, BatchRecord, BatchStatus, DedupRecord, Destination,
    DestinationStatus, ExecutedStatement, LoadConfiguration, LoadStatements,
    CURRENT_SCHEMA_VERSION,
};
pub use traits::{
    BatchMutation, BatchPrecondition, BatchStore, ConfigStore, DedupStore, Registration,
    StorageError, Transition,
};
