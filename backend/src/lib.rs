pub mod clock;
pub mod dbs;
pub mod history;
pub mod ingest;
pub mod model;
pub mod sync;

pub use dbs::{Storage, StorageConfig, StorageError, StorageOptions, StorageResult};
