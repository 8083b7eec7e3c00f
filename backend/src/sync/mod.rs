//! Replication of the local store with a remote sync server.

mod client;
mod scheduler;

pub use client::SyncClient;
pub use scheduler::SyncHandle;

use crate::dbs::{MergeReport, StorageError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync is not configured")]
    Disabled,
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server answered {status}: {message}")]
    Server { status: u16, message: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Whether the server could not be reached at all.
    pub fn is_transport(&self) -> bool {
        match self {
            SyncError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No complete sync settings
    Disabled,
    HealthChecking,
    Idle,
    Unreachable,
    Syncing,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncOutcome {
    Completed(MergeReport),
    /// Another pass was already running
    Skipped,
    Disabled,
}

#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub request_timeout: Duration,
    pub health_timeout: Duration,
    pub interval: Duration,
    pub max_backoff: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
        }
    }
}
