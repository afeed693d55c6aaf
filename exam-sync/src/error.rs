//! Error types for the exam sync engine

use crate::record::Collection;
use thiserror::Error;

/// Local persistence could not complete a write or read.
///
/// Always fatal to the operation that hit it: the Recorder surfaces it to the
/// exam UI immediately because it threatens exam-integrity data.
#[derive(Error, Debug)]
pub enum StorageFailure {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage quota exceeded: record needs {needed} bytes, budget is {limit} bytes")]
    QuotaExceeded { needed: u64, limit: u64 },

    #[error("Corrupt record in {collection}/{local_id}: {reason}")]
    Corrupt {
        collection: Collection,
        local_id: i64,
        reason: String,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageFailure),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Record {collection}/{local_id} dead-lettered after {attempts} attempts")]
    DeadLettered {
        collection: Collection,
        local_id: i64,
        attempts: u32,
    },

    #[error("Ordering violation in {collection}: {detail}")]
    OrderingViolation {
        collection: Collection,
        detail: String,
    },

    #[error("Video recording suspended for exam session {0}")]
    RecordingSuspended(uuid::Uuid),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Whether this is a storage quota failure.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(
            self,
            SyncError::Storage(StorageFailure::QuotaExceeded { .. })
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(StorageFailure::Database(err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Delivery(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
