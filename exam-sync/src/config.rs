//! Configuration for the exam sync engine
//!
//! Loaded from an optional file plus `EXAM_SYNC__*` environment variables
//! (e.g. `EXAM_SYNC__SYNC__SERVER_URL`). Durations are expressed in
//! milliseconds.

use crate::error::{SyncError, SyncResult};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// Deserialize Duration from milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExamSyncConfig {
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub connectivity: ConnectivityConfig,
}

/// Durable store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite file
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Total bytes the queue may occupy before media snapshots are evicted
    pub max_storage_bytes: u64,
    /// Records older than this are reported as stale (never deleted)
    #[serde(with = "duration_ms")]
    pub max_record_age: Duration,
    /// How long a writer waits on a locked database
    #[serde(with = "duration_ms")]
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "exam_sync_queue.db".to_string(),
            max_connections: 4,
            enable_wal: true,
            max_storage_bytes: 512 * 1024 * 1024,
            max_record_age: Duration::from_secs(6 * 60 * 60),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Delivery and retry configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Exam backend base URL
    pub server_url: String,
    /// Bearer token for the exam backend
    pub auth_token: Option<SecretString>,
    /// Upper bound for a single submission
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Coarse drain timer while the backend is reachable
    #[serde(with = "duration_ms")]
    pub drain_interval: Duration,
    /// Backoff base delay
    #[serde(with = "duration_ms")]
    pub base_backoff: Duration,
    /// Exponent cap: delay stops growing after this many attempts
    pub max_backoff_exponent: u32,
    /// Fraction of the delay added as per-record jitter (0.0..=1.0)
    pub jitter_ratio: f64,
    /// Attempts after which a record is dead-lettered
    pub max_attempts: u32,
    /// Pause between accelerated rounds during a final flush
    #[serde(with = "duration_ms")]
    pub flush_retry_interval: Duration,
    /// How long a video chunk waits for a missing earlier index before the
    /// gap is skipped
    #[serde(with = "duration_ms")]
    pub chunk_gap_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080/api/v1".to_string(),
            auth_token: None,
            request_timeout: Duration::from_secs(15),
            drain_interval: Duration::from_secs(5),
            base_backoff: Duration::from_millis(500),
            max_backoff_exponent: 6,
            jitter_ratio: 0.25,
            max_attempts: 12,
            flush_retry_interval: Duration::from_millis(250),
            chunk_gap_grace: Duration::from_secs(30),
        }
    }
}

// SecretString is deliberately not Clone; copy the exposed value explicitly.
impl Clone for SyncConfig {
    fn clone(&self) -> Self {
        Self {
            server_url: self.server_url.clone(),
            auth_token: self
                .auth_token
                .as_ref()
                .map(|token| SecretString::new(token.expose_secret().clone())),
            request_timeout: self.request_timeout,
            drain_interval: self.drain_interval,
            base_backoff: self.base_backoff,
            max_backoff_exponent: self.max_backoff_exponent,
            jitter_ratio: self.jitter_ratio,
            max_attempts: self.max_attempts,
            flush_retry_interval: self.flush_retry_interval,
            chunk_gap_grace: self.chunk_gap_grace,
        }
    }
}

/// Backend liveness probing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Path appended to `sync.server_url` for the liveness probe
    pub probe_path: String,
    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    /// Consecutive successful probes before the backend counts as available
    pub required_successes: u32,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_path: "/health".to_string(),
            probe_interval: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
            required_successes: 2,
        }
    }
}

impl ExamSyncConfig {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("EXAM_SYNC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;

        tracing::debug!(
            db_path = %loaded.store.db_path,
            server_url = %loaded.sync.server_url,
            has_token = loaded.sync.auth_token.is_some(),
            "Loaded exam sync configuration"
        );

        Ok(loaded)
    }

    /// Reject values that would make the engine spin or never deliver.
    pub fn validate(&self) -> SyncResult<()> {
        if self.store.db_path.trim().is_empty() {
            return Err(SyncError::Config("store.db_path must not be empty".to_string()));
        }
        if self.store.max_connections == 0 {
            return Err(SyncError::Config("store.max_connections must be at least 1".to_string()));
        }
        if self.sync.server_url.trim().is_empty() {
            return Err(SyncError::Config("sync.server_url must not be empty".to_string()));
        }
        if self.sync.max_attempts == 0 {
            return Err(SyncError::Config("sync.max_attempts must be at least 1".to_string()));
        }
        if self.sync.request_timeout.is_zero() || self.sync.drain_interval.is_zero() {
            return Err(SyncError::Config(
                "sync.request_timeout and sync.drain_interval must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sync.jitter_ratio) {
            return Err(SyncError::Config(format!(
                "sync.jitter_ratio must be within 0.0..=1.0, got {}",
                self.sync.jitter_ratio
            )));
        }
        if self.connectivity.required_successes == 0 {
            return Err(SyncError::Config(
                "connectivity.required_successes must be at least 1".to_string(),
            ));
        }
        if self.connectivity.probe_timeout.is_zero() || self.connectivity.probe_interval.is_zero() {
            return Err(SyncError::Config(
                "connectivity probe interval and timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
