//! Offline-resilient exam submission queue
//!
//! Provides:
//! - Durable SQLite store with four independent record collections
//! - Recorder translating exam events into store writes
//! - Connectivity monitor combining OS signal and backend liveness probes
//! - Sync engine with priority draining, idempotent delivery, backoff and
//!   dead-lettering
//! - Deadline-bounded final flush for exam submission

pub mod backend;
pub mod backoff;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod record;
pub mod recorder;
pub mod session;
pub mod store;
pub mod sync_engine;

pub use backend::{Backend, DeliveryAck, HttpBackend, OutboundRecord};
pub use backoff::BackoffPolicy;
pub use config::{ConnectivityConfig, ExamSyncConfig, StoreConfig, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor, Debouncer, HttpProbe, Probe, Transition};
pub use error::{StorageFailure, SyncError, SyncResult};
pub use record::{
    idempotency_key, AnswerPayload, CaptureSource, Collection, MediaMeta, MediaPayload, NewRecord,
    Record, RecordPayload, SyncState, VideoChunkPayload, ViolationKind, ViolationPayload,
};
pub use recorder::Recorder;
pub use session::{ExamSession, SessionNotice, SubmissionOutcome};
pub use store::{AppendReceipt, CollectionStats, DurableStore, StoreStats};
pub use sync_engine::{CollectionReport, DrainReport, FlushReport, SyncEngine, SyncEvent};
