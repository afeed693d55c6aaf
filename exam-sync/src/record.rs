//! Queued record model
//!
//! Every item captured during an exam lands in one of four independent
//! collections. Records carry a store-assigned `local_id`, the local capture
//! time, a collection-specific payload and the delivery bookkeeping the sync
//! engine mutates (`sync_state`, `attempts`, `next_attempt_at`).

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Named record collection in the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Violations,
    Answers,
    Media,
    VideoChunks,
}

impl Collection {
    /// Drain priority: small integrity-critical records first, bulky media last.
    pub const DRAIN_ORDER: [Collection; 4] = [
        Collection::Violations,
        Collection::Answers,
        Collection::Media,
        Collection::VideoChunks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Violations => "violations",
            Collection::Answers => "answers",
            Collection::Media => "media",
            Collection::VideoChunks => "video_chunks",
        }
    }

    /// Backing table name. Table names are never taken from user input.
    pub(crate) fn table(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "violations" => Ok(Collection::Violations),
            "answers" => Ok(Collection::Answers),
            "media" => Ok(Collection::Media),
            "video_chunks" | "video-chunks" => Ok(Collection::VideoChunks),
            _ => Err(SyncError::InvalidOperation(format!("Unknown collection: {}", s))),
        }
    }
}

/// Delivery state of a queued record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    InFlight,
    /// Transient: delivered records are deleted, never persisted in this state.
    Delivered,
    /// Retained but excluded from automatic retry.
    DeadLettered,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::InFlight => "in_flight",
            SyncState::Delivered => "delivered",
            SyncState::DeadLettered => "dead_lettered",
        }
    }
}

impl FromStr for SyncState {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "in_flight" => Ok(SyncState::InFlight),
            "delivered" => Ok(SyncState::Delivered),
            "dead_lettered" => Ok(SyncState::DeadLettered),
            _ => Err(SyncError::InvalidOperation(format!("Unknown sync state: {}", s))),
        }
    }
}

/// Proctoring violation kinds reported by the exam client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TabBlur,
    FullscreenExit,
    WebcamLost,
    ScreenShareLost,
    NetworkDrop,
    MultipleFaces,
    NoFaceDetected,
    CopyPaste,
    /// Video recording was suspended because local storage ran out.
    RecordingDegraded,
    /// Media snapshots were evicted to stay within the storage budget.
    StorageEviction,
    Custom(String),
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::TabBlur => f.write_str("tab_blur"),
            ViolationKind::FullscreenExit => f.write_str("fullscreen_exit"),
            ViolationKind::WebcamLost => f.write_str("webcam_lost"),
            ViolationKind::ScreenShareLost => f.write_str("screen_share_lost"),
            ViolationKind::NetworkDrop => f.write_str("network_drop"),
            ViolationKind::MultipleFaces => f.write_str("multiple_faces"),
            ViolationKind::NoFaceDetected => f.write_str("no_face_detected"),
            ViolationKind::CopyPaste => f.write_str("copy_paste"),
            ViolationKind::RecordingDegraded => f.write_str("recording_degraded"),
            ViolationKind::StorageEviction => f.write_str("storage_eviction"),
            ViolationKind::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// Where a media snapshot or video chunk was captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    Camera,
    Screen,
}

/// Metadata attached to captured media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMeta {
    pub content_type: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl MediaMeta {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            width: None,
            height: None,
            duration_ms: None,
            extra: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub session_id: Uuid,
    pub exam_id: String,
    pub question_id: String,
    pub value: serde_json::Value,
    pub time_taken_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationPayload {
    pub session_id: Uuid,
    pub exam_id: String,
    pub kind: ViolationKind,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub session_id: Uuid,
    pub exam_id: String,
    pub source: CaptureSource,
    pub meta: MediaMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoChunkPayload {
    pub session_id: Uuid,
    pub exam_id: String,
    pub recording_session_id: Uuid,
    pub chunk_index: u64,
    pub source: CaptureSource,
    pub meta: MediaMeta,
}

/// Collection-specific record content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordPayload {
    Answer(AnswerPayload),
    Violation(ViolationPayload),
    Media(MediaPayload),
    VideoChunk(VideoChunkPayload),
}

impl RecordPayload {
    /// The collection this payload belongs to
    pub fn collection(&self) -> Collection {
        match self {
            RecordPayload::Answer(_) => Collection::Answers,
            RecordPayload::Violation(_) => Collection::Violations,
            RecordPayload::Media(_) => Collection::Media,
            RecordPayload::VideoChunk(_) => Collection::VideoChunks,
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            RecordPayload::Answer(p) => p.session_id,
            RecordPayload::Violation(p) => p.session_id,
            RecordPayload::Media(p) => p.session_id,
            RecordPayload::VideoChunk(p) => p.session_id,
        }
    }

    /// Grouping column stored next to the payload: `exam/question` for
    /// answers, the recording session for video chunks.
    pub(crate) fn group_key(&self) -> Option<String> {
        match self {
            RecordPayload::Answer(p) => Some(format!("{}/{}", p.exam_id, p.question_id)),
            RecordPayload::VideoChunk(p) => Some(p.recording_session_id.to_string()),
            RecordPayload::Violation(_) | RecordPayload::Media(_) => None,
        }
    }

    /// Sequence column within the group (chunk index for video).
    pub(crate) fn sequence(&self) -> Option<i64> {
        match self {
            RecordPayload::VideoChunk(p) => i64::try_from(p.chunk_index).ok(),
            _ => None,
        }
    }
}

/// A record about to be appended to the store
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub payload: RecordPayload,
    pub blob: Option<Vec<u8>>,
    pub saved_at: DateTime<Utc>,
}

impl NewRecord {
    pub fn new(payload: RecordPayload) -> Self {
        Self {
            payload,
            blob: None,
            saved_at: Utc::now(),
        }
    }

    pub fn with_blob(mut self, blob: Vec<u8>) -> Self {
        self.blob = Some(blob);
        self
    }

    pub fn collection(&self) -> Collection {
        self.payload.collection()
    }
}

/// Stored record as returned by the durable store
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub local_id: i64,
    pub collection: Collection,
    pub saved_at: DateTime<Utc>,
    pub payload: RecordPayload,
    pub blob: Option<Vec<u8>>,
    pub sync_state: SyncState,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub size_bytes: u64,
}

impl Record {
    /// Whether the normal drain may attempt this record at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.sync_state == SyncState::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// `(recording_session_id, chunk_index)` for video chunks.
    pub fn chunk_position(&self) -> Option<(Uuid, u64)> {
        match &self.payload {
            RecordPayload::VideoChunk(p) => Some((p.recording_session_id, p.chunk_index)),
            _ => None,
        }
    }
}

/// Stable idempotency key for a record: `{node_id}:{collection}:{local_id}`.
///
/// `local_id` is never reused within a store and `node_id` is persisted with
/// the store, so the key names exactly one logical record.
pub fn idempotency_key(node_id: Uuid, collection: Collection, local_id: i64) -> String {
    format!("{}:{}:{}", node_id, collection, local_id)
}
