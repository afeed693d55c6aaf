//! Recorder: turns exam-session events into durable store writes
//!
//! Every call completes its append before returning. Nothing here talks to
//! the network.

use crate::error::{SyncError, SyncResult};
use crate::record::{
    AnswerPayload, CaptureSource, Collection, MediaMeta, MediaPayload, NewRecord, RecordPayload,
    VideoChunkPayload, ViolationKind, ViolationPayload,
};
use crate::session::SessionNotice;
use crate::store::{AppendReceipt, DurableStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct RecorderState {
    closed: bool,
    video_suspended: bool,
    last_chunk: HashMap<Uuid, u64>,
    last_answer_at: HashMap<String, DateTime<Utc>>,
}

pub struct Recorder {
    store: Arc<DurableStore>,
    session_id: Uuid,
    exam_id: String,
    state: Mutex<RecorderState>,
    notices: broadcast::Sender<SessionNotice>,
}

impl Recorder {
    pub fn new(
        store: Arc<DurableStore>,
        exam_id: impl Into<String>,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        Self {
            store,
            session_id: Uuid::new_v4(),
            exam_id: exam_id.into(),
            state: Mutex::new(RecorderState::default()),
            notices,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn exam_id(&self) -> &str {
        &self.exam_id
    }

    /// Record one answer mutation. Edits are kept as separate records.
    pub async fn record_answer(
        &self,
        exam_id: &str,
        question_id: &str,
        value: serde_json::Value,
        time_taken: Duration,
    ) -> SyncResult<i64> {
        if exam_id != self.exam_id {
            return Err(SyncError::InvalidOperation(format!(
                "Answer for exam {} recorded in session for exam {}",
                exam_id, self.exam_id
            )));
        }

        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;

        let record = NewRecord::new(RecordPayload::Answer(AnswerPayload {
            session_id: self.session_id,
            exam_id: exam_id.to_string(),
            question_id: question_id.to_string(),
            value,
            time_taken_ms: u64::try_from(time_taken.as_millis()).unwrap_or(u64::MAX),
        }));

        let group = format!("{}/{}", exam_id, question_id);
        if let Some(previous) = state.last_answer_at.get(&group) {
            if record.saved_at < *previous {
                let violation = SyncError::OrderingViolation {
                    collection: Collection::Answers,
                    detail: format!(
                        "answer edit for {} captured at {} before previous edit at {}",
                        group, record.saved_at, previous
                    ),
                };
                tracing::warn!(error = %violation, "Answer clock went backwards");
            }
        }
        let saved_at = record.saved_at;

        let receipt = self.append(Collection::Answers, record).await?;
        state.last_answer_at.insert(group, saved_at);
        drop(state);

        self.report_evictions(&receipt).await;
        Ok(receipt.local_id)
    }

    /// Record a proctoring violation.
    pub async fn record_violation(
        &self,
        kind: ViolationKind,
        details: serde_json::Value,
    ) -> SyncResult<i64> {
        let state = self.state.lock().await;
        self.ensure_open(&state)?;
        let receipt = self.append_violation(kind, details).await?;
        drop(state);

        self.report_evictions(&receipt).await;
        Ok(receipt.local_id)
    }

    /// Record a camera or screen snapshot.
    pub async fn record_media_snapshot(
        &self,
        source: CaptureSource,
        blob: Vec<u8>,
        meta: MediaMeta,
    ) -> SyncResult<i64> {
        let state = self.state.lock().await;
        self.ensure_open(&state)?;

        let record = NewRecord::new(RecordPayload::Media(MediaPayload {
            session_id: self.session_id,
            exam_id: self.exam_id.clone(),
            source,
            meta,
        }))
        .with_blob(blob);

        let receipt = self.append(Collection::Media, record).await?;
        drop(state);

        self.report_evictions(&receipt).await;
        Ok(receipt.local_id)
    }

    /// Record one fragment of a continuous recording.
    ///
    /// When local storage runs out, video recording is suspended for the
    /// session: a `RecordingDegraded` violation is stored and later chunks
    /// are refused until [`Recorder::resume_video`].
    pub async fn record_video_chunk(
        &self,
        recording_session_id: Uuid,
        chunk_index: u64,
        source: CaptureSource,
        blob: Vec<u8>,
        meta: MediaMeta,
    ) -> SyncResult<i64> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;

        if state.video_suspended {
            return Err(SyncError::RecordingSuspended(self.session_id));
        }

        if let Some(previous) = state.last_chunk.get(&recording_session_id) {
            if chunk_index <= *previous {
                let violation = SyncError::OrderingViolation {
                    collection: Collection::VideoChunks,
                    detail: format!(
                        "recording {} chunk {} captured after chunk {}",
                        recording_session_id, chunk_index, previous
                    ),
                };
                tracing::warn!(error = %violation, "Video chunk out of order");
            }
        }

        let record = NewRecord::new(RecordPayload::VideoChunk(VideoChunkPayload {
            session_id: self.session_id,
            exam_id: self.exam_id.clone(),
            recording_session_id,
            chunk_index,
            source,
            meta,
        }))
        .with_blob(blob);

        match self.append(Collection::VideoChunks, record).await {
            Ok(receipt) => {
                let last = state.last_chunk.entry(recording_session_id).or_insert(chunk_index);
                *last = (*last).max(chunk_index);
                drop(state);
                self.report_evictions(&receipt).await;
                Ok(receipt.local_id)
            }
            Err(e) if e.is_quota_exceeded() => {
                state.video_suspended = true;
                drop(state);

                tracing::error!(
                    session_id = %self.session_id,
                    recording_session_id = %recording_session_id,
                    chunk_index,
                    "Local storage exhausted, suspending video recording"
                );

                let details = serde_json::json!({
                    "recording_session_id": recording_session_id,
                    "chunk_index": chunk_index,
                    "reason": e.to_string(),
                });
                if let Err(degraded) = self
                    .append_violation(ViolationKind::RecordingDegraded, details)
                    .await
                {
                    tracing::error!(error = %degraded, "Failed to record degraded recording");
                }

                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-enable video recording after a storage suspension.
    pub async fn resume_video(&self) {
        let mut state = self.state.lock().await;
        if state.video_suspended {
            state.video_suspended = false;
            tracing::info!(session_id = %self.session_id, "Video recording resumed");
        }
    }

    pub async fn is_video_suspended(&self) -> bool {
        self.state.lock().await.video_suspended
    }

    /// Refuse further writes. Waits for an append in progress to finish.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    fn ensure_open(&self, state: &RecorderState) -> SyncResult<()> {
        if state.closed {
            return Err(SyncError::InvalidOperation(format!(
                "Exam session {} has been submitted",
                self.session_id
            )));
        }
        Ok(())
    }

    async fn append_violation(
        &self,
        kind: ViolationKind,
        details: serde_json::Value,
    ) -> SyncResult<AppendReceipt> {
        let record = NewRecord::new(RecordPayload::Violation(ViolationPayload {
            session_id: self.session_id,
            exam_id: self.exam_id.clone(),
            kind,
            details,
        }));
        self.append(Collection::Violations, record).await
    }

    async fn append(&self, collection: Collection, record: NewRecord) -> SyncResult<AppendReceipt> {
        match self.store.append(collection, record).await {
            Ok(receipt) => Ok(receipt),
            Err(e @ SyncError::Storage(_)) => {
                tracing::error!(
                    collection = %collection,
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to store exam record"
                );
                let _ = self.notices.send(SessionNotice::StorageFailure {
                    collection,
                    error: e.to_string(),
                });
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Tell the backend that media snapshots were dropped locally.
    async fn report_evictions(&self, receipt: &AppendReceipt) {
        if receipt.evicted_media.is_empty() {
            return;
        }

        let details = serde_json::json!({
            "evicted_media": receipt.evicted_media,
            "count": receipt.evicted_media.len(),
        });

        match self.append_violation(ViolationKind::StorageEviction, details).await {
            Ok(eviction) if !eviction.evicted_media.is_empty() => {
                tracing::warn!(
                    count = eviction.evicted_media.len(),
                    "Recording the eviction evicted further snapshots"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "Failed to record storage eviction");
            }
        }
    }
}
