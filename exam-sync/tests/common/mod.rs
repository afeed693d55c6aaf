//! Shared fixtures for exam-sync integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use exam_sync::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// How the mock backend answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Accept,
    /// Every submission fails with a transient error
    Fail,
    /// Submissions never complete
    Hang,
    /// The record is stored server-side but the acknowledgment never arrives
    LoseAcks,
}

/// Server-side entry held by the mock backend
#[derive(Debug, Clone)]
pub struct Entry {
    pub collection: Collection,
    pub key: String,
    pub local_id: i64,
    pub payload: RecordPayload,
}

/// In-process backend that deduplicates by idempotency key
pub struct MockBackend {
    mode: Mutex<Mode>,
    entries: Mutex<Vec<Entry>>,
    keys: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<(Collection, i64)>>,
    submissions: AtomicU64,
}

impl MockBackend {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            entries: Mutex::new(Vec::new()),
            keys: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            submissions: AtomicU64::new(0),
        })
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Fail submissions of one record regardless of mode.
    pub fn fail(&self, collection: Collection, local_id: i64) {
        self.failing.lock().unwrap().insert((collection, local_id));
    }

    pub fn heal(&self, collection: Collection, local_id: i64) {
        self.failing.lock().unwrap().remove(&(collection, local_id));
    }

    /// Distinct server-side entries in arrival order
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn collections_in_order(&self) -> Vec<Collection> {
        self.entries().iter().map(|e| e.collection).collect()
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    fn store_entry(&self, collection: Collection, record: &OutboundRecord) -> bool {
        let fresh = self.keys.lock().unwrap().insert(record.idempotency_key.clone());
        if fresh {
            self.entries.lock().unwrap().push(Entry {
                collection,
                key: record.idempotency_key.clone(),
                local_id: record.local_id,
                payload: record.payload.clone(),
            });
        }
        fresh
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn deliver(&self, collection: Collection, record: &OutboundRecord) -> SyncResult<DeliveryAck> {
        self.submissions.fetch_add(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&(collection, record.local_id)) {
            return Err(SyncError::Delivery("503 Service Unavailable".to_string()));
        }

        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Fail => Err(SyncError::Delivery("503 Service Unavailable".to_string())),
            Mode::Hang => std::future::pending().await,
            Mode::LoseAcks => {
                self.store_entry(collection, record);
                std::future::pending().await
            }
            Mode::Accept => {
                if self.store_entry(collection, record) {
                    Ok(DeliveryAck::accepted(format!("srv-{}", record.idempotency_key)))
                } else {
                    Ok(DeliveryAck::duplicate())
                }
            }
        }
    }
}

/// Probe whose answer the test controls
pub struct SwitchProbe {
    up: AtomicBool,
}

impl SwitchProbe {
    pub fn new(up: bool) -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(up),
        })
    }

    pub fn set(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl Probe for SwitchProbe {
    async fn check(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

/// Fast timings so tests finish quickly
pub fn test_config(dir: &TempDir) -> ExamSyncConfig {
    let mut config = ExamSyncConfig::default();
    config.store.db_path = dir.path().join("exam_queue.db").to_string_lossy().to_string();
    config.sync.request_timeout = Duration::from_millis(200);
    config.sync.drain_interval = Duration::from_millis(50);
    config.sync.base_backoff = Duration::from_millis(5);
    config.sync.jitter_ratio = 0.2;
    config.sync.flush_retry_interval = Duration::from_millis(10);
    config.connectivity.probe_interval = Duration::from_millis(20);
    config.connectivity.probe_timeout = Duration::from_millis(50);
    config.connectivity.required_successes = 1;
    config
}

pub async fn open_store(config: &ExamSyncConfig) -> Arc<DurableStore> {
    Arc::new(DurableStore::open(&config.store).await.unwrap())
}

/// Monitor already reporting the backend as available
pub async fn online_monitor(config: &ExamSyncConfig) -> (Arc<ConnectivityMonitor>, Arc<SwitchProbe>) {
    let probe = SwitchProbe::new(true);
    let monitor = Arc::new(ConnectivityMonitor::new(probe.clone(), config.connectivity.clone()));
    monitor.probe_once().await;
    assert!(monitor.is_available());
    (monitor, probe)
}

pub async fn engine(
    config: &ExamSyncConfig,
    store: Arc<DurableStore>,
    backend: Arc<MockBackend>,
) -> SyncEngine {
    let (monitor, _) = online_monitor(config).await;
    SyncEngine::new(store, backend, monitor, config.sync.clone())
}

pub fn answer(question: &str) -> NewRecord {
    NewRecord::new(RecordPayload::Answer(AnswerPayload {
        session_id: Uuid::nil(),
        exam_id: "exam-42".to_string(),
        question_id: question.to_string(),
        value: serde_json::json!({"choice": question}),
        time_taken_ms: 1_000,
    }))
}

pub fn violation(kind: ViolationKind) -> NewRecord {
    NewRecord::new(RecordPayload::Violation(ViolationPayload {
        session_id: Uuid::nil(),
        exam_id: "exam-42".to_string(),
        kind,
        details: serde_json::json!({}),
    }))
}

pub fn snapshot() -> NewRecord {
    NewRecord::new(RecordPayload::Media(MediaPayload {
        session_id: Uuid::nil(),
        exam_id: "exam-42".to_string(),
        source: CaptureSource::Camera,
        meta: MediaMeta::new("image/jpeg"),
    }))
    .with_blob(vec![0xFF; 256])
}

pub fn chunk(recording: Uuid, index: u64) -> NewRecord {
    NewRecord::new(RecordPayload::VideoChunk(VideoChunkPayload {
        session_id: Uuid::nil(),
        exam_id: "exam-42".to_string(),
        recording_session_id: recording,
        chunk_index: index,
        source: CaptureSource::Camera,
        meta: MediaMeta::new("video/webm"),
    }))
    .with_blob(vec![index as u8; 128])
}

/// Delivered chunk indices of one recording, in arrival order
pub fn delivered_chunks(backend: &MockBackend, recording: Uuid) -> Vec<u64> {
    backend
        .entries()
        .iter()
        .filter_map(|e| match &e.payload {
            RecordPayload::VideoChunk(c) if c.recording_session_id == recording => Some(c.chunk_index),
            _ => None,
        })
        .collect()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = tokio::time::Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
