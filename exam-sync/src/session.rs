//! Exam session boundary
//!
//! `ExamSession::start` wires a recorder, connectivity monitor and sync
//! engine around one durable store for a single exam. There is no global
//! state: tests and concurrent sessions each own their session object.

use crate::backend::{Backend, HttpBackend};
use crate::config::ExamSyncConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor, HttpProbe, Probe, Transition};
use crate::error::SyncResult;
use crate::record::{Collection, ViolationKind};
use crate::recorder::Recorder;
use crate::store::DurableStore;
use crate::sync_engine::{FlushReport, SyncEngine, SyncEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Messages for the exam UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// Non-blocking warning: progress is being saved locally.
    ConnectionUnstable,
    ConnectionRestored,
    /// A record will not be retried automatically.
    DeadLettered {
        collection: Collection,
        local_id: i64,
        attempts: u32,
        error: String,
    },
    /// A capture could not be stored locally.
    StorageFailure { collection: Collection, error: String },
}

/// Result of submitting the exam
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionOutcome {
    pub flush: FlushReport,
    /// Every record reached the backend; local data has been cleared.
    pub confirmed: bool,
}

pub struct ExamSession {
    exam_id: String,
    store: Arc<DurableStore>,
    recorder: Arc<Recorder>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    notices: broadcast::Sender<SessionNotice>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ExamSession {
    /// Open the store and start background sync against the HTTP backend.
    pub async fn start(exam_id: impl Into<String>, config: &ExamSyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let store = Arc::new(DurableStore::open(&config.store).await?);
        let backend = Arc::new(HttpBackend::new(&config.sync)?);
        let probe = Arc::new(HttpProbe::new(&config.sync, &config.connectivity)?);
        Ok(Self::start_with(exam_id, config, store, backend, probe))
    }

    /// Start a session on an existing store with the given collaborators.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_with(
        exam_id: impl Into<String>,
        config: &ExamSyncConfig,
        store: Arc<DurableStore>,
        backend: Arc<dyn Backend>,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let exam_id = exam_id.into();
        let (notices, _) = broadcast::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let recorder = Arc::new(Recorder::new(Arc::clone(&store), exam_id.clone(), notices.clone()));
        let monitor = Arc::new(ConnectivityMonitor::new(probe, config.connectivity.clone()));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            backend,
            Arc::clone(&monitor),
            config.sync.clone(),
        ));

        let tasks = vec![
            tokio::spawn(forward_notices(
                engine.subscribe(),
                monitor.subscribe(),
                notices.clone(),
                shutdown_rx.clone(),
            )),
            monitor.spawn(shutdown_rx.clone()),
            engine.spawn(shutdown_rx),
        ];

        tracing::info!(
            exam_id = %exam_id,
            session_id = %recorder.session_id(),
            node_id = %store.node_id(),
            "Exam session started"
        );

        Self {
            exam_id,
            store,
            recorder,
            monitor,
            engine,
            notices,
            shutdown,
            tasks,
        }
    }

    pub fn exam_id(&self) -> &str {
        &self.exam_id
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    /// Subscribe to UI notices
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Feed the platform's network-online signal.
    pub async fn set_network_online(&self, online: bool) -> Option<Transition> {
        self.monitor.set_network_online(online).await
    }

    /// Integrity event from the proctoring layer.
    pub async fn on_integrity_event(
        &self,
        kind: ViolationKind,
        details: serde_json::Value,
    ) -> SyncResult<i64> {
        self.recorder.record_violation(kind, details).await
    }

    /// Close recording and flush everything before `deadline` elapses.
    ///
    /// Only a confirmed outcome (`remaining == 0`) may be reported to the
    /// student as a successful submission. When confirmed, local data is
    /// cleared; otherwise background retry continues.
    pub async fn on_exam_submit(&self, deadline: Duration) -> SyncResult<SubmissionOutcome> {
        self.recorder.close().await;

        let flush = self.engine.flush_all(deadline).await?;
        let confirmed = flush.is_complete();

        if confirmed {
            for collection in Collection::DRAIN_ORDER {
                self.store.clear(collection).await?;
            }
            tracing::info!(
                exam_id = %self.exam_id,
                delivered = flush.delivered,
                "Exam submission confirmed"
            );
        } else {
            tracing::warn!(
                exam_id = %self.exam_id,
                remaining = flush.remaining,
                dead_lettered = flush.dead_lettered,
                "Exam submission not fully confirmed, retrying in background"
            );
        }

        Ok(SubmissionOutcome { flush, confirmed })
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task failed");
            }
        }
        tracing::info!(exam_id = %self.exam_id, "Exam session stopped");
    }
}

async fn forward_notices(
    mut events: broadcast::Receiver<SyncEvent>,
    mut status: watch::Receiver<Connectivity>,
    notices: broadcast::Sender<SessionNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut was_available = *status.borrow() == Connectivity::Available;
    let mut warned = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::DeadLettered { collection, local_id, attempts, error }) => {
                    let _ = notices.send(SessionNotice::DeadLettered {
                        collection,
                        local_id,
                        attempts,
                        error,
                    });
                }
                Ok(SyncEvent::Delivered { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notice forwarder lagged behind sync events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let available = *status.borrow_and_update() == Connectivity::Available;
                match (was_available, available) {
                    (true, false) => {
                        warned = true;
                        let _ = notices.send(SessionNotice::ConnectionUnstable);
                    }
                    (false, true) if warned => {
                        warned = false;
                        let _ = notices.send(SessionNotice::ConnectionRestored);
                    }
                    _ => {}
                }
                was_available = available;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
