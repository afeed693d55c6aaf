//! Sync engine
//!
//! Drains pending records to the exam backend.
//!
//! Protocol per record:
//! 1. Mark in flight (counts the attempt)
//! 2. Submit with the record's idempotency key
//! 3. Remove only after the backend accepts it
//! 4. On failure revert to pending with backoff, or dead-letter at the cap
//!
//! Collections drain in priority order (violations, answers, media, video
//! chunks). Video chunks are delivered serially per recording session in
//! chunk-index order; a chunk that fails, is backing off or is dead-lettered
//! holds back the later chunks of its session. The highest delivered index
//! is persisted, so a chunk waits for a missing predecessor across cycles
//! until `chunk_gap_grace` has passed since it was captured.
//!
//! The final flush never dead-letters: its attempts are not charged against
//! `max_attempts`, and whatever it leaves behind is retried in the background.

use crate::backend::{Backend, OutboundRecord};
use crate::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::error::{SyncError, SyncResult};
use crate::record::{idempotency_key, Collection, Record, SyncState};
use crate::store::DurableStore;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// How a drain cycle was started
#[derive(Debug, Clone, Copy)]
enum DrainMode {
    /// Background cycle: honours backoff and stops when connectivity drops.
    Scheduled,
    /// Final flush: ignores backoff and connectivity, bounded by a deadline.
    Flush { deadline: Instant },
}

/// Engine events, consumed by the exam session
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Delivered {
        collection: Collection,
        local_id: i64,
        duplicate: bool,
    },
    DeadLettered {
        collection: Collection,
        local_id: i64,
        attempts: u32,
        error: String,
    },
}

/// Outcome of one drain pass over a collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub delivered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub skipped_backoff: u64,
    pub blocked_by_ordering: u64,
    /// Another drain held the collection
    pub busy: bool,
    /// Stopped early (connectivity lost or deadline reached)
    pub interrupted: bool,
}

/// Outcome of one drain cycle over all collections
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub collections: BTreeMap<Collection, CollectionReport>,
    /// Records older than the store's maximum record age
    pub stale_records: u64,
}

impl DrainReport {
    pub fn delivered(&self) -> u64 {
        self.collections.values().map(|c| c.delivered).sum()
    }

    pub fn failed(&self) -> u64 {
        self.collections.values().map(|c| c.failed).sum()
    }

    pub fn dead_lettered(&self) -> u64 {
        self.collections.values().map(|c| c.dead_lettered).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.collections.values().all(|c| {
            c.delivered == 0 && c.failed == 0 && c.dead_lettered == 0
        })
    }
}

/// Result of a deadline-bounded final flush
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub delivered: u64,
    /// Records still stored in any state, dead letters included
    pub remaining: u64,
    /// Dead letters among `remaining`, left there by earlier background drains
    pub dead_lettered: u64,
    pub rounds: u32,
    pub deadline_reached: bool,
}

impl FlushReport {
    /// Everything captured has been acknowledged by the backend.
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// One drain at a time per collection
#[derive(Default)]
struct DrainLocks {
    violations: Mutex<()>,
    answers: Mutex<()>,
    media: Mutex<()>,
    video_chunks: Mutex<()>,
}

impl DrainLocks {
    fn get(&self, collection: Collection) -> &Mutex<()> {
        match collection {
            Collection::Violations => &self.violations,
            Collection::Answers => &self.answers,
            Collection::Media => &self.media,
            Collection::VideoChunks => &self.video_chunks,
        }
    }
}

enum Delivery {
    Delivered,
    Failed,
    DeadLettered,
}

/// Sync engine
pub struct SyncEngine {
    store: Arc<DurableStore>,
    backend: Arc<dyn Backend>,
    monitor: Arc<ConnectivityMonitor>,
    policy: BackoffPolicy,
    config: SyncConfig,
    drain_locks: DrainLocks,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<DurableStore>,
        backend: Arc<dyn Backend>,
        monitor: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            backend,
            monitor,
            policy: BackoffPolicy::from_config(&config),
            config,
            drain_locks: DrainLocks::default(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run one background drain cycle over all collections.
    ///
    /// Busy collections are skipped, records still backing off are left
    /// alone and no new submission starts once the backend is unavailable.
    /// Every cycle also warns about records past the retention age.
    pub async fn drain_cycle(&self) -> SyncResult<DrainReport> {
        let mut report = self.drain(DrainMode::Scheduled).await?;
        report.stale_records = self.store.check_retention(Utc::now()).await?;
        Ok(report)
    }

    async fn drain(&self, mode: DrainMode) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();

        for collection in Collection::DRAIN_ORDER {
            let collection_report = self.drain_collection(collection, mode).await?;
            let interrupted = collection_report.interrupted;
            report.collections.insert(collection, collection_report);
            if interrupted {
                break;
            }
        }

        if !report.is_idle() {
            tracing::info!(
                delivered = report.delivered(),
                failed = report.failed(),
                dead_lettered = report.dead_lettered(),
                "Drain cycle finished"
            );
        }

        Ok(report)
    }

    async fn drain_collection(&self, collection: Collection, mode: DrainMode) -> SyncResult<CollectionReport> {
        let mut report = CollectionReport::default();
        let lock = self.drain_locks.get(collection);

        let _guard = match mode {
            DrainMode::Scheduled => match lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::debug!(collection = %collection, "Drain already running, skipping");
                    report.busy = true;
                    return Ok(report);
                }
            },
            DrainMode::Flush { deadline } => match tokio::time::timeout_at(deadline, lock.lock()).await {
                Ok(guard) => guard,
                Err(_) => {
                    report.busy = true;
                    report.interrupted = true;
                    return Ok(report);
                }
            },
        };

        // Recording sessions whose next chunk cannot go out yet, with the
        // lowest chunk index that is holding them back.
        let mut held_sessions: HashMap<Uuid, u64> = HashMap::new();
        // Highest delivered chunk index per recording, loaded on first use.
        let mut progress: HashMap<Uuid, Option<u64>> = HashMap::new();
        if collection == Collection::VideoChunks {
            for dead in self.store.list_dead_lettered(collection).await? {
                if let Some((session, index)) = dead.chunk_position() {
                    let entry = held_sessions.entry(session).or_insert(index);
                    *entry = (*entry).min(index);
                }
            }
        }

        let mut gap_logged: HashSet<Uuid> = HashSet::new();

        for local_id in self.store.list_pending_ids(collection).await? {
            match mode {
                DrainMode::Scheduled if !self.monitor.is_available() => {
                    tracing::debug!(collection = %collection, "Backend unavailable, stopping drain");
                    report.interrupted = true;
                    break;
                }
                DrainMode::Flush { deadline } if Instant::now() >= deadline => {
                    report.interrupted = true;
                    break;
                }
                _ => {}
            }

            // Removed by a concurrent clear.
            let Some(record) = self.store.get(collection, local_id).await? else {
                continue;
            };

            let position = record.chunk_position();
            if let Some((session, index)) = position {
                if held_sessions.get(&session).is_some_and(|held| *held < index) {
                    report.blocked_by_ordering += 1;
                    continue;
                }
            }

            if record.sync_state != SyncState::Pending {
                continue;
            }

            if let Some((session, index)) = position {
                let last = match progress.get(&session) {
                    Some(last) => *last,
                    None => {
                        let last = self.store.last_delivered_chunk(session).await?;
                        progress.insert(session, last);
                        last
                    }
                };
                let expected = last.map_or(0, |last| last.saturating_add(1));

                if index > expected {
                    // The recorder is closed during a flush, so a missing
                    // chunk can no longer arrive.
                    let waited = (Utc::now() - record.saved_at).to_std().unwrap_or_default();
                    let flushing = matches!(mode, DrainMode::Flush { .. });
                    if !flushing && waited < self.config.chunk_gap_grace {
                        report.blocked_by_ordering += 1;
                        held_sessions.entry(session).or_insert(index);
                        continue;
                    }
                    if gap_logged.insert(session) {
                        let violation = SyncError::OrderingViolation {
                            collection,
                            detail: format!(
                                "recording {} skips chunks {} to {}",
                                session,
                                expected,
                                index - 1
                            ),
                        };
                        tracing::warn!(error = %violation, "Video chunk gap");
                    }
                } else if last.is_some_and(|last| index <= last) && gap_logged.insert(session) {
                    let violation = SyncError::OrderingViolation {
                        collection,
                        detail: format!(
                            "recording {} chunk {} arrived after chunk {} was delivered",
                            session,
                            index,
                            last.unwrap_or_default()
                        ),
                    };
                    tracing::warn!(error = %violation, "Late video chunk");
                }
            }

            if matches!(mode, DrainMode::Scheduled) && !record.is_due(Utc::now()) {
                report.skipped_backoff += 1;
                if let Some((session, index)) = position {
                    held_sessions.entry(session).or_insert(index);
                }
                continue;
            }

            match self.deliver(&record, mode).await? {
                Delivery::Delivered => {
                    report.delivered += 1;
                    if let Some((session, index)) = position {
                        let last = progress.entry(session).or_insert(None);
                        *last = Some(last.map_or(index, |last| last.max(index)));
                    }
                }
                Delivery::Failed => {
                    report.failed += 1;
                    if let Some((session, index)) = position {
                        held_sessions.entry(session).or_insert(index);
                    }
                }
                Delivery::DeadLettered => {
                    report.dead_lettered += 1;
                    if let Some((session, index)) = position {
                        held_sessions.entry(session).or_insert(index);
                    }
                }
            }
        }

        if report.blocked_by_ordering > 0 {
            tracing::debug!(
                collection = %collection,
                blocked = report.blocked_by_ordering,
                "Video chunks held back behind an undelivered chunk"
            );
        }

        Ok(report)
    }

    async fn deliver(&self, record: &Record, mode: DrainMode) -> SyncResult<Delivery> {
        let collection = record.collection;
        let local_id = record.local_id;
        let attempts = self.store.mark_in_flight(collection, local_id).await?;
        let outbound = OutboundRecord::from_record(self.store.node_id(), record, attempts);

        let timeout = match mode {
            DrainMode::Scheduled => self.config.request_timeout,
            DrainMode::Flush { deadline } => self
                .config
                .request_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
        };

        let result = match tokio::time::timeout(timeout, self.backend.deliver(collection, &outbound)).await {
            Ok(Ok(ack)) if ack.accepted => Ok(ack),
            Ok(Ok(_)) => Err("Backend did not accept the record".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("Submission timed out after {:?}", timeout)),
        };

        match result {
            Ok(ack) => {
                match record.chunk_position() {
                    Some((session, index)) => {
                        self.store.remove_delivered_chunk(local_id, session, index).await?;
                    }
                    None => {
                        self.store.remove(collection, local_id).await?;
                    }
                }
                tracing::debug!(
                    collection = %collection,
                    local_id,
                    attempts,
                    server_id = ?ack.server_id,
                    duplicate = ack.duplicate,
                    "Record delivered"
                );
                let _ = self.events.send(SyncEvent::Delivered {
                    collection,
                    local_id,
                    duplicate: ack.duplicate,
                });
                Ok(Delivery::Delivered)
            }
            Err(error) if matches!(mode, DrainMode::Flush { .. }) => {
                self.store.release_attempt(collection, local_id, &error).await?;
                Ok(Delivery::Failed)
            }
            Err(error) if self.policy.should_dead_letter(attempts) => {
                self.store.mark_dead_lettered(collection, local_id, &error).await?;
                let escalation = SyncError::DeadLettered {
                    collection,
                    local_id,
                    attempts,
                };
                tracing::error!(error = %escalation, last_error = %error, "Record needs operator attention");
                let _ = self.events.send(SyncEvent::DeadLettered {
                    collection,
                    local_id,
                    attempts,
                    error,
                });
                Ok(Delivery::DeadLettered)
            }
            Err(error) => {
                let key = idempotency_key(self.store.node_id(), collection, local_id);
                let next_attempt_at = self.policy.next_attempt_at(Utc::now(), attempts, &key);
                self.store
                    .mark_failed(collection, local_id, &error, next_attempt_at)
                    .await?;
                Ok(Delivery::Failed)
            }
        }
    }

    /// Accelerated drain of every collection, bounded by `deadline`.
    ///
    /// Ignores the drain timer, backoff timestamps and connectivity. Returns
    /// within the deadline plus the cost of a few local store calls, even
    /// when the backend never answers. Failed submissions are not counted
    /// toward `max_attempts`, so nothing is dead-lettered here.
    pub async fn flush_all(&self, deadline: Duration) -> SyncResult<FlushReport> {
        let started = Instant::now();
        let deadline_at = started + deadline;
        let mut report = FlushReport::default();

        let flush = async {
            loop {
                report.rounds += 1;
                let cycle = self.drain(DrainMode::Flush { deadline: deadline_at }).await?;
                report.delivered += cycle.delivered();

                let mut pending = 0;
                for collection in Collection::DRAIN_ORDER {
                    pending += self.store.list_pending_ids(collection).await?.len();
                }
                if pending == 0 {
                    return Ok::<_, SyncError>(());
                }

                let left = deadline_at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Ok(());
                }
                tokio::time::sleep(self.config.flush_retry_interval.min(left)).await;
            }
        };

        let outcome = tokio::time::timeout_at(deadline_at, flush).await;
        report.deadline_reached = Instant::now() >= deadline_at;

        match outcome {
            Ok(result) => result?,
            Err(_) => {
                // Submissions abandoned mid-flight go back to pending.
                for collection in Collection::DRAIN_ORDER {
                    self.store.reset_in_flight(collection).await?;
                }
            }
        }

        report.remaining = self.store.count_remaining().await?;
        report.dead_lettered = self.store.stats().await?.dead_lettered();

        if report.is_complete() {
            tracing::info!(
                delivered = report.delivered,
                rounds = report.rounds,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Final flush confirmed every record"
            );
        } else {
            tracing::warn!(
                delivered = report.delivered,
                remaining = report.remaining,
                dead_lettered = report.dead_lettered,
                deadline_ms = deadline.as_millis() as u64,
                "Final flush left records undelivered"
            );
        }

        Ok(report)
    }

    /// Background loop: drains on every availability transition and on the
    /// drain timer while the backend is reachable.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut status = self.monitor.subscribe();
        let mut interval = tokio::time::interval(self.config.drain_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *status.borrow_and_update() != Connectivity::Available {
                        continue;
                    }
                    tracing::debug!("Backend became available, draining");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if !self.monitor.is_available() {
                continue;
            }

            tokio::select! {
                result = self.drain_cycle() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Drain cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    // The abandoned submission is retried by the next drain.
                    for collection in Collection::DRAIN_ORDER {
                        if let Err(e) = self.store.reset_in_flight(collection).await {
                            tracing::error!(error = %e, "Failed to reset in-flight records");
                        }
                    }
                    break;
                }
            }
        }

        tracing::debug!("Sync engine stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }
}
