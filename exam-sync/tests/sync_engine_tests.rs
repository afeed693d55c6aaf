//! Delivery guarantees of the sync engine against an in-process backend
//!
//! Covers:
//! 1. Priority ordering across collections
//! 2. Answers delivered in capture order after reconnecting
//! 3. Violations ahead of video regardless of local id
//! 4. Per-recording chunk ordering, including a stuck chunk
//! 5. Idempotent redelivery after a lost acknowledgment
//! 6. No deletion without acknowledgment
//! 7. Backoff growth and dead-lettering at the attempt cap
//! 8. Deadline-bounded final flush against a silent backend
//! 9. Flush retries never dead-letter
//! 10. Chunk order held across cycles, with a grace period for gaps

mod common;

use common::*;
use exam_sync::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_drain_delivers_collections_in_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Accept);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    let recording = Uuid::new_v4();
    // Interleave captures so local ids do not hint at priority.
    store.append(Collection::VideoChunks, chunk(recording, 0)).await.unwrap();
    store.append(Collection::Media, snapshot()).await.unwrap();
    store.append(Collection::Answers, answer("Q1")).await.unwrap();
    store.append(Collection::Violations, violation(ViolationKind::TabBlur)).await.unwrap();
    store.append(Collection::VideoChunks, chunk(recording, 1)).await.unwrap();
    store.append(Collection::Answers, answer("Q2")).await.unwrap();
    store.append(Collection::Media, snapshot()).await.unwrap();
    store.append(Collection::Violations, violation(ViolationKind::WebcamLost)).await.unwrap();

    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.delivered(), 8);

    let order = backend.collections_in_order();
    let ranks: Vec<usize> = order
        .iter()
        .map(|c| Collection::DRAIN_ORDER.iter().position(|p| p == c).unwrap())
        .collect();
    let mut sorted = ranks.clone();
    sorted.sort_unstable();
    assert_eq!(ranks, sorted, "delivery order was {:?}", order);
    assert_eq!(store.count_remaining().await.unwrap(), 0);
}

#[tokio::test]
async fn test_offline_answers_drain_in_local_id_order_once_available() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Accept);

    let probe = SwitchProbe::new(false);
    let monitor = Arc::new(ConnectivityMonitor::new(probe.clone(), config.connectivity.clone()));
    monitor.probe_once().await;
    let engine = SyncEngine::new(store.clone(), backend.clone(), monitor.clone(), config.sync.clone());

    let a = store.append(Collection::Answers, answer("A")).await.unwrap().local_id;
    let b = store.append(Collection::Answers, answer("B")).await.unwrap().local_id;
    let c = store.append(Collection::Answers, answer("C")).await.unwrap().local_id;

    // Offline: nothing goes out.
    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.delivered(), 0);
    assert_eq!(backend.submissions(), 0);

    probe.set(true);
    assert_eq!(monitor.probe_once().await, Some(Transition::BecameAvailable));

    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.delivered(), 3);

    let ids: Vec<i64> = backend.entries().iter().map(|e| e.local_id).collect();
    assert_eq!(ids, vec![a, b, c]);
    assert!(store.list_pending(Collection::Answers).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_violation_goes_before_earlier_video_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Accept);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    let chunk_id = store
        .append(Collection::VideoChunks, chunk(Uuid::new_v4(), 0))
        .await
        .unwrap()
        .local_id;
    let violation_id = store
        .append(Collection::Violations, violation(ViolationKind::NetworkDrop))
        .await
        .unwrap()
        .local_id;
    assert!(chunk_id <= violation_id);

    engine.drain_cycle().await.unwrap();

    assert_eq!(
        backend.collections_in_order(),
        vec![Collection::Violations, Collection::VideoChunks]
    );
}

#[tokio::test]
async fn test_chunks_are_delivered_in_index_order_per_recording() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Accept);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    // Jittered capture: indices arrive out of order and interleaved.
    for (recording, index) in [
        (first, 2),
        (second, 1),
        (first, 0),
        (first, 4),
        (second, 0),
        (first, 1),
        (first, 3),
    ] {
        store.append(Collection::VideoChunks, chunk(recording, index)).await.unwrap();
    }

    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.delivered(), 7);

    assert_eq!(delivered_chunks(&backend, first), vec![0, 1, 2, 3, 4]);
    assert_eq!(delivered_chunks(&backend, second), vec![0, 1]);
}

#[tokio::test]
async fn test_failed_chunk_holds_back_later_chunks_of_its_recording() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Accept);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    let recording = Uuid::new_v4();
    let other = Uuid::new_v4();
    let mut ids = Vec::new();
    for index in 0..4 {
        ids.push(
            store
                .append(Collection::VideoChunks, chunk(recording, index))
                .await
                .unwrap()
                .local_id,
        );
    }
    store.append(Collection::VideoChunks, chunk(other, 0)).await.unwrap();

    backend.fail(Collection::VideoChunks, ids[1]);
    let report = engine.drain_cycle().await.unwrap();
    let chunks = &report.collections[&Collection::VideoChunks];
    assert_eq!(chunks.failed, 1);
    assert_eq!(chunks.blocked_by_ordering, 2);
    assert_eq!(delivered_chunks(&backend, recording), vec![0]);
    assert_eq!(delivered_chunks(&backend, other), vec![0], "other recordings are unaffected");

    // Once the stuck chunk goes through, the rest follow in order.
    backend.heal(Collection::VideoChunks, ids[1]);
    let flush = engine.flush_all(Duration::from_secs(2)).await.unwrap();
    assert!(flush.is_complete());
    assert_eq!(delivered_chunks(&backend, recording), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_lost_acknowledgment_does_not_duplicate_server_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sync.request_timeout = Duration::from_millis(100);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::LoseAcks);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    let id = store.append(Collection::Answers, answer("Q7")).await.unwrap().local_id;

    // The server stores the answer but the client times out.
    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.failed(), 1);
    let record = store.get(Collection::Answers, id).await.unwrap().unwrap();
    assert_eq!(record.sync_state, SyncState::Pending);
    assert_eq!(record.attempts, 1);

    // The retry carries the same key and is recognised as a duplicate.
    backend.set_mode(Mode::Accept);
    let flush = engine.flush_all(Duration::from_secs(2)).await.unwrap();
    assert_eq!(flush.delivered, 1);
    assert!(flush.is_complete());

    assert_eq!(backend.submissions(), 2);
    let entries = backend.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, idempotency_key(store.node_id(), Collection::Answers, id));
}

#[tokio::test]
async fn test_nothing_is_removed_without_acknowledgment() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Fail);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    let mut appended = Vec::new();
    appended.push(store.append(Collection::Violations, violation(ViolationKind::CopyPaste)).await.unwrap().local_id);
    appended.push(store.append(Collection::Answers, answer("Q1")).await.unwrap().local_id);
    appended.push(store.append(Collection::Media, snapshot()).await.unwrap().local_id);

    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.failed(), 3);
    assert_eq!(report.delivered(), 0);
    assert_eq!(store.count_remaining().await.unwrap(), 3);

    // Only the acknowledged record disappears.
    backend.set_mode(Mode::Accept);
    backend.fail(Collection::Answers, appended[1]);
    engine.flush_all(Duration::from_millis(300)).await.unwrap();

    let delivered: Vec<(Collection, i64)> = backend
        .entries()
        .iter()
        .map(|e| (e.collection, e.local_id))
        .collect();
    assert_eq!(
        delivered,
        vec![(Collection::Violations, appended[0]), (Collection::Media, appended[2])]
    );
    assert!(store.get(Collection::Answers, appended[1]).await.unwrap().is_some());
    assert_eq!(store.count_remaining().await.unwrap(), 1);
}

#[tokio::test]
async fn test_backoff_grows_and_dead_letters_exactly_at_cap() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sync.max_attempts = 4;
    config.sync.base_backoff = Duration::from_millis(5);
    config.sync.max_backoff_exponent = 10;
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Fail);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    let id = store
        .append(Collection::Violations, violation(ViolationKind::FullscreenExit))
        .await
        .unwrap()
        .local_id;
    let key = idempotency_key(store.node_id(), Collection::Violations, id);

    let mut previous_delay = Duration::ZERO;
    for attempt in 1..=3u32 {
        let before = chrono::Utc::now();
        let report = engine.drain_cycle().await.unwrap();
        let after = chrono::Utc::now();
        assert_eq!(report.failed(), 1, "attempt {}", attempt);

        let record = store.get(Collection::Violations, id).await.unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(record.attempts, attempt);

        let delay = engine.policy().delay(attempt, &key);
        assert!(delay >= previous_delay);
        previous_delay = delay;

        let next = record.next_attempt_at.unwrap();
        let delay = chrono::Duration::from_std(delay).unwrap();
        assert!(next >= before + delay && next <= after + delay);

        // Not retried before it is due.
        if next > chrono::Utc::now() + chrono::Duration::milliseconds(5) {
            let report = engine.drain_cycle().await.unwrap();
            assert_eq!(report.collections[&Collection::Violations].skipped_backoff, 1);
        }
        tokio::time::sleep((next - chrono::Utc::now()).to_std().unwrap_or_default()).await;
    }

    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.dead_lettered(), 1);
    assert_eq!(backend.submissions(), 4);

    let dead = store.list_dead_lettered(Collection::Violations).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 4);
    assert!(store.list_pending(Collection::Violations).await.unwrap().is_empty());

    // Dead letters are excluded from draining.
    engine.drain_cycle().await.unwrap();
    assert_eq!(backend.submissions(), 4);
}

#[tokio::test]
async fn test_flush_respects_deadline_against_silent_backend() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sync.request_timeout = Duration::from_secs(30);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Hang);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    for question in ["Q1", "Q2", "Q3"] {
        store.append(Collection::Answers, answer(question)).await.unwrap();
    }
    store.append(Collection::Violations, violation(ViolationKind::TabBlur)).await.unwrap();

    let deadline = Duration::from_millis(300);
    let started = std::time::Instant::now();
    let flush = engine.flush_all(deadline).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < deadline + Duration::from_millis(500), "flush took {:?}", elapsed);
    assert!(flush.deadline_reached);
    assert_eq!(flush.delivered, 0);
    assert_eq!(flush.remaining, 4);
    assert!(!flush.is_complete());

    // Abandoned submissions are pending again, not stuck in flight.
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.collections.values().map(|c| c.in_flight).sum::<u64>(), 0);
    assert_eq!(stats.collections[&Collection::Answers].pending, 3);
}

#[tokio::test]
async fn test_flush_ignores_backoff_and_connectivity() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sync.base_backoff = Duration::from_secs(60);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Fail);

    let probe = SwitchProbe::new(true);
    let monitor = Arc::new(ConnectivityMonitor::new(probe.clone(), config.connectivity.clone()));
    monitor.probe_once().await;
    let engine = SyncEngine::new(store.clone(), backend.clone(), monitor.clone(), config.sync.clone());

    store.append(Collection::Answers, answer("Q1")).await.unwrap();
    engine.drain_cycle().await.unwrap();
    assert_eq!(backend.submissions(), 1);

    // Backing off for a minute and the probe now fails.
    probe.set(false);
    monitor.probe_once().await;
    backend.set_mode(Mode::Accept);

    let flush = engine.flush_all(Duration::from_secs(2)).await.unwrap();
    assert!(flush.is_complete());
    assert_eq!(flush.delivered, 1);
}

#[tokio::test]
async fn test_remaining_counts_dead_letters() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sync.max_attempts = 1;
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Accept);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    let stuck = store.append(Collection::Media, snapshot()).await.unwrap().local_id;
    store.append(Collection::Answers, answer("Q1")).await.unwrap();
    backend.fail(Collection::Media, stuck);

    // The background drain gives up on the snapshot.
    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.delivered(), 1);
    assert_eq!(report.dead_lettered(), 1);

    let flush = engine.flush_all(Duration::from_millis(300)).await.unwrap();
    assert_eq!(flush.delivered, 0);
    assert_eq!(flush.dead_lettered, 1);
    assert_eq!(flush.remaining, 1);
    assert!(!flush.is_complete());

    // Operator requeue puts it back in the drain.
    backend.heal(Collection::Media, stuck);
    assert_eq!(store.requeue_dead_lettered(Collection::Media).await.unwrap(), 1);
    let flush = engine.flush_all(Duration::from_secs(1)).await.unwrap();
    assert!(flush.is_complete());
}

#[tokio::test]
async fn test_flush_failures_are_not_charged_against_attempt_cap() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sync.max_attempts = 2;
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Fail);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    let first = store.append(Collection::Answers, answer("Q1")).await.unwrap().local_id;
    store.append(Collection::Answers, answer("Q2")).await.unwrap();

    let flush = engine.flush_all(Duration::from_millis(300)).await.unwrap();
    assert!(flush.rounds > 2, "flush kept retrying until the deadline");
    assert!(backend.submissions() > 4);
    assert_eq!(flush.dead_lettered, 0);
    assert_eq!(flush.remaining, 2);
    assert!(store.list_dead_lettered(Collection::Answers).await.unwrap().is_empty());

    let record = store.get(Collection::Answers, first).await.unwrap().unwrap();
    assert_eq!(record.sync_state, SyncState::Pending);
    // At most the submission cut off by the deadline is counted.
    assert!(record.attempts <= 1, "attempts = {}", record.attempts);
    assert!(record.last_error.is_some());

    // The background drain picks them up once the backend recovers.
    backend.set_mode(Mode::Accept);
    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.delivered(), 2);
    assert_eq!(store.count_remaining().await.unwrap(), 0);
}

#[tokio::test]
async fn test_late_chunk_goes_out_before_later_indices() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Accept);
    let engine = engine(&config, store.clone(), backend.clone()).await;
    let recording = Uuid::new_v4();

    store.append(Collection::VideoChunks, chunk(recording, 0)).await.unwrap();
    store.append(Collection::VideoChunks, chunk(recording, 2)).await.unwrap();

    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.collections[&Collection::VideoChunks].blocked_by_ordering, 1);
    assert_eq!(delivered_chunks(&backend, recording), vec![0]);

    // Chunk 1 shows up in a later cycle and is still delivered first.
    store.append(Collection::VideoChunks, chunk(recording, 1)).await.unwrap();
    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.delivered(), 2);
    assert_eq!(delivered_chunks(&backend, recording), vec![0, 1, 2]);
    assert_eq!(store.last_delivered_chunk(recording).await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_chunk_gap_is_skipped_after_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sync.chunk_gap_grace = Duration::ZERO;
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Accept);
    let engine = engine(&config, store.clone(), backend.clone()).await;
    let recording = Uuid::new_v4();

    store.append(Collection::VideoChunks, chunk(recording, 0)).await.unwrap();
    store.append(Collection::VideoChunks, chunk(recording, 2)).await.unwrap();

    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.delivered(), 2);
    assert_eq!(delivered_chunks(&backend, recording), vec![0, 2]);

    // A chunk arriving after its successor was delivered is still sent.
    store.append(Collection::VideoChunks, chunk(recording, 1)).await.unwrap();
    engine.drain_cycle().await.unwrap();
    assert_eq!(delivered_chunks(&backend, recording), vec![0, 2, 1]);
    assert_eq!(store.last_delivered_chunk(recording).await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_flush_does_not_wait_for_missing_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Accept);
    let engine = engine(&config, store.clone(), backend.clone()).await;
    let recording = Uuid::new_v4();

    store.append(Collection::VideoChunks, chunk(recording, 1)).await.unwrap();
    store.append(Collection::VideoChunks, chunk(recording, 3)).await.unwrap();

    let flush = engine.flush_all(Duration::from_secs(1)).await.unwrap();
    assert!(flush.is_complete());
    assert_eq!(delivered_chunks(&backend, recording), vec![1, 3]);
}

#[tokio::test]
async fn test_every_drain_cycle_reports_stale_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.store.max_record_age = Duration::ZERO;
    let store = open_store(&config).await;
    let backend = MockBackend::new(Mode::Fail);
    let engine = engine(&config, store.clone(), backend.clone()).await;

    store.append(Collection::Answers, answer("Q1")).await.unwrap();

    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.stale_records, 1);
    let report = engine.drain_cycle().await.unwrap();
    assert_eq!(report.stale_records, 1, "stale records are never deleted");
}
