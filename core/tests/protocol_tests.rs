//! End-to-end protocol tests against the in-memory store.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Tests can panic

use idempotency_core::environment::Clock;
use idempotency_core::{
    AdmissionKind, AdmittedKey, ConflictReason, Decision, IdempotencyConfig,
    IdempotencyCoordinator, IdempotencyError, LockReleasePolicy, RecordKey, RecoveryPoint,
    ReleaseAction, ReleaseOutcome, StageMap, StageOutcome,
};
use idempotency_testing::helpers::{post, request};
use idempotency_testing::{InMemoryIdempotencyStore, InMemoryTransaction, ManualClock, test_clock};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

const KEY: &str = "11111111-1111-1111-1111-111111111111";
const MID: RecoveryPoint = RecoveryPoint::custom("mid");

struct Harness {
    coordinator: IdempotencyCoordinator<InMemoryIdempotencyStore>,
    store: InMemoryIdempotencyStore,
    clock: ManualClock,
}

fn harness(config: IdempotencyConfig) -> Harness {
    let store = InMemoryIdempotencyStore::new();
    let clock = ManualClock::new(test_clock().now());
    let coordinator =
        IdempotencyCoordinator::new(Arc::new(store.clone()), Arc::new(clock.clone()), config);
    Harness {
        coordinator,
        store,
        clock,
    }
}

fn record_key() -> RecordKey {
    RecordKey::new(Uuid::parse_str(KEY).unwrap())
}

fn admitted(decision: Decision) -> AdmittedKey {
    match decision {
        Decision::Admitted(admitted) => admitted,
        other => panic!("expected admission, got {other:?}"),
    }
}

fn single_stage(calls: &Arc<AtomicUsize>, status: u16, body: Value) -> StageMap<InMemoryTransaction> {
    let calls = Arc::clone(calls);
    StageMap::new().stage(RecoveryPoint::STARTED, move |_tx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let body = body.clone();
        Box::pin(async move { Ok(StageOutcome::finish(status, body)) })
    })
}

/// STARTED → MID → FINISHED; the MID stage fails while `fail_mid` is set.
fn two_stages(
    started_calls: &Arc<AtomicUsize>,
    mid_calls: &Arc<AtomicUsize>,
    fail_mid: bool,
) -> StageMap<InMemoryTransaction> {
    let started_calls = Arc::clone(started_calls);
    let mid_calls = Arc::clone(mid_calls);
    StageMap::new()
        .stage(RecoveryPoint::STARTED, move |_tx| {
            started_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(StageOutcome::new(202, json!({"body": "A"}), MID)) })
        })
        .stage(MID, move |_tx| {
            mid_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if fail_mid {
                    anyhow::bail!("downstream unavailable");
                }
                Ok(StageOutcome::finish(201, json!({"body": "B"})))
            })
        })
}

#[tokio::test]
async fn test_first_request_is_cached_and_replayed() {
    let h = harness(IdempotencyConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = single_stage(&calls, 201, json!({"id": 7}));

    let first = admitted(h.coordinator.admit(&post("/orders", r#"{"x":1}"#, KEY)).await.unwrap());
    assert_eq!(first.kind(), AdmissionKind::Fresh);
    let response = h.coordinator.proceed(&first, &stages).await.unwrap();
    assert_eq!(response.status_code, 201);
    assert_eq!(response.body, json!({"id": 7}));
    assert_eq!(
        h.coordinator.release(&first, ReleaseOutcome::Completed).await.unwrap(),
        ReleaseAction::Unlocked
    );

    let stored = h.store.get(&record_key()).await.unwrap();
    assert_eq!(stored.recovery_point, RecoveryPoint::FINISHED);
    assert_eq!(stored.response_code, Some(201));
    assert_eq!(stored.response_body.as_deref(), Some(r#"{"id":7}"#));
    assert_eq!(stored.locked_at, None);

    let replay = admitted(h.coordinator.admit(&post("/orders", r#"{"x":1}"#, KEY)).await.unwrap());
    assert_eq!(replay.kind(), AdmissionKind::Replay);
    let replayed = h.coordinator.proceed(&replay, &stages).await.unwrap();
    assert_eq!(replayed, response);
    assert_eq!(replayed.canonical_body().unwrap(), r#"{"id":7}"#);
    assert_eq!(
        h.coordinator.release(&replay, ReleaseOutcome::Completed).await.unwrap(),
        ReleaseAction::Skipped
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_different_body_or_path_is_a_parameter_mismatch() {
    let h = harness(IdempotencyConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = single_stage(&calls, 201, json!({"id": 7}));

    let first = admitted(h.coordinator.admit(&post("/orders", r#"{"x":1}"#, KEY)).await.unwrap());
    h.coordinator.proceed(&first, &stages).await.unwrap();
    h.coordinator.release(&first, ReleaseOutcome::Completed).await.unwrap();

    let other_body = h.coordinator.admit(&post("/orders", r#"{"x":2}"#, KEY)).await.unwrap();
    assert_eq!(other_body, Decision::Conflict(ConflictReason::ParameterMismatch));

    let other_path = h.coordinator.admit(&post("/refunds", r#"{"x":1}"#, KEY)).await.unwrap();
    assert_eq!(other_path, Decision::Conflict(ConflictReason::ParameterMismatch));

    let other_method = h
        .coordinator
        .admit(&request(http::Method::PUT, "/orders", r#"{"x":1}"#, KEY))
        .await
        .unwrap();
    assert_eq!(other_method, Decision::Conflict(ConflictReason::ParameterMismatch));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stored = h.store.get(&record_key()).await.unwrap();
    assert_eq!(stored.request_body, br#"{"x":1}"#.to_vec());
}

#[tokio::test]
async fn test_held_lock_rejects_retry_in_progress() {
    let h = harness(IdempotencyConfig::default());

    let first = admitted(h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap());
    assert!(first.holds_lock());

    h.clock.advance(chrono::Duration::seconds(299));
    let retry = h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap();
    assert_eq!(retry, Decision::Conflict(ConflictReason::InProgress));
}

#[tokio::test]
async fn test_concurrent_requests_admit_exactly_one() {
    let h = harness(IdempotencyConfig::default());
    let request = post("/orders", r#"{"x":1}"#, KEY);

    let attempts = (0..8).map(|_| {
        let coordinator = h.coordinator.clone();
        let request = request.clone();
        tokio::spawn(async move { coordinator.admit(&request).await.unwrap() })
    });
    let mut decisions = Vec::new();
    for attempt in attempts.collect::<Vec<_>>() {
        decisions.push(attempt.await.unwrap());
    }

    let fresh = decisions
        .iter()
        .filter(|d| matches!(d, Decision::Admitted(a) if a.kind() == AdmissionKind::Fresh))
        .count();
    let in_progress = decisions
        .iter()
        .filter(|d| **d == Decision::Conflict(ConflictReason::InProgress))
        .count();
    assert_eq!(fresh, 1);
    assert_eq!(in_progress, 7);
}

#[tokio::test]
async fn test_expired_lock_resumes_from_last_recovery_point() {
    let h = harness(IdempotencyConfig::default());
    let started_calls = Arc::new(AtomicUsize::new(0));
    let mid_calls = Arc::new(AtomicUsize::new(0));

    // First execution advances to MID, then fails and never releases (crash).
    let first = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    let failing = two_stages(&started_calls, &mid_calls, true);
    let error = h.coordinator.proceed(&first, &failing).await.unwrap_err();
    assert!(matches!(error, IdempotencyError::Stage(_)));

    let stored = h.store.get(&record_key()).await.unwrap();
    assert_eq!(stored.recovery_point, MID);
    assert!(stored.locked_at.is_some());
    assert_eq!(stored.response_code, None);

    let too_soon = h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap();
    assert_eq!(too_soon, Decision::Conflict(ConflictReason::InProgress));

    h.clock.advance(chrono::Duration::seconds(301));
    let resumed = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    assert_eq!(resumed.kind(), AdmissionKind::Resumed);
    assert_eq!(resumed.record().recovery_point, MID);
    assert_eq!(resumed.record().locked_at, Some(h.clock.now()));

    let working = two_stages(&started_calls, &mid_calls, false);
    let response = h.coordinator.proceed(&resumed, &working).await.unwrap();
    assert_eq!(response.status_code, 201);
    assert_eq!(response.body, json!({"body": "B"}));

    assert_eq!(started_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mid_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_crash_between_stages_reruns_only_the_remaining_stage() {
    let h = harness(IdempotencyConfig::default());
    let started_calls = Arc::new(AtomicUsize::new(0));
    let mid_calls = Arc::new(AtomicUsize::new(0));

    // A deployment that only knows the first stage stops after committing it.
    let started_calls_clone = Arc::clone(&started_calls);
    let first_only: StageMap<InMemoryTransaction> =
        StageMap::new().stage(RecoveryPoint::STARTED, move |_tx| {
            started_calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(StageOutcome::new(202, json!({"body": "A"}), MID)) })
        });

    let first = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    let error = h.coordinator.proceed(&first, &first_only).await.unwrap_err();
    assert!(matches!(&error, IdempotencyError::MissingStage(point) if *point == MID));
    assert!(error.is_configuration_error());
    assert_eq!(
        h.coordinator.release(&first, ReleaseOutcome::Failed).await.unwrap(),
        ReleaseAction::Unlocked
    );

    let resumed = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    assert_eq!(resumed.kind(), AdmissionKind::Resumed);

    let stages = two_stages(&started_calls, &mid_calls, false);
    let response = h.coordinator.proceed(&resumed, &stages).await.unwrap();
    assert_eq!(response.body, json!({"body": "B"}));
    assert_eq!(started_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mid_calls.load(Ordering::SeqCst), 1);

    let stored = h.store.get(&record_key()).await.unwrap();
    assert_eq!(stored.response_body.as_deref(), Some(r#"{"body":"B"}"#));
}

#[tokio::test]
async fn test_exempt_status_deletes_record() {
    let h = harness(IdempotencyConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = single_stage(&calls, 400, json!({"message": "invalid quantity"}));

    let first = admitted(h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap());
    let response = h.coordinator.proceed(&first, &stages).await.unwrap();
    assert_eq!(response.status_code, 400);
    assert_eq!(
        h.coordinator.release(&first, ReleaseOutcome::Completed).await.unwrap(),
        ReleaseAction::Deleted
    );
    assert!(h.store.is_empty().await);

    let retry = admitted(h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap());
    assert_eq!(retry.kind(), AdmissionKind::Fresh);
}

#[tokio::test]
async fn test_non_exempt_client_error_is_cached() {
    let h = harness(IdempotencyConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = single_stage(&calls, 422, json!({"message": "unprocessable"}));

    let first = admitted(h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap());
    h.coordinator.proceed(&first, &stages).await.unwrap();
    h.coordinator.release(&first, ReleaseOutcome::Completed).await.unwrap();

    let replay = admitted(h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap());
    assert_eq!(replay.kind(), AdmissionKind::Replay);
    assert_eq!(h.coordinator.proceed(&replay, &stages).await.unwrap().status_code, 422);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_always_policy_allows_immediate_retry_after_failure() {
    let h = harness(IdempotencyConfig::default());
    let started_calls = Arc::new(AtomicUsize::new(0));
    let mid_calls = Arc::new(AtomicUsize::new(0));

    let first = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    let outcome = h
        .coordinator
        .proceed(&first, &two_stages(&started_calls, &mid_calls, true))
        .await;
    assert_eq!(
        h.coordinator
            .release(&first, ReleaseOutcome::from_result(&outcome))
            .await
            .unwrap(),
        ReleaseAction::Unlocked
    );

    let retry = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    assert_eq!(retry.kind(), AdmissionKind::Resumed);
    assert_eq!(retry.record().recovery_point, MID);
}

#[tokio::test]
async fn test_hold_on_error_policy_keeps_lock_until_timeout() {
    let config = IdempotencyConfig::builder()
        .release_policy(LockReleasePolicy::HoldOnError)
        .lock_timeout(Duration::from_secs(60))
        .build();
    let h = harness(config);
    let started_calls = Arc::new(AtomicUsize::new(0));
    let mid_calls = Arc::new(AtomicUsize::new(0));

    let first = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    let outcome = h
        .coordinator
        .proceed(&first, &two_stages(&started_calls, &mid_calls, true))
        .await;
    assert_eq!(
        h.coordinator
            .release(&first, ReleaseOutcome::from_result(&outcome))
            .await
            .unwrap(),
        ReleaseAction::Held
    );

    let too_soon = h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap();
    assert_eq!(too_soon, Decision::Conflict(ConflictReason::InProgress));

    h.clock.advance(chrono::Duration::seconds(60));
    let resumed = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    assert_eq!(resumed.kind(), AdmissionKind::Resumed);
}

#[tokio::test]
async fn test_reclaimed_lock_is_detected_by_original_holder() {
    let h = harness(IdempotencyConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = single_stage(&calls, 201, json!({"id": 7}));

    let stalled = admitted(h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap());

    h.clock.advance(chrono::Duration::seconds(600));
    let takeover = admitted(h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap());
    assert_eq!(takeover.kind(), AdmissionKind::Resumed);

    let error = h.coordinator.proceed(&stalled, &stages).await.unwrap_err();
    assert!(matches!(error, IdempotencyError::LockLost { .. }));
    assert_eq!(
        h.coordinator.release(&stalled, ReleaseOutcome::Failed).await.unwrap(),
        ReleaseAction::Superseded
    );

    let response = h.coordinator.proceed(&takeover, &stages).await.unwrap();
    assert_eq!(response.status_code, 201);
    assert_eq!(
        h.coordinator.release(&takeover, ReleaseOutcome::Completed).await.unwrap(),
        ReleaseAction::Unlocked
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_requests_outside_the_protocol_are_not_applicable() {
    let h = harness(IdempotencyConfig::default());

    let get = request(http::Method::GET, "/orders", "", KEY);
    assert_eq!(h.coordinator.admit(&get).await.unwrap(), Decision::NotApplicable);

    let delete = request(http::Method::DELETE, "/orders/1", "", KEY);
    assert_eq!(h.coordinator.admit(&delete).await.unwrap(), Decision::NotApplicable);

    let no_key = idempotency_core::IncomingRequest::new(http::Method::POST, "/orders", "{}");
    assert_eq!(h.coordinator.admit(&no_key).await.unwrap(), Decision::NotApplicable);

    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_malformed_key_follows_policy() {
    let strict = harness(IdempotencyConfig::default());
    let decision = strict.coordinator.admit(&post("/orders", "{}", "not-a-uuid")).await.unwrap();
    assert!(matches!(decision, Decision::InvalidKey(_)));

    let lenient = harness(IdempotencyConfig::builder().reject_malformed_keys(false).build());
    let decision = lenient.coordinator.admit(&post("/orders", "{}", "not-a-uuid")).await.unwrap();
    assert_eq!(decision, Decision::NotApplicable);
    assert!(lenient.store.is_empty().await);
}

#[tokio::test]
async fn test_keys_are_scoped_per_owner() {
    let h = harness(IdempotencyConfig::default());

    let alice = h
        .coordinator
        .admit(&post("/orders", "{}", KEY).with_owner("alice"))
        .await
        .unwrap();
    let bob = h
        .coordinator
        .admit(&post("/orders", r#"{"different":true}"#, KEY).with_owner("bob"))
        .await
        .unwrap();

    assert_eq!(admitted(alice).kind(), AdmissionKind::Fresh);
    assert_eq!(admitted(bob).kind(), AdmissionKind::Fresh);
    assert_eq!(h.store.len().await, 2);
}

#[tokio::test]
async fn test_single_stage_rejects_custom_recovery_point() {
    let h = harness(IdempotencyConfig::default());
    let started_calls = Arc::new(AtomicUsize::new(0));
    let mid_calls = Arc::new(AtomicUsize::new(0));

    let first = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    let _ = h
        .coordinator
        .proceed(&first, &two_stages(&started_calls, &mid_calls, true))
        .await;
    h.coordinator.release(&first, ReleaseOutcome::Failed).await.unwrap();

    let resumed = admitted(h.coordinator.admit(&post("/charges", "{}", KEY)).await.unwrap());
    let error = h
        .coordinator
        .proceed_single(&resumed, |_tx| {
            Box::pin(async { Ok(StageOutcome::finish(201, json!({}))) })
        })
        .await
        .unwrap_err();
    assert!(matches!(error, IdempotencyError::UnexpectedRecoveryPoint(point) if point == MID));
}

#[tokio::test]
async fn test_proceed_single_runs_handler_once() {
    let h = harness(IdempotencyConfig::default());
    let calls = AtomicUsize::new(0);

    for expected_kind in [AdmissionKind::Fresh, AdmissionKind::Replay] {
        let key = admitted(h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap());
        assert_eq!(key.kind(), expected_kind);
        let response = h
            .coordinator
            .proceed_single(&key, |_tx| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(StageOutcome::finish(201, json!({"id": 7}))) })
            })
            .await
            .unwrap();
        assert_eq!(response.body, json!({"id": 7}));
        h.coordinator.release(&key, ReleaseOutcome::Completed).await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_purge_finished_records_by_age() {
    let h = harness(IdempotencyConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = single_stage(&calls, 201, json!({"id": 7}));

    let first = admitted(h.coordinator.admit(&post("/orders", "{}", KEY)).await.unwrap());
    h.coordinator.proceed(&first, &stages).await.unwrap();
    h.coordinator.release(&first, ReleaseOutcome::Completed).await.unwrap();

    assert_eq!(
        h.coordinator.purge_finished_before(Duration::from_secs(3600)).await.unwrap(),
        0
    );
    h.clock.advance(chrono::Duration::hours(2));
    assert_eq!(
        h.coordinator.purge_finished_before(Duration::from_secs(3600)).await.unwrap(),
        1
    );
    assert!(h.store.is_empty().await);
}
