use ret_core::{MessageId, ResolutionState, TrackerError};
use ret_test_utils::{
    inbound, minutes, three_stage_policy, TestHarness, CONVERSATION, EMPLOYEE, OTHER_EMPLOYEE,
    SENDER,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn resolve_is_idempotent() {
    let h = TestHarness::new(three_stage_policy());
    h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();

    assert!(h.registry.resolve(CONVERSATION, EMPLOYEE).await.unwrap().is_some());
    assert!(h.registry.resolve(CONVERSATION, EMPLOYEE).await.unwrap().is_none());
    assert!(h.registry.resolve(CONVERSATION, EMPLOYEE).await.unwrap().is_none());
    assert_eq!(h.registry.stats().resolved, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_duplicate_tracks_register_once() {
    let h = TestHarness::new(three_stage_policy());
    let message = inbound(1);

    let (a, b) = tokio::join!(
        h.registry.track(&message, EMPLOYEE),
        h.registry.track(&message, EMPLOYEE)
    );
    assert_eq!(a.unwrap().key(), b.unwrap().key());
    assert_eq!(h.registry.tracked_count(), 1);
    assert_eq!(h.registry.stats().stages.armed, 3);

    tokio::time::sleep(minutes(31)).await;
    assert_eq!(h.notifier.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn responded_never_reverts_to_pending() {
    let h = TestHarness::new(three_stage_policy());
    let handle = h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();
    h.registry.resolve(CONVERSATION, EMPLOYEE).await.unwrap();

    // Same message seen again, e.g. a redelivered update
    h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();
    h.registry.abandon(&handle.key()).await;

    let record = h.record(&handle.key()).unwrap();
    assert_eq!(record.state, ResolutionState::Responded);
    assert!(!h.registry.is_tracking(&handle.key()));

    tokio::time::sleep(minutes(31)).await;
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_create_registers_nothing() {
    let h = TestHarness::new(three_stage_policy());
    h.store.fail_create(true);

    let err = h.registry.track(&inbound(1), EMPLOYEE).await.unwrap_err();
    assert!(matches!(err, TrackerError::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(h.registry.tracked_count(), 0);

    tokio::time::sleep(minutes(31)).await;
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_responded_write_keeps_timers() {
    let h = TestHarness::new(three_stage_policy());
    let handle = h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();

    tokio::time::sleep(minutes(2)).await;
    h.store.fail_mark_responded(true);
    let err = h.registry.resolve(CONVERSATION, EMPLOYEE).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(h.registry.is_tracking(&handle.key()));
    assert_eq!(handle.armed_count(), 3);

    // Still unresolved, so the first stage fires
    tokio::time::sleep(minutes(4)).await;
    assert_eq!(h.notifier.labels(), vec!["w1"]);

    h.store.fail_mark_responded(false);
    let resolution = h
        .registry
        .resolve(CONVERSATION, EMPLOYEE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolution.canceled_stages, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_lookup_surfaces_to_caller() {
    let h = TestHarness::new(three_stage_policy());
    h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();
    h.store.fail_reads(true);

    let err = h.registry.resolve(CONVERSATION, EMPLOYEE).await.unwrap_err();
    assert!(matches!(err, TrackerError::StoreUnavailable(_)));
    assert_eq!(h.registry.tracked_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn broadcast_copies_resolve_independently() {
    let h = TestHarness::new(three_stage_policy());
    let mine = h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();
    let theirs = h.registry.track(&inbound(1), OTHER_EMPLOYEE).await.unwrap();
    assert_eq!(mine.key().message_key(), theirs.key().message_key());

    tokio::time::sleep(minutes(7)).await;
    h.registry.resolve(CONVERSATION, EMPLOYEE).await.unwrap();

    tokio::time::sleep(minutes(30)).await;
    assert_eq!(h.notifier.count_for(&mine.key()), 1);
    assert_eq!(h.notifier.count_for(&theirs.key()), 3);
    assert!(h.record(&theirs.key()).unwrap().is_pending());
    // The unanswered copy is released once its stages are spent
    assert_eq!(h.registry.tracked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_messages_do_not_accumulate() {
    let h = TestHarness::new(three_stage_policy());
    for msg in 1..=50 {
        h.registry.track(&inbound(msg), EMPLOYEE).await.unwrap();
    }
    assert_eq!(h.registry.tracked_count(), 50);

    tokio::time::sleep(minutes(31)).await;
    assert_eq!(h.notifier.count(), 150);
    assert_eq!(h.registry.tracked_count(), 0);
    assert_eq!(h.registry.stats().completed, 50);

    // Redelivered after release: no second round of alerts
    h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();
    tokio::time::sleep(minutes(31)).await;
    assert_eq!(h.notifier.count(), 150);
    assert_eq!(h.registry.stats().tracked, 50);
}

#[tokio::test(start_paused = true)]
async fn concurrent_replies_resolve_every_pending_message() {
    let h = TestHarness::new(three_stage_policy());
    for msg in 1..=5 {
        h.registry.track(&inbound(msg), EMPLOYEE).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
    // Every caller sees the same newest candidate before any claims it
    h.store.yield_on_reads(true);

    let resolve = || h.registry.resolve(CONVERSATION, EMPLOYEE);
    let (a, b, c, d, e) = tokio::join!(resolve(), resolve(), resolve(), resolve(), resolve());

    let mut resolved: Vec<_> = [a, b, c, d, e]
        .into_iter()
        .map(|r| r.unwrap().expect("every reply claims a message").key.message)
        .collect();
    resolved.sort();
    assert_eq!(resolved, (1..=5).map(MessageId).collect::<Vec<_>>());
    assert_eq!(h.registry.tracked_count(), 0);
    assert_eq!(h.registry.stats().resolved, 5);

    tokio::time::sleep(minutes(31)).await;
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn resolve_targets_most_recent_message() {
    let h = TestHarness::new(three_stage_policy());
    let older = h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    let newer = h.registry.track(&inbound(2), EMPLOYEE).await.unwrap();

    let first = h
        .registry
        .resolve(CONVERSATION, EMPLOYEE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.key, newer.key());
    assert!(h.registry.is_tracking(&older.key()));

    let second = h
        .registry
        .resolve(CONVERSATION, EMPLOYEE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.key, older.key());
    assert!((second.latency_minutes - 0.5).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn resolve_sender_clears_every_message_from_sender() {
    let h = TestHarness::new(three_stage_policy());
    for msg in 1..=3 {
        h.registry.track(&inbound(msg), EMPLOYEE).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    }

    let resolved = h
        .registry
        .resolve_sender(CONVERSATION, EMPLOYEE, SENDER)
        .await
        .unwrap();
    let latencies: Vec<_> = resolved.iter().map(|r| r.latency_minutes.round()).collect();
    assert_eq!(latencies, vec![3.0, 2.0, 1.0]);
    assert_eq!(h.registry.tracked_count(), 0);

    tokio::time::sleep(minutes(31)).await;
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn abandon_stops_alerts_but_keeps_pending() {
    let h = TestHarness::new(three_stage_policy());
    let handle = h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();

    tokio::time::sleep(minutes(6)).await;
    assert!(h.registry.abandon(&handle.key()).await);

    tokio::time::sleep(minutes(30)).await;
    assert_eq!(h.notifier.count(), 1);
    assert!(h.record(&handle.key()).unwrap().is_pending());
    assert!(!h.registry.is_tracking(&handle.key()));
}

#[tokio::test(start_paused = true)]
async fn deactivation_and_shutdown_abandon_entries() {
    let h = TestHarness::new(three_stage_policy());
    h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();
    h.registry.track(&inbound(2), EMPLOYEE).await.unwrap();
    h.registry.track(&inbound(1), OTHER_EMPLOYEE).await.unwrap();

    assert_eq!(h.registry.abandon_employee(EMPLOYEE).await, 2);
    assert_eq!(h.registry.tracked_count(), 1);

    assert_eq!(h.registry.shutdown().await, 1);
    assert_eq!(h.registry.tracked_count(), 0);

    tokio::time::sleep(minutes(31)).await;
    assert_eq!(h.notifier.count(), 0);
    assert_eq!(h.registry.stats().abandoned, 3);
}
