//! Testing utilities for RET workspace
//!
//! Shared test helpers, fixtures, and collaborator doubles.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ret_core::{
    ConversationId, DelayPolicy, DeliveryError, EmployeeId, EscalationAlert, InMemoryDirectory,
    InMemoryMessageStore, InboundMessage, MessageId, MessageStore, NewTrackedMessage, Notifier,
    NotificationRecord, PolicySettings, ResolutionState, Sender, SenderId, SharedPolicySource,
    StageSpec, StoreError, TrackedMessage, TrackerRegistry, TrackingKey,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Employee every harness marks active
pub const EMPLOYEE: EmployeeId = EmployeeId(1);
/// Second active employee, for broadcast tests
pub const OTHER_EMPLOYEE: EmployeeId = EmployeeId(2);
/// Conversation used by [`inbound`]
pub const CONVERSATION: ConversationId = ConversationId(100);
/// Sender used by [`inbound`]
pub const SENDER: SenderId = SenderId(500);

/// One delivery seen by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub recipient: EmployeeId,
    pub stage_label: String,
    pub key: TrackingKey,
    /// Time since the notifier was created
    pub at: Duration,
}

/// Notifier that records deliveries and can fail chosen stages
#[derive(Debug)]
pub struct RecordingNotifier {
    origin: Instant,
    deliveries: Mutex<Vec<Delivery>>,
    failing: Mutex<HashSet<String>>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            deliveries: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Reject every alert for `label`
    pub fn fail_stage(&self, label: &str) {
        self.failing.lock().insert(label.to_string());
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .iter()
            .map(|d| d.stage_label.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn count_for(&self, key: &TrackingKey) -> usize {
        self.deliveries.lock().iter().filter(|d| d.key == *key).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(
        &self,
        recipient: EmployeeId,
        stage_label: &str,
        alert: &EscalationAlert,
    ) -> Result<(), DeliveryError> {
        if self.failing.lock().contains(stage_label) {
            return Err(DeliveryError::Rejected(format!("stage {stage_label} refused")));
        }
        self.deliveries.lock().push(Delivery {
            recipient,
            stage_label: stage_label.to_string(),
            key: alert.key,
            at: Instant::now().saturating_duration_since(self.origin),
        });
        Ok(())
    }
}

/// Notifier whose deliveries never complete
#[derive(Debug, Default)]
pub struct StallingNotifier;

#[async_trait]
impl Notifier for StallingNotifier {
    async fn deliver(
        &self,
        _recipient: EmployeeId,
        _stage_label: &str,
        _alert: &EscalationAlert,
    ) -> Result<(), DeliveryError> {
        std::future::pending().await
    }
}

/// Notifier that parks every delivery until released, then records it
#[derive(Debug, Default)]
pub struct GatedNotifier {
    recorder: RecordingNotifier,
    entered: Notify,
    release: Notify,
}

impl GatedNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a delivery is parked inside `deliver`
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Let one parked (or the next) delivery through
    pub fn release_one(&self) {
        self.release.notify_one();
    }

    /// Deliveries that went through
    pub fn recorder(&self) -> &RecordingNotifier {
        &self.recorder
    }
}

#[async_trait]
impl Notifier for GatedNotifier {
    async fn deliver(
        &self,
        recipient: EmployeeId,
        stage_label: &str,
        alert: &EscalationAlert,
    ) -> Result<(), DeliveryError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.recorder.deliver(recipient, stage_label, alert).await
    }
}

/// Store wrapper that fails chosen operations as unavailable, and can
/// yield to the scheduler before reads
#[derive(Debug, Default)]
pub struct FlakyStore<S> {
    inner: S,
    fail_create: AtomicBool,
    fail_mark: AtomicBool,
    fail_reads: AtomicBool,
    fail_audit: AtomicBool,
    yield_reads: AtomicBool,
}

impl<S: MessageStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_create: AtomicBool::new(false),
            fail_mark: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_audit: AtomicBool::new(false),
            yield_reads: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mark_responded(&self, fail: bool) {
        self.fail_mark.store(fail, Ordering::SeqCst);
    }

    /// Fail `get_state` and both finders
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_audit(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// Yield once before `get_state` and `find_latest_pending`, letting
    /// concurrent callers interleave between lookup and claim
    pub fn yield_on_reads(&self, on: bool) {
        self.yield_reads.store(on, Ordering::SeqCst);
    }

    async fn maybe_yield(&self) {
        if self.yield_reads.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{op}: connection refused")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: MessageStore> MessageStore for FlakyStore<S> {
    async fn create_pending(
        &self,
        new: NewTrackedMessage,
    ) -> Result<(TrackedMessage, bool), StoreError> {
        Self::check(&self.fail_create, "create_pending")?;
        self.inner.create_pending(new).await
    }

    async fn mark_responded(
        &self,
        key: &TrackingKey,
        responded_at: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        Self::check(&self.fail_mark, "mark_responded")?;
        self.inner.mark_responded(key, responded_at).await
    }

    async fn get_state(&self, key: &TrackingKey) -> Result<ResolutionState, StoreError> {
        Self::check(&self.fail_reads, "get_state")?;
        self.maybe_yield().await;
        self.inner.get_state(key).await
    }

    async fn find_latest_pending(
        &self,
        conversation: ConversationId,
        employee: EmployeeId,
    ) -> Result<Option<TrackingKey>, StoreError> {
        Self::check(&self.fail_reads, "find_latest_pending")?;
        self.maybe_yield().await;
        self.inner.find_latest_pending(conversation, employee).await
    }

    async fn find_pending_from_sender(
        &self,
        conversation: ConversationId,
        employee: EmployeeId,
        sender: SenderId,
    ) -> Result<Vec<TrackingKey>, StoreError> {
        Self::check(&self.fail_reads, "find_pending_from_sender")?;
        self.inner
            .find_pending_from_sender(conversation, employee, sender)
            .await
    }

    async fn record_notification(&self, record: NotificationRecord) -> Result<(), StoreError> {
        Self::check(&self.fail_audit, "record_notification")?;
        self.inner.record_notification(record).await
    }
}

/// Inbound message `msg` in [`CONVERSATION`] from [`SENDER`]
pub fn inbound(msg: i64) -> InboundMessage {
    InboundMessage::new(CONVERSATION, MessageId(msg))
        .with_sender(Sender::new(SENDER).with_username("client"))
        .with_text(format!("message {msg}"))
}

/// Policy settings from `(minutes, label)` pairs
pub fn policy_minutes(stages: &[(u64, &str)]) -> PolicySettings {
    PolicySettings::with_stages(
        stages
            .iter()
            .map(|(m, label)| StageSpec::minutes(*label, *m))
            .collect(),
    )
}

/// The 5 / 15 / 30 minute policy used by most scenarios
pub fn three_stage_policy() -> PolicySettings {
    policy_minutes(&[(5, "w1"), (15, "w2"), (30, "w3")])
}

pub fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

/// Registry wired over in-memory collaborators
pub struct TestHarness {
    pub store: Arc<FlakyStore<InMemoryMessageStore>>,
    pub notifier: Arc<RecordingNotifier>,
    pub directory: Arc<InMemoryDirectory>,
    pub policy_source: Arc<SharedPolicySource>,
    pub registry: TrackerRegistry,
}

impl TestHarness {
    /// Harness over `settings`, re-read on every track
    pub fn new(settings: PolicySettings) -> Self {
        Self::with_delivery_timeout(settings, Duration::from_secs(10))
    }

    pub fn with_delivery_timeout(settings: PolicySettings, timeout: Duration) -> Self {
        let store = Arc::new(FlakyStore::new(InMemoryMessageStore::new()));
        let notifier = Arc::new(RecordingNotifier::new());
        let directory = Arc::new(InMemoryDirectory::with_active([EMPLOYEE, OTHER_EMPLOYEE]));
        let policy_source = Arc::new(SharedPolicySource::new(settings));

        let registry = TrackerRegistry::builder(store.clone(), notifier.clone(), directory.clone())
            .with_policy(DelayPolicy::new(policy_source.clone(), Duration::ZERO))
            .with_delivery_timeout(timeout)
            .build();

        Self {
            store,
            notifier,
            directory,
            policy_source,
            registry,
        }
    }

    /// Persisted record for `key`
    pub fn record(&self, key: &TrackingKey) -> Option<TrackedMessage> {
        self.store.inner().record(key)
    }

    /// Audit records written so far
    pub fn audit(&self) -> Vec<NotificationRecord> {
        self.store.inner().notifications()
    }
}
