//! Escalation scheduler
//!
//! Arms one independent timer per policy stage for a tracked message:
//! - every timer sleeps from tracking start to its own threshold
//! - a timer still sleeping is stopped by [`EscalationHandle::cancel_all`]
//! - a timer that woke re-reads the store before acting, so a reply that
//!   lands between arming and firing is never followed by an alert
//!
//! Each stage fires at most once. Delivery failures are logged and end that
//! stage; nothing is retried. Once every stage of a handle has fired, the
//! optional [`FinishedHook`] passed to [`EscalationScheduler::start_observed`]
//! runs exactly once.

use crate::alert::EscalationAlert;
use crate::clock::Clock;
use crate::directory::SharedDirectory;
use crate::error::{DeliveryError, DirectoryError};
use crate::notifier::SharedNotifier;
use crate::policy::{PolicySnapshot, Stage};
use crate::state::ResolutionState;
use crate::store::SharedMessageStore;
use crate::types::{NotificationRecord, TrackedMessage, TrackingKey};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default bound on a single notifier call
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Called from the last timer task once every stage of a handle has fired.
/// Never called for a handle that had a stage canceled.
pub type FinishedHook = Arc<dyn Fn(&EscalationHandle) + Send + Sync>;

/// What happened when a stage fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Alert delivered
    Delivered,
    /// Message no longer pending
    SkippedResolved,
    /// Employee inactive at fire time
    SkippedInactive,
    /// Employee unknown to the directory
    SkippedUnknownEmployee,
    /// Notifier failed or timed out
    DeliveryFailed,
    /// Store re-check failed; the stage is lost
    StoreFailed,
    /// Directory lookup failed; the stage is lost
    DirectoryFailed,
}

impl StageOutcome {
    fn metric_reason(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::SkippedResolved => "resolved",
            Self::SkippedInactive => "inactive",
            Self::SkippedUnknownEmployee => "unknown_employee",
            Self::DeliveryFailed => "delivery",
            Self::StoreFailed => "store",
            Self::DirectoryFailed => "directory",
        }
    }
}

/// Lifecycle of one stage timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    /// Sleeping until its threshold
    Armed,
    /// Woke up and is running its fire path
    Firing,
    /// Fire path finished
    Fired(StageOutcome),
    /// Stopped before it woke
    Canceled,
}

#[derive(Debug)]
struct StageTimer {
    stage: Stage,
    state: Mutex<TimerState>,
}

impl StageTimer {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            state: Mutex::new(TimerState::Armed),
        }
    }

    /// Armed -> Firing; false if the timer was canceled first
    fn begin_fire(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TimerState::Armed {
            *state = TimerState::Firing;
            true
        } else {
            false
        }
    }

    /// Armed -> Canceled; false if the timer already woke
    fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TimerState::Armed {
            *state = TimerState::Canceled;
            true
        } else {
            false
        }
    }

    fn finish(&self, outcome: StageOutcome) {
        *self.state.lock() = TimerState::Fired(outcome);
    }

    fn state(&self) -> TimerState {
        *self.state.lock()
    }
}

struct HandleInner {
    key: TrackingKey,
    token: CancellationToken,
    timers: Vec<Arc<StageTimer>>,
    fired: AtomicUsize,
    on_finished: Option<FinishedHook>,
    stats: Arc<SchedulerStats>,
}

/// Cancellation handle for the timers of one tracked message
#[derive(Clone)]
pub struct EscalationHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for EscalationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationHandle")
            .field("key", &self.inner.key)
            .field("stages", &self.stages())
            .finish_non_exhaustive()
    }
}

impl EscalationHandle {
    /// Message the timers belong to
    #[inline]
    #[must_use]
    pub fn key(&self) -> TrackingKey {
        self.inner.key
    }

    /// Whether both handles control the same set of timers
    #[inline]
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Cancel every timer that has not woken yet.
    ///
    /// Returns how many timers this call canceled. Timers already fired,
    /// firing or canceled are left alone; a timer mid-fire completes and
    /// relies on its store re-check.
    pub fn cancel_all(&self) -> usize {
        let canceled = self.inner.timers.iter().filter(|t| t.cancel()).count();
        self.inner.token.cancel();
        if canceled > 0 {
            self.inner
                .stats
                .canceled
                .fetch_add(canceled as u64, Ordering::Relaxed);
            metrics::counter!("ret_stage_canceled_total").increment(canceled as u64);
        }
        canceled
    }

    /// Whether `cancel_all` has been called
    #[inline]
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Label and state of every stage, in policy order
    #[must_use]
    pub fn stages(&self) -> Vec<(String, TimerState)> {
        self.inner
            .timers
            .iter()
            .map(|t| (t.stage.label.clone(), t.state()))
            .collect()
    }

    /// State of one stage
    #[must_use]
    pub fn stage_state(&self, label: &str) -> Option<TimerState> {
        self.inner
            .timers
            .iter()
            .find(|t| t.stage.label == label)
            .map(|t| t.state())
    }

    /// Number of stages armed for this message
    #[inline]
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.inner.timers.len()
    }

    /// Number of timers still sleeping
    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.inner
            .timers
            .iter()
            .filter(|t| t.state() == TimerState::Armed)
            .count()
    }

    /// Whether no timer is sleeping or firing
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner
            .timers
            .iter()
            .all(|t| matches!(t.state(), TimerState::Fired(_) | TimerState::Canceled))
    }

    /// Count one finished fire path; the last one runs the hook
    fn stage_fired(&self) {
        let fired = self.inner.fired.fetch_add(1, Ordering::AcqRel) + 1;
        if fired != self.inner.timers.len() {
            return;
        }
        tracing::debug!(key = %self.inner.key, "Every stage fired");
        if let Some(hook) = &self.inner.on_finished {
            hook(self);
        }
    }
}

/// Counters across every stage the scheduler armed
#[derive(Debug, Default)]
pub struct SchedulerStats {
    armed: AtomicU64,
    delivered: AtomicU64,
    skipped_resolved: AtomicU64,
    skipped_inactive: AtomicU64,
    skipped_unknown_employee: AtomicU64,
    delivery_failed: AtomicU64,
    store_failed: AtomicU64,
    directory_failed: AtomicU64,
    canceled: AtomicU64,
}

impl SchedulerStats {
    fn record(&self, outcome: StageOutcome) {
        let counter = match outcome {
            StageOutcome::Delivered => &self.delivered,
            StageOutcome::SkippedResolved => &self.skipped_resolved,
            StageOutcome::SkippedInactive => &self.skipped_inactive,
            StageOutcome::SkippedUnknownEmployee => &self.skipped_unknown_employee,
            StageOutcome::DeliveryFailed => &self.delivery_failed,
            StageOutcome::StoreFailed => &self.store_failed,
            StageOutcome::DirectoryFailed => &self.directory_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        match outcome {
            StageOutcome::Delivered => metrics::counter!("ret_stage_delivered_total").increment(1),
            StageOutcome::SkippedResolved
            | StageOutcome::SkippedInactive
            | StageOutcome::SkippedUnknownEmployee => {
                metrics::counter!("ret_stage_skipped_total", "reason" => outcome.metric_reason())
                    .increment(1);
            }
            StageOutcome::DeliveryFailed
            | StageOutcome::StoreFailed
            | StageOutcome::DirectoryFailed => {
                metrics::counter!("ret_stage_failed_total", "reason" => outcome.metric_reason())
                    .increment(1);
            }
        }
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> StageStats {
        StageStats {
            armed: self.armed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            skipped_resolved: self.skipped_resolved.load(Ordering::Relaxed),
            skipped_inactive: self.skipped_inactive.load(Ordering::Relaxed),
            skipped_unknown_employee: self.skipped_unknown_employee.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
            store_failed: self.store_failed.load(Ordering::Relaxed),
            directory_failed: self.directory_failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
        }
    }
}

/// Stage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    /// Timers armed
    pub armed: u64,
    /// Alerts delivered
    pub delivered: u64,
    /// Fires skipped because the message was resolved
    pub skipped_resolved: u64,
    /// Fires skipped because the employee was inactive
    pub skipped_inactive: u64,
    /// Fires skipped because the employee was unknown
    pub skipped_unknown_employee: u64,
    /// Notifier failures and timeouts
    pub delivery_failed: u64,
    /// Stages lost to store failures
    pub store_failed: u64,
    /// Stages lost to directory failures
    pub directory_failed: u64,
    /// Timers canceled while sleeping
    pub canceled: u64,
}

struct FireContext {
    store: SharedMessageStore,
    notifier: SharedNotifier,
    directory: SharedDirectory,
    clock: Clock,
    delivery_timeout: Duration,
    stats: Arc<SchedulerStats>,
}

/// Arms and fires stage timers
#[derive(Clone)]
pub struct EscalationScheduler {
    ctx: Arc<FireContext>,
}

impl std::fmt::Debug for EscalationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationScheduler")
            .field("delivery_timeout", &self.ctx.delivery_timeout)
            .finish_non_exhaustive()
    }
}

impl EscalationScheduler {
    /// Create scheduler over the given collaborators
    #[must_use]
    pub fn new(
        store: SharedMessageStore,
        notifier: SharedNotifier,
        directory: SharedDirectory,
        clock: Clock,
    ) -> Self {
        Self {
            ctx: Arc::new(FireContext {
                store,
                notifier,
                directory,
                clock,
                delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
                stats: Arc::new(SchedulerStats::default()),
            }),
        }
    }

    /// With a different notifier timeout
    #[must_use]
    pub fn with_delivery_timeout(self, timeout: Duration) -> Self {
        let ctx = &self.ctx;
        Self {
            ctx: Arc::new(FireContext {
                store: Arc::clone(&ctx.store),
                notifier: Arc::clone(&ctx.notifier),
                directory: Arc::clone(&ctx.directory),
                clock: ctx.clock,
                delivery_timeout: timeout,
                stats: Arc::clone(&ctx.stats),
            }),
        }
    }

    /// Stage counters
    #[must_use]
    pub fn stats(&self) -> StageStats {
        self.ctx.stats.snapshot()
    }

    /// Arm one timer per stage of `policy` for `message`.
    ///
    /// Every deadline is measured from this call. A disabled policy arms
    /// nothing and returns an inert handle. Must be called from within a
    /// tokio runtime.
    #[must_use]
    pub fn start(&self, message: &TrackedMessage, policy: &PolicySnapshot) -> EscalationHandle {
        self.arm(message, policy, None)
    }

    /// As [`Self::start`], running `on_finished` once every stage has fired
    #[must_use]
    pub fn start_observed(
        &self,
        message: &TrackedMessage,
        policy: &PolicySnapshot,
        on_finished: FinishedHook,
    ) -> EscalationHandle {
        self.arm(message, policy, Some(on_finished))
    }

    fn arm(
        &self,
        message: &TrackedMessage,
        policy: &PolicySnapshot,
        on_finished: Option<FinishedHook>,
    ) -> EscalationHandle {
        let started_at = Instant::now();
        let message = Arc::new(message.clone());

        let timers: Vec<Arc<StageTimer>> = policy
            .armed_stages()
            .iter()
            .map(|stage| Arc::new(StageTimer::new(stage.clone())))
            .collect();

        let handle = EscalationHandle {
            inner: Arc::new(HandleInner {
                key: message.key,
                token: CancellationToken::new(),
                timers,
                fired: AtomicUsize::new(0),
                on_finished,
                stats: Arc::clone(&self.ctx.stats),
            }),
        };

        for timer in &handle.inner.timers {
            let deadline = started_at + timer.stage.threshold;
            tokio::spawn(run_stage(
                Arc::clone(&self.ctx),
                Arc::clone(&message),
                handle.clone(),
                Arc::clone(timer),
                deadline,
            ));
        }

        let stages = handle.stage_count();
        if stages > 0 {
            self.ctx
                .stats
                .armed
                .fetch_add(stages as u64, Ordering::Relaxed);
        }
        tracing::debug!(
            conversation = %message.key.conversation,
            message = %message.key.message,
            employee = %message.key.employee,
            stages,
            "Escalation armed"
        );
        handle
    }
}

/// One stage timer (runs in its own tokio task)
async fn run_stage(
    ctx: Arc<FireContext>,
    message: Arc<TrackedMessage>,
    handle: EscalationHandle,
    timer: Arc<StageTimer>,
    deadline: Instant,
) {
    tokio::select! {
        biased;
        () = handle.inner.token.cancelled() => {
            tracing::trace!(key = %message.key, stage = %timer.stage.label, "Stage canceled while sleeping");
            return;
        }
        () = tokio::time::sleep_until(deadline) => {}
    }

    if !timer.begin_fire() {
        return;
    }
    let outcome = ctx.fire(&message, &timer.stage).await;
    ctx.stats.record(outcome);
    timer.finish(outcome);
    handle.stage_fired();
}

impl FireContext {
    async fn fire(&self, message: &TrackedMessage, stage: &Stage) -> StageOutcome {
        let key = message.key;
        let label = stage.label.as_str();

        // Fresh read: the reply may have landed after the timer was armed
        match self.store.get_state(&key).await {
            Ok(ResolutionState::Pending) => {}
            Ok(state) => {
                tracing::debug!(%key, stage = label, %state, "Stage fired after resolution");
                return StageOutcome::SkippedResolved;
            }
            Err(e) => {
                tracing::error!(%key, stage = label, error = %e, "Store re-check failed, stage dropped");
                return StageOutcome::StoreFailed;
            }
        }

        match self.directory.is_active(message.employee()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(%key, stage = label, "Employee inactive, alert suppressed");
                return StageOutcome::SkippedInactive;
            }
            Err(DirectoryError::NotFound(employee)) => {
                tracing::warn!(%key, stage = label, %employee, "Employee unknown, alert suppressed");
                return StageOutcome::SkippedUnknownEmployee;
            }
            Err(e) => {
                tracing::error!(%key, stage = label, error = %e, "Directory lookup failed, stage dropped");
                return StageOutcome::DirectoryFailed;
            }
        }

        let elapsed = (self.clock.now() - message.received_at)
            .to_std()
            .unwrap_or_default();
        let alert = EscalationAlert::new(message, stage, elapsed);

        let delivery = tokio::time::timeout(
            self.delivery_timeout,
            self.notifier.deliver(message.employee(), label, &alert),
        )
        .await
        .unwrap_or(Err(DeliveryError::TimedOut(self.delivery_timeout)));

        if let Err(e) = delivery {
            tracing::warn!(%key, stage = label, error = %e, "Alert delivery failed");
            return StageOutcome::DeliveryFailed;
        }

        tracing::info!(
            %key,
            stage = label,
            elapsed_secs = elapsed.as_secs(),
            "Alert delivered"
        );

        let record = NotificationRecord::new(key, label, self.clock.now());
        if let Err(e) = self.store.record_notification(record).await {
            tracing::warn!(%key, stage = label, error = %e, "Audit record not written");
        }
        StageOutcome::Delivered
    }
}
