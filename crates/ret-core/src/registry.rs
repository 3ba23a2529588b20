//! Tracker registry
//!
//! Process-wide map from tracked-message identity to its escalation handle.
//! Provides:
//! - Idempotent tracking (one handle per identity)
//! - Reply resolution with latency recording
//! - Abandonment without resolution (deactivation, shutdown)
//! - Release of entries whose every stage has fired
//! - Registry statistics
//!
//! An entry exists only while its message has an outstanding escalation.
//! `track`, `resolve` and `abandon` are mutually exclusive per identity.
//! Store writes happen before the registry changes: a record is created
//! before its handle is inserted, and marked responded before its timers
//! are canceled. A failed store write therefore leaves the registry as it
//! was.

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::directory::SharedDirectory;
use crate::error::TrackerError;
use crate::notifier::SharedNotifier;
use crate::policy::{DelayPolicy, PolicySnapshot, PolicySource, StaticPolicySource};
use crate::scheduler::{
    EscalationHandle, EscalationScheduler, FinishedHook, StageStats, DEFAULT_DELIVERY_TIMEOUT,
};
use crate::store::SharedMessageStore;
use crate::types::{
    ConversationId, EmployeeId, InboundMessage, NewTrackedMessage, SenderId, TrackingKey,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Outcome of resolving one tracked message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// Resolved message
    pub key: TrackingKey,
    /// When the reply was observed
    pub responded_at: DateTime<Utc>,
    /// Reply latency in minutes
    pub latency_minutes: f64,
    /// Timers canceled while still sleeping
    pub canceled_stages: usize,
}

/// Registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    /// Messages tracked
    pub tracked: u64,
    /// Messages resolved by a reply
    pub resolved: u64,
    /// Messages abandoned
    pub abandoned: u64,
    /// Entries released after every stage fired
    pub completed: u64,
    /// Entries currently in the registry
    pub active: usize,
    /// Stage counters
    pub stages: StageStats,
}

#[derive(Debug, Default)]
struct Counters {
    tracked: AtomicU64,
    resolved: AtomicU64,
    abandoned: AtomicU64,
    completed: AtomicU64,
}

/// Registry of tracked messages
pub struct TrackerRegistry {
    entries: Arc<DashMap<TrackingKey, EscalationHandle>>,
    locks: DashMap<TrackingKey, Arc<Mutex<()>>>,
    store: SharedMessageStore,
    policy: DelayPolicy,
    scheduler: EscalationScheduler,
    clock: Clock,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerRegistry")
            .field("entries", &self.entries.len())
            .field("policy", &self.policy)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl TrackerRegistry {
    /// Start building a registry over the given collaborators
    #[must_use]
    pub fn builder(
        store: SharedMessageStore,
        notifier: SharedNotifier,
        directory: SharedDirectory,
    ) -> RegistryBuilder {
        RegistryBuilder {
            store,
            notifier,
            directory,
            policy: None,
            clock: None,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    /// Begin tracking `message` for `employee`.
    ///
    /// Persists a pending record, captures the current policy and arms its
    /// stages. Tracking an identity that is already tracked returns the
    /// existing handle and changes nothing. A record the store already held
    /// gets an inert handle that is not registered, so a message is never
    /// armed twice. Neither is a message whose policy arms no stage.
    ///
    /// # Errors
    /// `TrackerError::StoreUnavailable` if the record cannot be created;
    /// nothing is registered in that case.
    pub async fn track(
        &self,
        message: &InboundMessage,
        employee: EmployeeId,
    ) -> Result<EscalationHandle, TrackerError> {
        let key = message.key_for(employee);
        let lock = self.identity_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.track_locked(key, message).await
        };
        drop(lock);
        self.release_lock(&key);
        result
    }

    async fn track_locked(
        &self,
        key: TrackingKey,
        message: &InboundMessage,
    ) -> Result<EscalationHandle, TrackerError> {
        if let Some(existing) = self.entries.get(&key) {
            tracing::debug!(%key, "Already tracking");
            return Ok(existing.clone());
        }

        let (record, created) = self
            .store
            .create_pending(NewTrackedMessage {
                key,
                received_at: message.received_at.unwrap_or_else(|| self.clock.now()),
                preview: message.preview(),
                sender: message.sender.clone(),
            })
            .await?;

        if !created {
            tracing::debug!(%key, state = %record.state, "Message seen before, not re-arming");
            return Ok(self.scheduler.start(&record, &PolicySnapshot::disabled()));
        }

        let policy = self.policy.snapshot().await;
        let handle = self
            .scheduler
            .start_observed(&record, &policy, self.finished_hook());
        if handle.stage_count() > 0 {
            self.entries.insert(key, handle.clone());
        }

        self.counters.tracked.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ret_tracked_total").increment(1);
        tracing::info!(
            conversation = %key.conversation,
            message = %key.message,
            employee = %key.employee,
            stages = handle.stage_count(),
            "Tracking message"
        );
        Ok(handle)
    }

    /// Removes the entry once its last stage fired, if it is still the
    /// registered one. Holds the map weakly: handles live inside it.
    fn finished_hook(&self) -> FinishedHook {
        let entries = Arc::downgrade(&self.entries);
        let counters = Arc::clone(&self.counters);
        Arc::new(move |handle: &EscalationHandle| {
            let Some(entries) = entries.upgrade() else {
                return;
            };
            let key = handle.key();
            if entries
                .remove_if(&key, |_, registered| registered.same_as(handle))
                .is_some()
            {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ret_completed_total").increment(1);
                tracing::debug!(%key, "Escalation complete, entry released");
            }
        })
    }

    /// Resolve the most recently received pending message for `employee` in
    /// `conversation`.
    ///
    /// Returns `None` when nothing is pending; a reply with nothing
    /// outstanding is not an error. A candidate claimed by a concurrent
    /// resolve is skipped for the next one; each such loss means the pending
    /// set shrank, so the loop ends.
    ///
    /// # Errors
    /// `TrackerError::StoreUnavailable` if the store cannot be read or
    /// written. Timers are left armed when the responded write fails.
    pub async fn resolve(
        &self,
        conversation: ConversationId,
        employee: EmployeeId,
    ) -> Result<Option<Resolution>, TrackerError> {
        loop {
            let Some(key) = self
                .store
                .find_latest_pending(conversation, employee)
                .await?
            else {
                tracing::debug!(%conversation, %employee, "Reply with nothing pending");
                return Ok(None);
            };

            if let Some(resolution) = self.resolve_key(key).await? {
                return Ok(Some(resolution));
            }
            tracing::trace!(%key, "Candidate resolved concurrently, looking again");
        }
    }

    /// Resolve every pending message from `sender` for `employee` in
    /// `conversation`, oldest first.
    ///
    /// # Errors
    /// As [`Self::resolve`]; messages resolved before the failure stay
    /// resolved.
    pub async fn resolve_sender(
        &self,
        conversation: ConversationId,
        employee: EmployeeId,
        sender: SenderId,
    ) -> Result<Vec<Resolution>, TrackerError> {
        let keys = self
            .store
            .find_pending_from_sender(conversation, employee, sender)
            .await?;

        let mut resolved = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(resolution) = self.resolve_key(key).await? {
                resolved.push(resolution);
            }
        }
        if resolved.is_empty() {
            tracing::debug!(%conversation, %employee, %sender, "Nothing pending from sender");
        }
        Ok(resolved)
    }

    /// Resolve one identity; `None` if it is no longer pending
    async fn resolve_key(&self, key: TrackingKey) -> Result<Option<Resolution>, TrackerError> {
        let lock = self.identity_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.resolve_locked(key).await
        };
        drop(lock);
        self.release_lock(&key);
        result
    }

    async fn resolve_locked(&self, key: TrackingKey) -> Result<Option<Resolution>, TrackerError> {
        if !self.store.get_state(&key).await?.is_pending() {
            return Ok(None);
        }

        let responded_at = self.clock.now();
        let latency_minutes = self.store.mark_responded(&key, responded_at).await?;

        let canceled_stages = match self.entries.remove(&key) {
            Some((_, handle)) => handle.cancel_all(),
            None => {
                tracing::debug!(%key, "Resolved message had no outstanding stages");
                0
            }
        };

        self.counters.resolved.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ret_resolved_total").increment(1);
        tracing::info!(
            conversation = %key.conversation,
            message = %key.message,
            employee = %key.employee,
            latency_minutes,
            canceled_stages,
            "Message resolved"
        );

        Ok(Some(Resolution {
            key,
            responded_at,
            latency_minutes,
            canceled_stages,
        }))
    }

    /// Stop tracking `key` without resolving it.
    ///
    /// The record stays pending in the store. Returns whether an entry was
    /// removed.
    pub async fn abandon(&self, key: &TrackingKey) -> bool {
        let lock = self.identity_lock(*key);
        let removed = {
            let _guard = lock.lock().await;
            self.entries.remove(key)
        };
        drop(lock);
        self.release_lock(key);

        let Some((_, handle)) = removed else {
            return false;
        };
        let canceled = handle.cancel_all();
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ret_abandoned_total").increment(1);
        tracing::info!(
            conversation = %key.conversation,
            message = %key.message,
            employee = %key.employee,
            canceled,
            "Tracking abandoned"
        );
        true
    }

    /// Abandon every entry owned by `employee`
    pub async fn abandon_employee(&self, employee: EmployeeId) -> usize {
        let keys: Vec<TrackingKey> = self
            .entries
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.employee == employee)
            .collect();
        self.abandon_all(keys).await
    }

    /// Abandon every entry
    pub async fn shutdown(&self) -> usize {
        let keys: Vec<TrackingKey> = self.entries.iter().map(|e| *e.key()).collect();
        let count = self.abandon_all(keys).await;
        tracing::info!(abandoned = count, "Tracker shut down");
        count
    }

    async fn abandon_all(&self, keys: Vec<TrackingKey>) -> usize {
        let mut count = 0;
        for key in keys {
            if self.abandon(&key).await {
                count += 1;
            }
        }
        count
    }

    /// Whether `key` is tracked
    #[inline]
    #[must_use]
    pub fn is_tracking(&self, key: &TrackingKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of tracked entries
    #[inline]
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Handle of a tracked entry
    #[must_use]
    pub fn handle(&self, key: &TrackingKey) -> Option<EscalationHandle> {
        self.entries.get(key).map(|h| h.clone())
    }

    /// Policy read model
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &DelayPolicy {
        &self.policy
    }

    /// Registry statistics
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            tracked: self.counters.tracked.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            active: self.entries.len(),
            stages: self.scheduler.stats(),
        }
    }

    fn identity_lock(&self, key: TrackingKey) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(key).or_default().value())
    }

    /// Drop the identity lock once no caller holds it
    fn release_lock(&self, key: &TrackingKey) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Builder for [`TrackerRegistry`]
pub struct RegistryBuilder {
    store: SharedMessageStore,
    notifier: SharedNotifier,
    directory: SharedDirectory,
    policy: Option<DelayPolicy>,
    clock: Option<Clock>,
    delivery_timeout: Duration,
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("policy", &self.policy)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish_non_exhaustive()
    }
}

impl RegistryBuilder {
    /// Apply timeout and policy from configuration
    #[must_use]
    pub fn with_config(self, config: &TrackerConfig) -> Self {
        let source = Arc::new(StaticPolicySource::new(config.escalation.clone()));
        self.with_delivery_timeout(config.delivery_timeout())
            .with_policy(DelayPolicy::new(source, config.policy_cache_ttl()))
    }

    /// With policy read model
    #[must_use]
    pub fn with_policy(mut self, policy: DelayPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// With policy source and cache TTL
    #[must_use]
    pub fn with_policy_source(self, source: Arc<dyn PolicySource>, ttl: Duration) -> Self {
        self.with_policy(DelayPolicy::new(source, ttl))
    }

    /// With clock
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// With notifier timeout
    #[must_use]
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Build the registry
    #[must_use]
    pub fn build(self) -> TrackerRegistry {
        let clock = self.clock.unwrap_or_default();
        let scheduler = EscalationScheduler::new(
            Arc::clone(&self.store),
            self.notifier,
            self.directory,
            clock,
        )
        .with_delivery_timeout(self.delivery_timeout);

        TrackerRegistry {
            entries: Arc::new(DashMap::new()),
            locks: DashMap::new(),
            store: self.store,
            policy: self
                .policy
                .unwrap_or_else(|| DelayPolicy::fixed(Default::default())),
            scheduler,
            clock,
            counters: Arc::new(Counters::default()),
        }
    }
}
