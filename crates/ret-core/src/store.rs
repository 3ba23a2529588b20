//! Message store collaborator
//!
//! Durable record of tracked-message lifecycle. The tracker only needs:
//! - create a pending record
//! - mark it responded (idempotent)
//! - read its current state (always a fresh read)
//! - find pending records by conversation and employee
//! - append notification audit records

use crate::error::StoreError;
use crate::state::{validate_transition, ResolutionState};
use crate::types::{
    latency_minutes, ConversationId, EmployeeId, NewTrackedMessage, NotificationRecord,
    SenderId, TrackedMessage, TrackingKey,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Shared reference to a message store
pub type SharedMessageStore = Arc<dyn MessageStore>;

/// Persistence contract consumed by the tracker
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new pending record.
    ///
    /// Returns the stored record and whether this call created it. Creating
    /// a key that already exists returns the stored record unchanged with
    /// `false`.
    async fn create_pending(
        &self,
        new: NewTrackedMessage,
    ) -> Result<(TrackedMessage, bool), StoreError>;

    /// Mark a record responded and return its latency in minutes.
    ///
    /// Already-responded records are left untouched and report their
    /// original latency.
    async fn mark_responded(
        &self,
        key: &TrackingKey,
        responded_at: DateTime<Utc>,
    ) -> Result<f64, StoreError>;

    /// Current resolution state
    async fn get_state(&self, key: &TrackingKey) -> Result<ResolutionState, StoreError>;

    /// Most recently received pending record for this employee in this
    /// conversation
    async fn find_latest_pending(
        &self,
        conversation: ConversationId,
        employee: EmployeeId,
    ) -> Result<Option<TrackingKey>, StoreError>;

    /// Every pending record from `sender` for this employee in this
    /// conversation, oldest first
    async fn find_pending_from_sender(
        &self,
        conversation: ConversationId,
        employee: EmployeeId,
        sender: SenderId,
    ) -> Result<Vec<TrackingKey>, StoreError>;

    /// Append a delivery audit record
    async fn record_notification(&self, record: NotificationRecord) -> Result<(), StoreError>;
}

/// In-process message store
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    records: RwLock<HashMap<TrackingKey, TrackedMessage>>,
    notifications: Mutex<Vec<NotificationRecord>>,
}

impl InMemoryMessageStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to a new store
    #[inline]
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of a record
    #[must_use]
    pub fn record(&self, key: &TrackingKey) -> Option<TrackedMessage> {
        self.records.read().get(key).cloned()
    }

    /// All audit records written so far
    #[must_use]
    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.notifications.lock().clone()
    }

    /// Number of records held
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn pending_matching<F>(&self, mut pred: F) -> Vec<TrackedMessage>
    where
        F: FnMut(&TrackedMessage) -> bool,
    {
        self.records
            .read()
            .values()
            .filter(|m| m.is_pending() && pred(m))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_pending(
        &self,
        new: NewTrackedMessage,
    ) -> Result<(TrackedMessage, bool), StoreError> {
        let mut records = self.records.write();
        if let Some(existing) = records.get(&new.key) {
            return Ok((existing.clone(), false));
        }
        let record = TrackedMessage::pending(new);
        records.insert(record.key, record.clone());
        Ok((record, true))
    }

    async fn mark_responded(
        &self,
        key: &TrackingKey,
        responded_at: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        let mut records = self.records.write();
        let record = records.get_mut(key).ok_or(StoreError::NotFound(*key))?;

        if record.state == ResolutionState::Responded {
            return Ok(record.response_minutes.unwrap_or_default());
        }
        validate_transition(record.state, ResolutionState::Responded)?;

        let latency = latency_minutes(record.received_at, responded_at);
        record.state = ResolutionState::Responded;
        record.responded_at = Some(responded_at);
        record.response_minutes = Some(latency);
        Ok(latency)
    }

    async fn get_state(&self, key: &TrackingKey) -> Result<ResolutionState, StoreError> {
        self.records
            .read()
            .get(key)
            .map(|m| m.state)
            .ok_or(StoreError::NotFound(*key))
    }

    async fn find_latest_pending(
        &self,
        conversation: ConversationId,
        employee: EmployeeId,
    ) -> Result<Option<TrackingKey>, StoreError> {
        let latest = self
            .pending_matching(|m| m.key.conversation == conversation && m.key.employee == employee)
            .into_iter()
            .max_by_key(|m| (m.received_at, m.key.message))
            .map(|m| m.key);
        Ok(latest)
    }

    async fn find_pending_from_sender(
        &self,
        conversation: ConversationId,
        employee: EmployeeId,
        sender: SenderId,
    ) -> Result<Vec<TrackingKey>, StoreError> {
        let mut matches = self.pending_matching(|m| {
            m.key.conversation == conversation
                && m.key.employee == employee
                && m.sender.as_ref().is_some_and(|s| s.id == sender)
        });
        matches.sort_by_key(|m| (m.received_at, m.key.message));
        Ok(matches.into_iter().map(|m| m.key).collect())
    }

    async fn record_notification(&self, record: NotificationRecord) -> Result<(), StoreError> {
        self.notifications.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageId, Sender};
    use chrono::Duration;

    fn new_message(msg: i64, employee: i64, at: DateTime<Utc>) -> NewTrackedMessage {
        NewTrackedMessage {
            key: TrackingKey::new(ConversationId(1), MessageId(msg), EmployeeId(employee)),
            received_at: at,
            preview: Some("hello".into()),
            sender: Some(Sender::new(SenderId(77))),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = InMemoryMessageStore::new();
        let t0 = Utc::now();
        let (first, created) = store.create_pending(new_message(1, 1, t0)).await.unwrap();
        assert!(created);
        let (again, created) = store
            .create_pending(new_message(1, 1, t0 + Duration::minutes(3)))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first, again);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn mark_responded_sets_latency_once() {
        let store = InMemoryMessageStore::new();
        let t0 = Utc::now();
        let (rec, _) = store.create_pending(new_message(1, 1, t0)).await.unwrap();

        let latency = store
            .mark_responded(&rec.key, t0 + Duration::minutes(7))
            .await
            .unwrap();
        assert!((latency - 7.0).abs() < 1e-9);

        // Second call keeps the first timestamp
        let again = store
            .mark_responded(&rec.key, t0 + Duration::minutes(20))
            .await
            .unwrap();
        assert!((again - 7.0).abs() < 1e-9);
        let stored = store.record(&rec.key).unwrap();
        assert_eq!(stored.responded_at, Some(t0 + Duration::minutes(7)));
        assert_eq!(stored.state, ResolutionState::Responded);
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let store = InMemoryMessageStore::new();
        let key = TrackingKey::new(ConversationId(1), MessageId(1), EmployeeId(1));
        assert!(matches!(
            store.get_state(&key).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.mark_responded(&key, Utc::now()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn latest_pending_prefers_most_recent() {
        let store = InMemoryMessageStore::new();
        let t0 = Utc::now();
        store.create_pending(new_message(1, 1, t0)).await.unwrap();
        store
            .create_pending(new_message(2, 1, t0 + Duration::minutes(1)))
            .await
            .unwrap();
        store
            .create_pending(new_message(3, 2, t0 + Duration::minutes(2)))
            .await
            .unwrap();

        let latest = store
            .find_latest_pending(ConversationId(1), EmployeeId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.message, MessageId(2));

        store.mark_responded(&latest, t0).await.unwrap();
        let next = store
            .find_latest_pending(ConversationId(1), EmployeeId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.message, MessageId(1));

        let other_conv = store
            .find_latest_pending(ConversationId(2), EmployeeId(1))
            .await
            .unwrap();
        assert!(other_conv.is_none());
    }

    #[tokio::test]
    async fn pending_from_sender_is_oldest_first() {
        let store = InMemoryMessageStore::new();
        let t0 = Utc::now();
        store
            .create_pending(new_message(5, 1, t0 + Duration::minutes(5)))
            .await
            .unwrap();
        store.create_pending(new_message(4, 1, t0)).await.unwrap();

        let keys = store
            .find_pending_from_sender(ConversationId(1), EmployeeId(1), SenderId(77))
            .await
            .unwrap();
        let ids: Vec<_> = keys.iter().map(|k| k.message).collect();
        assert_eq!(ids, vec![MessageId(4), MessageId(5)]);

        let none = store
            .find_pending_from_sender(ConversationId(1), EmployeeId(1), SenderId(1))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
