//! Core types for the tracker
//!
//! Defines the fundamental types shared by every component:
//! - Conversation, message and employee identifiers
//! - The composite tracking key
//! - Inbound messages and the persisted tracked record
//! - Audit records written after a delivery

use crate::state::ResolutionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Maximum number of characters kept in a content preview
pub const PREVIEW_MAX_CHARS: usize = 100;

/// Conversation (chat) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier, unique within a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Employee identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EmployeeId(pub i64);

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sender (client) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SenderId(pub i64);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one tracked message
///
/// The `(conversation, message)` pair names the physical inbound message.
/// The employee completes the key so that a message tracked for several
/// employees resolves independently for each of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackingKey {
    /// Conversation the message arrived in
    pub conversation: ConversationId,
    /// Message within the conversation
    pub message: MessageId,
    /// Employee expected to reply
    pub employee: EmployeeId,
}

impl TrackingKey {
    /// Create new tracking key
    #[inline]
    #[must_use]
    pub fn new(conversation: ConversationId, message: MessageId, employee: EmployeeId) -> Self {
        Self {
            conversation,
            message,
            employee,
        }
    }

    /// The physical message this key refers to
    #[inline]
    #[must_use]
    pub fn message_key(&self) -> (ConversationId, MessageId) {
        (self.conversation, self.message)
    }
}

impl fmt::Display for TrackingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.conversation, self.message, self.employee)
    }
}

/// Who sent an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Sender identifier
    pub id: SenderId,
    /// Handle, if the sender has one
    pub username: Option<String>,
    /// Display name, if known
    pub display_name: Option<String>,
}

impl Sender {
    /// Create sender with only an identifier
    #[inline]
    #[must_use]
    pub fn new(id: SenderId) -> Self {
        Self {
            id,
            username: None,
            display_name: None,
        }
    }

    /// With username
    #[inline]
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// With display name
    #[inline]
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Best human-readable name: display name, then username
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.display_name.as_deref().or(self.username.as_deref())
    }
}

/// A message accepted for tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Conversation the message arrived in
    pub conversation_id: ConversationId,
    /// Message identifier
    pub message_id: MessageId,
    /// Who wrote it
    pub sender: Option<Sender>,
    /// Message text, if any
    pub text: Option<String>,
    /// When it was received; the tracker clock is used when absent
    pub received_at: Option<DateTime<Utc>>,
}

impl InboundMessage {
    /// Create new inbound message
    #[inline]
    #[must_use]
    pub fn new(conversation_id: ConversationId, message_id: MessageId) -> Self {
        Self {
            conversation_id,
            message_id,
            sender: None,
            text: None,
            received_at: None,
        }
    }

    /// With sender
    #[inline]
    #[must_use]
    pub fn with_sender(mut self, sender: Sender) -> Self {
        self.sender = Some(sender);
        self
    }

    /// With text
    #[inline]
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// With explicit receive time
    #[inline]
    #[must_use]
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    /// Tracking key for this message and employee
    #[inline]
    #[must_use]
    pub fn key_for(&self, employee: EmployeeId) -> TrackingKey {
        TrackingKey::new(self.conversation_id, self.message_id, employee)
    }

    /// Short preview of the message text
    #[must_use]
    pub fn preview(&self) -> Option<String> {
        self.text.as_deref().map(preview)
    }
}

/// Truncate text to [`PREVIEW_MAX_CHARS`] characters, marking the cut
#[must_use]
pub fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Fields needed to create a pending record
#[derive(Debug, Clone)]
pub struct NewTrackedMessage {
    /// Tracking key
    pub key: TrackingKey,
    /// When the message was received
    pub received_at: DateTime<Utc>,
    /// Content preview
    pub preview: Option<String>,
    /// Sender, if known
    pub sender: Option<Sender>,
}

/// Persisted lifecycle record of one tracked message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedMessage {
    /// Tracking key
    pub key: TrackingKey,
    /// When the message was received
    pub received_at: DateTime<Utc>,
    /// When a qualifying reply was observed
    pub responded_at: Option<DateTime<Utc>>,
    /// Reply latency in minutes (set together with `responded_at`)
    pub response_minutes: Option<f64>,
    /// Resolution state
    pub state: ResolutionState,
    /// Content preview
    pub preview: Option<String>,
    /// Sender, if known
    pub sender: Option<Sender>,
}

impl TrackedMessage {
    /// Build a pending record
    #[must_use]
    pub fn pending(new: NewTrackedMessage) -> Self {
        Self {
            key: new.key,
            received_at: new.received_at,
            responded_at: None,
            response_minutes: None,
            state: ResolutionState::Pending,
            preview: new.preview,
            sender: new.sender,
        }
    }

    /// Whether the record still awaits a reply
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    /// Owning employee
    #[inline]
    #[must_use]
    pub fn employee(&self) -> EmployeeId {
        self.key.employee
    }
}

/// Latency in fractional minutes between two instants, floored at zero
#[must_use]
pub fn latency_minutes(received_at: DateTime<Utc>, responded_at: DateTime<Utc>) -> f64 {
    let millis = (responded_at - received_at).num_milliseconds().max(0);
    #[allow(clippy::cast_precision_loss)]
    let minutes = millis as f64 / 60_000.0;
    minutes
}

/// Audit record of a delivered stage alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Record identifier (ULID for sortability)
    pub id: Ulid,
    /// Alerted employee
    pub employee: EmployeeId,
    /// Stage that fired
    pub stage_label: String,
    /// Message the alert was about
    pub key: TrackingKey,
    /// When delivery succeeded
    pub sent_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Create new audit record
    #[inline]
    #[must_use]
    pub fn new(key: TrackingKey, stage_label: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new(),
            employee: key.employee,
            stage_label: stage_label.into(),
            key,
            sent_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn preview_keeps_short_text() {
        assert_eq!(preview("hello"), "hello");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let text = "ж".repeat(150);
        let p = preview(&text);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), PREVIEW_MAX_CHARS + 3);
    }

    #[test]
    fn preview_exact_length_is_untouched() {
        let text = "a".repeat(PREVIEW_MAX_CHARS);
        assert_eq!(preview(&text), text);
    }

    #[test]
    fn sender_name_prefers_display_name() {
        let sender = Sender::new(SenderId(1)).with_username("jdoe");
        assert_eq!(sender.name(), Some("jdoe"));
        assert_eq!(sender.with_display_name("J. Doe").name(), Some("J. Doe"));
        assert_eq!(Sender::new(SenderId(2)).name(), None);
    }

    #[test]
    fn latency_is_fractional_minutes() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(7 * 60 + 30);
        assert!((latency_minutes(t0, t1) - 7.5).abs() < 1e-9);
        assert_eq!(latency_minutes(t1, t0), 0.0);
    }

    #[test]
    fn inbound_key_carries_employee() {
        let msg = InboundMessage::new(ConversationId(10), MessageId(5)).with_text("hi");
        let key = msg.key_for(EmployeeId(3));
        assert_eq!(key.message_key(), (ConversationId(10), MessageId(5)));
        assert_eq!(key.employee, EmployeeId(3));
        assert_eq!(key.to_string(), "10/5@3");
        assert_eq!(msg.preview().as_deref(), Some("hi"));
    }
}
