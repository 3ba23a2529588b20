//! Error types for the tracker
//!
//! Provides error handling for:
//! - Message store failures (missing records, unreachable storage)
//! - Notifier delivery failures
//! - Employee directory lookups
//! - Configuration loading and validation
//!
//! Only [`TrackerError`] crosses the public `track` / `resolve` / `abandon`
//! boundary. Delivery and directory failures stop at the scheduler and are
//! logged, so they have no [`TrackerError`] variant.

use crate::state::ResolutionState;
use crate::types::{EmployeeId, TrackingKey};
use std::time::Duration;

/// Main tracker error type
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Referenced message does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence layer unreachable; the operation was aborted
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Illegal resolution state change requested
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: ResolutionState,
        /// Requested state
        to: ResolutionState,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TrackerError {
    /// Check if error is retryable by the caller
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Check if error reports a missing record
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for TrackerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::NotFound(format!("tracked message {key}")),
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
            StoreError::IllegalTransition { from, to } => Self::IllegalTransition { from, to },
        }
    }
}

/// Message store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Identity was never created
    #[error("tracked message not found: {0}")]
    NotFound(TrackingKey),

    /// Storage unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Transition rejected by the resolution state machine
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: ResolutionState,
        /// Requested state
        to: ResolutionState,
    },
}

/// Notifier delivery errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// Recipient or transport refused the alert
    #[error("rejected: {0}")]
    Rejected(String),

    /// Delivery did not finish within the bound
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// No route to the recipient
    #[error("unknown recipient: {0}")]
    UnknownRecipient(EmployeeId),
}

/// Employee directory errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    /// Employee unknown to the directory
    #[error("employee not found: {0}")]
    NotFound(EmployeeId),

    /// Directory unreachable
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config text is not valid TOML for the schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parsed but violate a constraint
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Environment override could not be applied
    #[error("invalid value for {var}: {reason}")]
    Env {
        /// Variable name
        var: String,
        /// What was wrong
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationId, MessageId};

    fn key() -> TrackingKey {
        TrackingKey::new(ConversationId(1), MessageId(2), EmployeeId(3))
    }

    #[test]
    fn tracker_error_display() {
        let err = TrackerError::StoreUnavailable("db down".to_string());
        assert!(err.to_string().contains("store unavailable"));
    }

    #[test]
    fn store_errors_map_to_taxonomy() {
        let err: TrackerError = StoreError::NotFound(key()).into();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err: TrackerError = StoreError::Unavailable("timeout".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn delivery_error_names_bound() {
        let err = DeliveryError::TimedOut(Duration::from_secs(10));
        assert_eq!(err.to_string(), "timed out after 10s");
    }
}
