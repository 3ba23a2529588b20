//! Alert payload handed to the notifier
//!
//! Structured data only. Turning it into text is the notifier's business.

use crate::policy::Stage;
use crate::types::{Sender, TrackedMessage, TrackingKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How loud an alert is, derived from its threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Threshold up to 5 minutes
    Warning,
    /// Threshold up to 15 minutes
    Urgent,
    /// Anything longer
    Critical,
}

impl AlertSeverity {
    /// Severity for a stage threshold
    #[must_use]
    pub fn for_threshold(threshold: Duration) -> Self {
        const FIVE_MIN: Duration = Duration::from_secs(5 * 60);
        const FIFTEEN_MIN: Duration = Duration::from_secs(15 * 60);
        if threshold <= FIVE_MIN {
            Self::Warning
        } else if threshold <= FIFTEEN_MIN {
            Self::Urgent
        } else {
            Self::Critical
        }
    }
}

/// One stage alert about an unanswered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationAlert {
    /// Message the alert is about
    pub key: TrackingKey,
    /// Stage label
    pub stage_label: String,
    /// Stage position in the policy
    pub stage_ordinal: usize,
    /// Configured threshold
    pub threshold: Duration,
    /// Time since the message was received
    pub elapsed: Duration,
    /// Severity
    pub severity: AlertSeverity,
    /// Content preview
    pub preview: Option<String>,
    /// Who is waiting for the reply
    pub sender: Option<Sender>,
}

impl EscalationAlert {
    /// Build the alert for `stage` of `message`
    #[must_use]
    pub fn new(message: &TrackedMessage, stage: &Stage, elapsed: Duration) -> Self {
        Self {
            key: message.key,
            stage_label: stage.label.clone(),
            stage_ordinal: stage.ordinal,
            threshold: stage.threshold,
            elapsed,
            severity: AlertSeverity::for_threshold(stage.threshold),
            preview: message.preview.clone(),
            sender: message.sender.clone(),
        }
    }

    /// Elapsed time in whole minutes
    #[inline]
    #[must_use]
    pub fn elapsed_minutes(&self) -> u64 {
        self.elapsed.as_secs() / 60
    }
}
