//! Notifier collaborator
//!
//! Delivers one alert to one employee. Failures come back as values; the
//! scheduler bounds every call with its own timeout as well.

use crate::alert::EscalationAlert;
use crate::error::DeliveryError;
use crate::types::{EmployeeId, Sender};
use async_trait::async_trait;
use std::sync::Arc;

/// Shared reference to a notifier
pub type SharedNotifier = Arc<dyn Notifier>;

/// Alert delivery contract
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `alert` for stage `stage_label` to `recipient`
    async fn deliver(
        &self,
        recipient: EmployeeId,
        stage_label: &str,
        alert: &EscalationAlert,
    ) -> Result<(), DeliveryError>;
}

/// Notifier that delivers by emitting a tracing event
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(
        &self,
        recipient: EmployeeId,
        stage_label: &str,
        alert: &EscalationAlert,
    ) -> Result<(), DeliveryError> {
        tracing::info!(
            employee = %recipient,
            stage = stage_label,
            conversation = %alert.key.conversation,
            message = %alert.key.message,
            severity = ?alert.severity,
            elapsed_secs = alert.elapsed.as_secs(),
            sender = alert.sender.as_ref().and_then(Sender::name).unwrap_or(""),
            preview = alert.preview.as_deref().unwrap_or(""),
            "Unanswered message alert"
        );
        Ok(())
    }
}
