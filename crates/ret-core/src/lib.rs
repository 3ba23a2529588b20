//! RET Core - Response Escalation Tracker
//!
//! Tracks inbound messages that need a human reply and escalates through
//! timed reminders until one arrives:
//! - Persists each tracked message as pending before arming its timers
//! - Arms one independent timer per policy stage
//! - Re-reads the store on every fire so a reply always wins
//! - Cancels outstanding timers when the reply is observed
//!
//! # Example
//!
//! ```rust,ignore
//! use ret_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), TrackerError> {
//! let registry = TrackerRegistry::builder(
//!     InMemoryMessageStore::shared(),
//!     Arc::new(LogNotifier),
//!     Arc::new(InMemoryDirectory::with_active([EmployeeId(7)])),
//! )
//! .with_config(&TrackerConfig::new())
//! .build();
//!
//! let message = InboundMessage::new(ConversationId(1), MessageId(42)).with_text("hello?");
//! registry.track(&message, EmployeeId(7)).await?;
//!
//! // Later, when employee 7 replies in conversation 1
//! registry.resolve(ConversationId(1), EmployeeId(7)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod alert;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod notifier;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use alert::{AlertSeverity, EscalationAlert};
pub use clock::Clock;
pub use config::{LogSettings, TrackerConfig};
pub use directory::{EmployeeDirectory, InMemoryDirectory, SharedDirectory};
pub use error::{ConfigError, DeliveryError, DirectoryError, StoreError, TrackerError};
pub use notifier::{LogNotifier, Notifier, SharedNotifier};
pub use policy::{
    DelayPolicy, FilePolicySource, PolicySettings, PolicySnapshot, PolicySource,
    SharedPolicySource, Stage, StageSpec, StaticPolicySource,
};
pub use registry::{RegistryBuilder, Resolution, TrackerRegistry, TrackerStats};
pub use scheduler::{
    EscalationHandle, EscalationScheduler, FinishedHook, StageOutcome, StageStats, TimerState,
};
pub use state::ResolutionState;
pub use store::{InMemoryMessageStore, MessageStore, SharedMessageStore};
pub use types::{
    ConversationId, EmployeeId, InboundMessage, MessageId, NewTrackedMessage,
    NotificationRecord, Sender, SenderId, TrackedMessage, TrackingKey,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with RET Core
    pub use crate::{
        ConversationId, DelayPolicy, EmployeeId, EscalationHandle, InMemoryDirectory,
        InMemoryMessageStore, InboundMessage, LogNotifier, MessageId, PolicySettings,
        StageSpec, TrackerConfig, TrackerError, TrackerRegistry,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
