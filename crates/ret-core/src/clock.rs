//! Wall clock anchored to the runtime's monotonic clock
//!
//! Timers sleep on `tokio::time::Instant`; timestamps are `chrono` wall time.
//! Anchoring one to the other keeps latency figures consistent with the
//! deadlines that produced them, including under paused test time.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Monotonic-anchored wall clock
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_wall: DateTime<Utc>,
    anchor_instant: Instant,
}

impl Clock {
    /// Anchor a clock at the current instant
    #[must_use]
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Anchor a clock so that "now" reads as `wall`
    #[must_use]
    pub fn anchored_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor_instant: Instant::now(),
        }
    }

    /// Current wall time
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor_instant);
        chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| self.anchor_wall.checked_add_signed(d))
            .unwrap_or(self.anchor_wall)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
