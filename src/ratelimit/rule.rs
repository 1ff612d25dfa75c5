//! Limit rules and hit results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GateError, Result};

/// Time unit used when rules are written down in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Millisecond => Duration::from_millis(1),
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }

    /// Duration of `amount` units, saturating instead of overflowing.
    pub fn times(&self, amount: u32) -> Duration {
        self.duration().saturating_mul(amount)
    }
}

/// Maximum number of hits allowed within a rolling window.
///
/// Rules are supplied by the caller on every hit; the limiter does not keep them.
/// Zero permits denies every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Maximum hits allowed in the window
    pub permits: u64,
    /// Length of the rolling window
    pub window: Duration,
}

impl LimitRule {
    /// Create a rule. Use [`LimitRule::validate`] before handing it to a limiter
    /// at configuration time.
    pub fn new(permits: u64, window: Duration) -> Self {
        Self { permits, window }
    }

    /// Shorthand for `permits` per `amount` of `unit`.
    pub fn per(permits: u64, amount: u32, unit: TimeUnit) -> Self {
        Self::new(permits, unit.times(amount))
    }

    /// Reject rules whose window is shorter than one millisecond.
    pub fn validate(&self) -> Result<()> {
        if self.window.as_millis() == 0 {
            return Err(GateError::InvalidArgument(format!(
                "window must be at least 1ms, got {:?}",
                self.window
            )));
        }
        Ok(())
    }
}

/// Outcome of a single hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitResult {
    /// Whether this hit fits within the rule
    pub allowed: bool,
    /// Permits left after this hit, never negative
    pub remaining: u64,
    /// Epoch milliseconds of the next bucket boundary
    pub reset_at_millis: i64,
}

impl HitResult {
    /// The next bucket boundary as a UTC timestamp.
    ///
    /// This is when the window next advances by one bucket, not when the full
    /// quota comes back. A caller throttled by older buckets may have to wait
    /// for several boundaries.
    pub fn reset_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.reset_at_millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Time left until `reset_at`, measured from `now_millis`. Zero once passed.
    pub fn retry_after(&self, now_millis: i64) -> Duration {
        let millis = self.reset_at_millis.saturating_sub(now_millis).max(0);
        Duration::from_millis(millis as u64)
    }
}
