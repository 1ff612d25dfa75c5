//! Rate limit response headers.

use serde::Serialize;

use crate::ratelimit::{HitResult, LimitRule};

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// Header values describing one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    /// Permits per window
    pub limit: u64,
    /// Permits left
    pub remaining: u64,
    /// Epoch seconds of the next bucket boundary
    pub reset: i64,
    /// Whole seconds until `reset`, only set on denial
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Build headers for `result`, observed at `now_millis`.
    ///
    /// `Retry-After` rounds up so a client honoring it never retries before
    /// the boundary.
    pub fn new(rule: &LimitRule, result: &HitResult, now_millis: i64) -> Self {
        let retry_after = (!result.allowed).then(|| {
            let wait = result.retry_after(now_millis);
            wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
        });

        Self {
            limit: rule.permits,
            remaining: result.remaining,
            reset: result.reset_at_millis.div_euclid(1000),
            retry_after,
        }
    }

    /// Name/value pairs, ready to copy onto a response.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (LIMIT_HEADER, self.limit.to_string()),
            (REMAINING_HEADER, self.remaining.to_string()),
            (RESET_HEADER, self.reset.to_string()),
        ];
        if let Some(secs) = self.retry_after {
            pairs.push((RETRY_AFTER_HEADER, secs.to_string()));
        }
        pairs
    }
}
