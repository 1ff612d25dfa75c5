//! Approximate sliding window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{GateError, Result};
use crate::store::CounterStore;

use super::bucket::BucketKey;
use super::clock::{Clock, SystemClock};
use super::rule::{HitResult, LimitRule};

/// Sub-buckets per window when none is configured.
pub const DEFAULT_BUCKET_COUNT: u32 = 60;

/// Trait for rate limiter implementations.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one hit for `key` and decide whether it fits within `rule`.
    async fn hit(&self, key: &str, rule: &LimitRule) -> Result<HitResult>;
}

/// Sliding window limiter that sums `bucket_count` expiring sub-bucket counters.
///
/// The window is cut into equal buckets. A hit increments the bucket holding
/// "now", then reads the preceding `bucket_count - 1` buckets and compares the
/// sum to the rule's permits. The error is bounded by roughly
/// `permits / bucket_count`, and at most `bucket_count` counters are live per key.
///
/// The limiter holds no mutable state of its own; all atomicity comes from the
/// store's increment. Reads of older buckets are a best-effort snapshot.
pub struct SlidingWindowRateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    bucket_count: u32,
}

/// Per-bucket counts for one key, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub key: String,
    pub bucket_size_millis: i64,
    pub buckets: Vec<BucketCount>,
    pub total: u64,
}

/// Count held by a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketCount {
    pub index: i64,
    pub start_millis: i64,
    pub count: u64,
}

impl SlidingWindowRateLimiter {
    /// Create a limiter. `bucket_count` must be positive.
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, bucket_count: u32) -> Result<Self> {
        if bucket_count == 0 {
            return Err(GateError::Config("bucket_count must be > 0".to_string()));
        }

        debug!(
            bucket_count = bucket_count,
            backend = %store.backend(),
            "Sliding window rate limiter created"
        );

        Ok(Self {
            store,
            clock,
            bucket_count,
        })
    }

    /// Create a limiter on the UTC wall clock.
    pub fn with_system_clock(store: Arc<dyn CounterStore>, bucket_count: u32) -> Result<Self> {
        Self::new(store, Arc::new(SystemClock), bucket_count)
    }

    /// Get the number of sub-buckets per window.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Get the backing store.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Get the time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Bucket width for `window`, never less than one millisecond.
    pub fn bucket_size_millis(&self, window: Duration) -> Result<i64> {
        let window_millis = window_millis(window)?;
        Ok((window_millis / i64::from(self.bucket_count)).max(1))
    }

    /// Read every bucket in the current window without recording a hit.
    pub async fn snapshot(&self, key: &str, window: Duration) -> Result<WindowSnapshot> {
        validate_key(key)?;
        let bucket_size = self.bucket_size_millis(window)?;
        let current = self.clock.now_millis().div_euclid(bucket_size);

        let store = &self.store;
        let reads = (0..i64::from(self.bucket_count)).map(|i| {
            let index = current.saturating_sub(i);
            let bucket = BucketKey::new(key, index);
            async move {
                let count = store.get(&bucket.to_store_key()).await?;
                Ok::<_, GateError>(BucketCount {
                    index,
                    start_millis: index.saturating_mul(bucket_size),
                    count,
                })
            }
        });
        let buckets = try_join_all(reads).await?;
        let total = buckets.iter().fold(0u64, |sum, b| sum.saturating_add(b.count));

        Ok(WindowSnapshot {
            key: key.to_string(),
            bucket_size_millis: bucket_size,
            buckets,
            total,
        })
    }
}

impl std::fmt::Debug for SlidingWindowRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowRateLimiter")
            .field("bucket_count", &self.bucket_count)
            .field("backend", &self.store.backend())
            .field("clock", &self.clock)
            .finish()
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn hit(&self, key: &str, rule: &LimitRule) -> Result<HitResult> {
        validate_key(key)?;
        let window_millis = window_millis(rule.window)?;
        let bucket_size = (window_millis / i64::from(self.bucket_count)).max(1);

        let now = self.clock.now_millis();
        let current = now.div_euclid(bucket_size);
        let bucket = BucketKey::new(key, current);

        // Record first, so the verdict always reflects this hit
        let ttl = Duration::from_millis(window_millis as u64);
        let recorded = self.store.increment_and_get(&bucket.to_store_key(), ttl).await?;

        let store = &self.store;
        let reads = (1..i64::from(self.bucket_count)).map(|i| {
            let older = BucketKey::new(key, current.saturating_sub(i)).to_store_key();
            async move { store.get(&older).await }
        });
        let older_counts = try_join_all(reads).await?;
        let total = older_counts
            .into_iter()
            .fold(recorded, |sum, count| sum.saturating_add(count));

        let allowed = total <= rule.permits;
        let remaining = rule.permits.saturating_sub(total);
        let reset_at_millis = current.saturating_add(1).saturating_mul(bucket_size);

        trace!(
            bucket = %bucket,
            recorded = recorded,
            total = total,
            permits = rule.permits,
            "Sliding window hit"
        );

        if !allowed {
            debug!(
                key = %key,
                total = total,
                permits = rule.permits,
                reset_at_millis = reset_at_millis,
                "Rate limit exceeded"
            );
        }

        Ok(HitResult {
            allowed,
            remaining,
            reset_at_millis,
        })
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(GateError::InvalidArgument("key must not be empty".to_string()));
    }
    Ok(())
}

fn window_millis(window: Duration) -> Result<i64> {
    let millis = window.as_millis();
    if millis == 0 {
        return Err(GateError::InvalidArgument(format!(
            "window must be at least 1ms, got {:?}",
            window
        )));
    }
    i64::try_from(millis)
        .map_err(|_| GateError::InvalidArgument(format!("window too large: {:?}", window)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use crate::store::{MemoryCounterStore, UnavailableStore};
    use tokio_test::{assert_err, assert_ok};

    fn limiter_at(millis: i64, bucket_count: u32) -> (SlidingWindowRateLimiter, Arc<ManualClock>, Arc<MemoryCounterStore>) {
        let clock = Arc::new(ManualClock::new(millis));
        let store = Arc::new(MemoryCounterStore::with_clock(1024, clock.clone()).unwrap());
        let limiter = SlidingWindowRateLimiter::new(store.clone(), clock.clone(), bucket_count).unwrap();
        (limiter, clock, store)
    }

    fn per_minute(permits: u64) -> LimitRule {
        LimitRule::new(permits, Duration::from_secs(60))
    }

    #[test]
    fn test_zero_bucket_count_rejected() {
        let store = Arc::new(MemoryCounterStore::new(16).unwrap());
        let result = SlidingWindowRateLimiter::with_system_clock(store, 0);
        assert!(matches!(result, Err(GateError::Config(_))));
    }

    #[test]
    fn test_bucket_size() {
        let (limiter, _clock, _store) = limiter_at(0, 60);
        assert_eq!(limiter.bucket_size_millis(Duration::from_secs(60)).unwrap(), 1_000);
        assert_eq!(limiter.bucket_size_millis(Duration::from_secs(3600)).unwrap(), 60_000);
        // Windows shorter than bucket_count milliseconds do not collapse to zero
        assert_eq!(limiter.bucket_size_millis(Duration::from_millis(10)).unwrap(), 1);
        assert!(limiter.bucket_size_millis(Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_first_permits_allowed_then_denied() {
        let (limiter, _clock, _store) = limiter_at(0, 60);
        let rule = per_minute(5);

        for i in 1..=5u64 {
            let result = limiter.hit("k", &rule).await.unwrap();
            assert!(result.allowed, "hit {} should be allowed", i);
            assert_eq!(result.remaining, 5 - i);
        }

        let result = limiter.hit("k", &rule).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_denied_hits_still_count() {
        let (limiter, _clock, store) = limiter_at(0, 6);
        let rule = per_minute(1);

        limiter.hit("k", &rule).await.unwrap();
        limiter.hit("k", &rule).await.unwrap();
        limiter.hit("k", &rule).await.unwrap();

        assert_eq!(store.get("k:0").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_permits_denies_from_first_call() {
        let (limiter, _clock, _store) = limiter_at(0, 60);
        let rule = per_minute(0);

        for _ in 0..3 {
            let result = limiter.hit("k", &rule).await.unwrap();
            assert!(!result.allowed);
            assert_eq!(result.remaining, 0);
        }
    }

    #[tokio::test]
    async fn test_reset_at_is_next_bucket_boundary() {
        let (limiter, _clock, _store) = limiter_at(12_345, 6);
        let rule = per_minute(10);

        let result = limiter.hit("k", &rule).await.unwrap();
        // 10s buckets: 12_345 sits in bucket 1, which ends at 20_000
        assert_eq!(result.reset_at_millis, 20_000);
        assert_eq!(result.retry_after(12_345), Duration::from_millis(7_655));
    }

    #[tokio::test]
    async fn test_floor_division_before_epoch() {
        let (limiter, _clock, store) = limiter_at(-1, 6);
        let rule = per_minute(10);

        let result = limiter.hit("k", &rule).await.unwrap();
        assert_eq!(result.reset_at_millis, 0);
        assert_eq!(store.get("k:-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _clock, _store) = limiter_at(0, 60);
        let rule = per_minute(3);

        for _ in 0..3 {
            assert!(limiter.hit("a", &rule).await.unwrap().allowed);
            assert!(limiter.hit("b", &rule).await.unwrap().allowed);
        }

        let a = limiter.snapshot("a", rule.window).await.unwrap();
        let b = limiter.snapshot("b", rule.window).await.unwrap();
        assert_eq!(a.total, 3);
        assert_eq!(b.total, 3);
        assert!(!limiter.hit("a", &rule).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_window_slides_bucket_by_bucket() {
        let (limiter, clock, _store) = limiter_at(0, 6);
        let rule = per_minute(3);

        for _ in 0..3 {
            assert!(limiter.hit("k", &rule).await.unwrap().allowed);
        }
        let denied = limiter.hit("k", &rule).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at_millis, 10_000);

        // Bucket 0 is still inside the window at 50s
        clock.set(50_000);
        assert!(!limiter.hit("k", &rule).await.unwrap().allowed);

        // At 60s bucket 0 has rolled out; only the hit from 50s remains
        clock.set(60_000);
        let result = limiter.hit("k", &rule).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test]
    async fn test_empty_key_rejected_without_side_effects() {
        let (limiter, _clock, store) = limiter_at(0, 60);

        let result = limiter.hit("", &per_minute(5)).await;
        assert!(matches!(result, Err(GateError::InvalidArgument(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_zero_window_rejected_without_side_effects() {
        let (limiter, _clock, store) = limiter_at(0, 60);

        let rule = LimitRule::new(5, Duration::ZERO);
        assert_err!(limiter.hit("k", &rule).await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let limiter = SlidingWindowRateLimiter::new(
            Arc::new(UnavailableStore),
            Arc::new(ManualClock::new(0)),
            60,
        )
        .unwrap();

        let err = limiter.hit("k", &per_minute(5)).await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test]
    async fn test_snapshot_is_read_only() {
        let (limiter, clock, store) = limiter_at(0, 6);
        let rule = per_minute(10);

        limiter.hit("k", &rule).await.unwrap();
        clock.set(20_000);
        limiter.hit("k", &rule).await.unwrap();
        limiter.hit("k", &rule).await.unwrap();

        let before = store.len();
        let snapshot = assert_ok!(limiter.snapshot("k", rule.window).await);
        assert_eq!(store.len(), before);

        assert_eq!(snapshot.bucket_size_millis, 10_000);
        assert_eq!(snapshot.buckets.len(), 6);
        assert_eq!(snapshot.buckets[0].index, 2);
        assert_eq!(snapshot.buckets[0].count, 2);
        assert_eq!(snapshot.buckets[2].start_millis, 0);
        assert_eq!(snapshot.buckets[2].count, 1);
        assert_eq!(snapshot.total, 3);
    }
}
