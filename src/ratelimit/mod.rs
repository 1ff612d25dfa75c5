//! Sliding window rate limiting.

pub mod clock;
mod bucket;
mod limiter;
mod rule;

pub use bucket::BucketKey;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{
    BucketCount, RateLimiter, SlidingWindowRateLimiter, WindowSnapshot, DEFAULT_BUCKET_COUNT,
};
pub use rule::{HitResult, LimitRule, TimeUnit};
