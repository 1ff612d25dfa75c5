//! Request-side enforcement around the sliding window limiter.
//!
//! A [`RateGuard`] turns a request into a verdict: it resolves the key for a
//! policy, records the hit, counts the outcome, applies the configured
//! failure policy when the store is down, and produces the headers a
//! response should carry.

mod headers;
mod keys;
mod metrics;
mod policy;

pub use headers::{
    RateLimitHeaders, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER, RETRY_AFTER_HEADER,
};
pub use keys::{client_ip, CustomKeyFn, KeyStrategy, RequestContext, SimpleRequest};
pub use metrics::{GateMetrics, MetricsSnapshot};
pub use policy::{Policy, PolicyConfig, PolicyRegistry, DEFAULT_POLICY, TOO_MANY_REQUESTS};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::ratelimit::{Clock, HitResult, RateLimiter, SlidingWindowRateLimiter, SystemClock};
use crate::store::build_store;
use policy::check_name;

/// Status used when the store is down and the guard fails closed.
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// What the guard does when the counter store fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Return the store error to the caller
    #[default]
    Error,
    /// Let the request through
    Open,
    /// Reject the request
    Closed,
}

/// How a verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Within the limit
    Allowed,
    /// Over the limit
    Denied,
    /// No key could be resolved, so the request was not limited
    Unkeyed,
    /// Store failed and the failure policy allowed the request
    FailedOpen,
    /// Store failed and the failure policy rejected the request
    FailedClosed,
}

/// Verdict for one request under one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub policy: String,
    pub outcome: Outcome,
    /// Scoped key the hit was recorded under
    pub key: Option<String>,
    pub result: Option<HitResult>,
    /// Present when the policy sends headers and a hit was recorded
    pub headers: Option<RateLimitHeaders>,
    /// Status to reply with when rejecting; `None` when the request may proceed
    pub status: Option<u16>,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::Allowed | Outcome::Unkeyed | Outcome::FailedOpen
        )
    }

    /// Header pairs to add to the response, if any.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        self.headers.map(|h| h.to_pairs()).unwrap_or_default()
    }
}

/// Enforces named policies for incoming requests.
pub struct RateGuard {
    limiter: Arc<dyn RateLimiter>,
    policies: Arc<PolicyRegistry>,
    metrics: Arc<GateMetrics>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    include_forwarded_for: bool,
}

impl RateGuard {
    /// Create a guard that propagates store errors and trusts proxy headers.
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        policies: Arc<PolicyRegistry>,
        metrics: Arc<GateMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter,
            policies,
            metrics,
            clock,
            failure_policy: FailurePolicy::default(),
            include_forwarded_for: true,
        }
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_forwarded_for(mut self, include_forwarded_for: bool) -> Self {
        self.include_forwarded_for = include_forwarded_for;
        self
    }

    /// Build the store, limiter, policies and metrics described by `config`.
    pub async fn from_config(config: &GateConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Like [`RateGuard::from_config`], on a caller-supplied clock.
    pub async fn from_config_with_clock(config: &GateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let store = build_store(&config.store, clock.clone()).await?;
        let metrics = Arc::new(GateMetrics::new(store.backend().as_str()));
        let limiter = SlidingWindowRateLimiter::new(store, clock.clone(), config.limiter.bucket_count)?;
        let policies = PolicyRegistry::from_config(config)?;

        info!(
            backend = %metrics.backend(),
            bucket_count = config.limiter.bucket_count,
            failure_policy = ?config.limiter.failure_policy,
            "Rate guard initialized"
        );

        Ok(Self::new(Arc::new(limiter), Arc::new(policies), metrics, clock)
            .with_failure_policy(config.limiter.failure_policy)
            .with_forwarded_for(config.http.include_forwarded_for))
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn metrics(&self) -> &Arc<GateMetrics> {
        &self.metrics
    }

    /// Check a request against the named policy.
    pub async fn check<C>(&self, policy_name: &str, ctx: &C) -> Result<Decision>
    where
        C: RequestContext + Sync,
    {
        let policy = self.policies.get(policy_name).ok_or_else(|| {
            warn!(policy = %policy_name, "Unknown rate limit policy");
            GateError::InvalidArgument(format!("unknown policy: {}", policy_name))
        })?;

        self.check_policy(&policy, ctx).await
    }

    /// Check a request against a policy that need not be registered.
    #[instrument(skip(self, policy, ctx), fields(policy = %policy.name, strategy = policy.strategy.name()))]
    pub async fn check_policy<C>(&self, policy: &Policy, ctx: &C) -> Result<Decision>
    where
        C: RequestContext + Sync,
    {
        // Fields are public, so a hand-built policy may bypass `Policy::new`
        check_name(&policy.name).map_err(GateError::InvalidArgument)?;

        let resolved = policy.strategy.resolve(ctx, self.include_forwarded_for);
        let Some(resolved) = resolved else {
            debug!("No key resolved, request not limited");
            self.metrics.record_unkeyed();
            return Ok(self.decision(policy, Outcome::Unkeyed, None, None));
        };

        let key = policy.scoped_key(&resolved);

        match self.limiter.hit(&key, &policy.rule).await {
            Ok(result) => {
                let outcome = if result.allowed {
                    self.metrics.record_allowed();
                    Outcome::Allowed
                } else {
                    self.metrics.record_blocked();
                    Outcome::Denied
                };
                debug!(key = %key, outcome = ?outcome, remaining = result.remaining, "Rate limit decision made");
                Ok(self.decision(policy, outcome, Some(key), Some(result)))
            }
            Err(err) if err.is_store_unavailable() => {
                self.metrics.record_store_error();
                match self.failure_policy {
                    FailurePolicy::Error => {
                        warn!(key = %key, error = %err, "Counter store failed");
                        Err(err)
                    }
                    FailurePolicy::Open => {
                        warn!(key = %key, error = %err, "Counter store failed, failing open");
                        self.metrics.record_allowed();
                        Ok(self.decision(policy, Outcome::FailedOpen, Some(key), None))
                    }
                    FailurePolicy::Closed => {
                        warn!(key = %key, error = %err, "Counter store failed, failing closed");
                        self.metrics.record_blocked();
                        Ok(self.decision(policy, Outcome::FailedClosed, Some(key), None))
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    fn decision(
        &self,
        policy: &Policy,
        outcome: Outcome,
        key: Option<String>,
        result: Option<HitResult>,
    ) -> Decision {
        let headers = match (&result, policy.send_headers) {
            (Some(result), true) => Some(RateLimitHeaders::new(
                &policy.rule,
                result,
                self.clock.now_millis(),
            )),
            _ => None,
        };

        let status = match outcome {
            Outcome::Denied => Some(policy.status),
            Outcome::FailedClosed => Some(SERVICE_UNAVAILABLE),
            Outcome::Allowed | Outcome::Unkeyed | Outcome::FailedOpen => None,
        };

        Decision {
            policy: policy.name.clone(),
            outcome,
            key,
            result,
            headers,
            status,
        }
    }
}

impl std::fmt::Debug for RateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGuard")
            .field("policies", &self.policies.names())
            .field("failure_policy", &self.failure_policy)
            .field("include_forwarded_for", &self.include_forwarded_for)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimitRule, ManualClock};
    use crate::store::{MemoryCounterStore, UnavailableStore};
    use std::time::Duration;

    fn guard_with(store: Arc<dyn crate::store::CounterStore>, clock: Arc<ManualClock>) -> RateGuard {
        let backend = store.backend().as_str();
        let limiter = SlidingWindowRateLimiter::new(store, clock.clone(), 6).unwrap();
        let policies = PolicyRegistry::new();
        policies.insert(Policy::new(
            "api",
            LimitRule::new(2, Duration::from_secs(60)),
            KeyStrategy::Header("X-Api-Key".to_string()),
        )
        .unwrap());
        RateGuard::new(
            Arc::new(limiter),
            Arc::new(policies),
            Arc::new(GateMetrics::new(backend)),
            clock,
        )
    }

    fn memory_guard() -> (RateGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryCounterStore::with_clock(1024, clock.clone()).unwrap());
        (guard_with(store, clock.clone()), clock)
    }

    fn request(api_key: &str) -> SimpleRequest {
        SimpleRequest::new().with_header("X-Api-Key", api_key)
    }

    #[tokio::test]
    async fn test_allows_then_denies_with_headers() {
        let (guard, _clock) = memory_guard();

        let first = guard.check("api", &request("abc")).await.unwrap();
        assert!(first.is_allowed());
        assert_eq!(first.outcome, Outcome::Allowed);
        assert_eq!(first.key.as_deref(), Some("api:abc"));
        assert_eq!(first.status, None);

        guard.check("api", &request("abc")).await.unwrap();
        let denied = guard.check("api", &request("abc")).await.unwrap();
        assert!(!denied.is_allowed());
        assert_eq!(denied.status, Some(TOO_MANY_REQUESTS));

        let pairs = denied.header_pairs();
        assert!(pairs.contains(&(LIMIT_HEADER, "2".to_string())));
        assert!(pairs.contains(&(REMAINING_HEADER, "0".to_string())));
        assert!(pairs.contains(&(RESET_HEADER, "10".to_string())));
        assert!(pairs.contains(&(RETRY_AFTER_HEADER, "9".to_string())));

        let metrics = guard.metrics().snapshot();
        assert_eq!(metrics.allowed, 2);
        assert_eq!(metrics.blocked, 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_counted_separately() {
        let (guard, _clock) = memory_guard();

        for _ in 0..2 {
            assert!(guard.check("api", &request("a")).await.unwrap().is_allowed());
            assert!(guard.check("api", &request("b")).await.unwrap().is_allowed());
        }
        assert!(!guard.check("api", &request("a")).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_unknown_policy_is_invalid_argument() {
        let (guard, _clock) = memory_guard();

        let result = guard.check("nope", &request("a")).await;
        assert!(matches!(result, Err(GateError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_policy_cannot_reach_into_another_namespace() {
        let (guard, _clock) = memory_guard();

        // Header value shaped like another policy's scoped key
        let forged = guard.check("api", &request("admin:10.0.0.9")).await.unwrap();
        assert_eq!(forged.key.as_deref(), Some("api:admin:10.0.0.9"));

        let hand_built = Policy {
            name: "api:admin".to_string(),
            rule: LimitRule::new(1, Duration::from_secs(60)),
            strategy: KeyStrategy::Ip,
            status: TOO_MANY_REQUESTS,
            send_headers: true,
        };
        let victim = SimpleRequest::new().with_remote_addr("10.0.0.9");
        let result = guard.check_policy(&hand_built, &victim).await;
        assert!(matches!(result, Err(GateError::InvalidArgument(_))));
        assert_eq!(guard.metrics().snapshot().blocked, 0);
    }

    #[tokio::test]
    async fn test_unresolved_custom_key_skips_limiting() {
        let (guard, _clock) = memory_guard();
        let policy = Policy::new(
            "tenant",
            LimitRule::new(0, Duration::from_secs(60)),
            KeyStrategy::custom(|ctx| ctx.header("x-tenant").map(str::to_string)),
        )
        .unwrap();

        let decision = guard.check_policy(&policy, &SimpleRequest::new()).await.unwrap();
        assert_eq!(decision.outcome, Outcome::Unkeyed);
        assert!(decision.is_allowed());
        assert!(decision.headers.is_none());
        assert_eq!(guard.metrics().snapshot().unkeyed, 1);
    }

    #[tokio::test]
    async fn test_headers_suppressed_when_disabled() {
        let (guard, _clock) = memory_guard();
        let policy = Policy::new("quiet", LimitRule::new(5, Duration::from_secs(60)), KeyStrategy::Ip)
            .unwrap()
            .with_headers(false);

        let decision = guard.check_policy(&policy, &SimpleRequest::new()).await.unwrap();
        assert!(decision.is_allowed());
        assert!(decision.header_pairs().is_empty());
        assert!(decision.result.is_some());
    }

    #[tokio::test]
    async fn test_store_failure_propagates_by_default() {
        let clock = Arc::new(ManualClock::new(0));
        let guard = guard_with(Arc::new(UnavailableStore), clock);

        let err = guard.check("api", &request("a")).await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(guard.metrics().snapshot().store_errors, 1);
    }

    #[tokio::test]
    async fn test_store_failure_open() {
        let clock = Arc::new(ManualClock::new(0));
        let guard = guard_with(Arc::new(UnavailableStore), clock).with_failure_policy(FailurePolicy::Open);

        let decision = guard.check("api", &request("a")).await.unwrap();
        assert_eq!(decision.outcome, Outcome::FailedOpen);
        assert!(decision.is_allowed());
        assert!(decision.result.is_none());
        assert_eq!(guard.metrics().allowed_total(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_closed() {
        let clock = Arc::new(ManualClock::new(0));
        let guard = guard_with(Arc::new(UnavailableStore), clock).with_failure_policy(FailurePolicy::Closed);

        let decision = guard.check("api", &request("a")).await.unwrap();
        assert_eq!(decision.outcome, Outcome::FailedClosed);
        assert!(!decision.is_allowed());
        assert_eq!(decision.status, Some(SERVICE_UNAVAILABLE));
        assert_eq!(guard.metrics().blocked_total(), 1);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = GateConfig::from_yaml(
            r#"
limiter:
  bucket_count: 6
  failure_policy: closed
http:
  include_forwarded_for: false
policies:
  - name: login
    permits: 1
    window: 1
    unit: minute
"#,
        )
        .unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let guard = RateGuard::from_config_with_clock(&config, clock).await.unwrap();
        assert_eq!(guard.policies().names(), vec!["default", "login"]);
        assert_eq!(guard.metrics().backend(), "memory");

        // Forwarded headers are ignored, so both requests share the peer address
        let first = SimpleRequest::new()
            .with_remote_addr("10.0.0.1")
            .with_header("X-Forwarded-For", "1.1.1.1");
        let second = SimpleRequest::new()
            .with_remote_addr("10.0.0.1")
            .with_header("X-Forwarded-For", "2.2.2.2");

        assert!(guard.check("login", &first).await.unwrap().is_allowed());
        let denied = guard.check("login", &second).await.unwrap();
        assert!(!denied.is_allowed());
        assert_eq!(denied.key.as_deref(), Some("login:10.0.0.1"));
    }
}
