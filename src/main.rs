use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slidegate::config::GateConfig;
use slidegate::guard::{PolicyRegistry, RateLimitHeaders};
use slidegate::ratelimit::{HitResult, LimitRule, RateLimiter, SlidingWindowRateLimiter, SystemClock};
use slidegate::store::build_store;

#[derive(Debug, Parser)]
#[command(name = "slidegate", version, about = "Sliding window rate limiting")]
struct Cli {
    /// YAML configuration file; SLIDEGATE__* environment variables override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record hits for a key and print each verdict
    Hit {
        /// Rate-limit key
        #[arg(long)]
        key: String,

        /// Apply a configured policy
        #[arg(long, conflicts_with_all = ["permits", "window_secs"])]
        policy: Option<String>,

        /// Permits per window for an ad-hoc rule
        #[arg(long, requires = "window_secs")]
        permits: Option<u64>,

        /// Window length in seconds for an ad-hoc rule
        #[arg(long, requires = "permits")]
        window_secs: Option<u64>,

        /// Number of hits to record
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Print per-bucket counts for a key without recording a hit
    Inspect {
        /// Rate-limit key, as stored (policy-scoped keys look like "policy:key")
        #[arg(long)]
        key: String,

        /// Window length in seconds
        #[arg(long)]
        window_secs: u64,
    },
    /// List configured policies
    Policies,
}

#[derive(Debug, Serialize)]
struct HitLine<'a> {
    key: &'a str,
    result: HitResult,
    headers: RateLimitHeaders,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(backend = %config.store.backend, bucket_count = config.limiter.bucket_count, "Configuration loaded");

    let clock = Arc::new(SystemClock);
    let store = build_store(&config.store, clock.clone()).await?;
    let limiter = SlidingWindowRateLimiter::new(store, clock, config.limiter.bucket_count)?;
    let policies = PolicyRegistry::from_config(&config)?;

    match cli.command {
        Command::Hit {
            key,
            policy,
            permits,
            window_secs,
            count,
        } => {
            let (key, rule) = resolve_target(&policies, key, policy, permits, window_secs)?;
            for line in record_hits(&limiter, &key, &rule, count).await? {
                println!("{}", serde_json::to_string(&line)?);
            }
        }
        Command::Inspect { key, window_secs } => {
            let snapshot = limiter.snapshot(&key, Duration::from_secs(window_secs)).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Policies => {
            for line in describe_policies(&policies) {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

/// Pick the counter key and rule for `hit`: a configured policy scopes the
/// key under its name, otherwise the ad-hoc rule applies to the raw key.
fn resolve_target(
    policies: &PolicyRegistry,
    key: String,
    policy: Option<String>,
    permits: Option<u64>,
    window_secs: Option<u64>,
) -> anyhow::Result<(String, LimitRule)> {
    match (policy, permits, window_secs) {
        (Some(name), _, _) => {
            let policy = policies
                .get(&name)
                .with_context(|| format!("Unknown policy: {}", name))?;
            Ok((policy.scoped_key(&key), policy.rule))
        }
        (None, Some(permits), Some(secs)) => {
            Ok((key, LimitRule::new(permits, Duration::from_secs(secs))))
        }
        _ => bail!("Either --policy or --permits with --window-secs is required"),
    }
}

async fn record_hits<'a>(
    limiter: &SlidingWindowRateLimiter,
    key: &'a str,
    rule: &LimitRule,
    count: u32,
) -> anyhow::Result<Vec<HitLine<'a>>> {
    let mut lines = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let result = limiter.hit(key, rule).await?;
        let headers = RateLimitHeaders::new(rule, &result, limiter.clock().now_millis());
        lines.push(HitLine { key, result, headers });
    }
    Ok(lines)
}

fn describe_policies(policies: &PolicyRegistry) -> Vec<String> {
    policies
        .names()
        .iter()
        .filter_map(|name| policies.get(name))
        .map(|policy| {
            format!(
                "{}\tpermits={}\twindow={:?}\tstrategy={}\tstatus={}",
                policy.name,
                policy.rule.permits,
                policy.rule.window,
                policy.strategy.name(),
                policy.status
            )
        })
        .collect()
}

/// Logs go to stderr so command output on stdout stays machine-readable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slidegate::ratelimit::ManualClock;
    use slidegate::store::MemoryCounterStore;

    fn registry() -> PolicyRegistry {
        let config = GateConfig::from_yaml(
            r#"
policies:
  - name: login
    permits: 5
    window: 1
    unit: minute
"#,
        )
        .unwrap();
        PolicyRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn test_policy_target_is_scoped() {
        let (key, rule) =
            resolve_target(&registry(), "alice".to_string(), Some("login".to_string()), None, None).unwrap();
        assert_eq!(key, "login:alice");
        assert_eq!(rule, LimitRule::new(5, Duration::from_secs(60)));
    }

    #[test]
    fn test_ad_hoc_target_uses_raw_key() {
        let (key, rule) =
            resolve_target(&registry(), "alice".to_string(), None, Some(3), Some(10)).unwrap();
        assert_eq!(key, "alice");
        assert_eq!(rule, LimitRule::new(3, Duration::from_secs(10)));
    }

    #[test]
    fn test_target_errors() {
        let err = resolve_target(&registry(), "k".to_string(), Some("nope".to_string()), None, None)
            .unwrap_err();
        assert!(err.to_string().contains("Unknown policy"));

        assert!(resolve_target(&registry(), "k".to_string(), None, Some(3), None).is_err());
        assert!(resolve_target(&registry(), "k".to_string(), None, None, None).is_err());
    }

    #[test]
    fn test_cli_rejects_policy_with_ad_hoc_rule() {
        let parsed = Cli::try_parse_from([
            "slidegate", "hit", "--key", "k", "--policy", "login", "--permits", "3", "--window-secs", "10",
        ]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["slidegate", "hit", "--key", "k", "--permits", "3"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "slidegate", "hit", "--key", "k", "--permits", "3", "--window-secs", "10",
        ]);
        assert!(parsed.is_ok());
    }

    #[tokio::test]
    async fn test_record_hits_reports_each_verdict() {
        let clock = Arc::new(ManualClock::new(1_500));
        let store = Arc::new(MemoryCounterStore::with_clock(64, clock.clone()).unwrap());
        let limiter = SlidingWindowRateLimiter::new(store, clock, 6).unwrap();
        let rule = LimitRule::new(2, Duration::from_secs(60));

        let lines = record_hits(&limiter, "k", &rule, 3).await.unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].result.allowed);
        assert_eq!(lines[1].headers.remaining, 0);
        assert!(!lines[2].result.allowed);
        assert_eq!(lines[2].headers.retry_after, Some(9));

        let json = serde_json::to_value(&lines[2]).unwrap();
        assert_eq!(json["key"], "k");
        assert_eq!(json["result"]["allowed"], false);
        assert_eq!(json["headers"]["reset"], 10);
    }

    #[test]
    fn test_describe_policies() {
        let lines = describe_policies(&registry());
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("default\tpermits=60"));
        assert!(lines[1].starts_with("login\tpermits=5"));
        assert!(lines[1].ends_with("strategy=ip\tstatus=429"));
    }
}
