//! Shared counter store on Redis.
//!
//! Counters live on a Redis server so every node enforcing the same limits
//! sees the same totals. Create, increment and first-time expiry happen in
//! one server-side script, so a key's TTL is fixed when it is created and is
//! not extended by later hits.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, AsyncConnectionConfig, Client, Script};
use tracing::{debug, info, warn};

use super::{CounterStore, StoreBackend};
use crate::config::StoreConfig;
use crate::error::{GateError, Result, StoreError};
use crate::ratelimit::clock::duration_millis;

/// Key prefix used when none (or a blank one) is configured.
pub const DEFAULT_KEY_PREFIX: &str = "rl:";

/// INCR, and set the TTL only when this call created the key.
const INCR_WITH_TTL_LUA: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v
"#;

/// Counter store backed by a Redis server.
///
/// Connection failures and timeouts surface as [`StoreError::Redis`];
/// nothing is retried here.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    incr_script: Script,
}

impl RedisCounterStore {
    /// Connect using the store configuration.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        info!(
            url = %sanitize_url(&config.redis_url),
            key_prefix = %config.key_prefix,
            "Connecting Redis counter store"
        );

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| GateError::Config(format!("Invalid redis_url: {}", e)))?;

        let conn_config = AsyncConnectionConfig::new()
            .set_connection_timeout(Duration::from_millis(config.connect_timeout_ms))
            .set_response_timeout(Duration::from_millis(config.response_timeout_ms));

        let conn = client
            .get_multiplexed_async_connection_with_config(&conn_config)
            .await
            .map_err(StoreError::Redis)?;

        info!("Redis counter store connected");
        Ok(Self::from_connection(conn, &config.key_prefix))
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: MultiplexedConnection, key_prefix: &str) -> Self {
        Self {
            conn,
            key_prefix: normalize_prefix(key_prefix),
            incr_script: Script::new(INCR_WITH_TTL_LUA),
        }
    }

    /// Get the namespace prepended to every bucket key.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> std::result::Result<u64, StoreError> {
        let full = self.full_key(key);
        let mut conn = self.conn.clone();

        let value: i64 = self
            .incr_script
            .key(&full)
            .arg(duration_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key = %full, error = %e, "Redis increment failed");
                StoreError::Redis(e)
            })?;

        debug!(key = %full, value = value, "Incremented shared counter");
        u64::try_from(value).map_err(|_| StoreError::Corrupt {
            key: full,
            value: value.to_string(),
        })
    }

    async fn get(&self, key: &str) -> std::result::Result<u64, StoreError> {
        let full = self.full_key(key);
        let mut conn = self.conn.clone();

        let raw: Option<String> = conn.get(&full).await.map_err(|e| {
            warn!(key = %full, error = %e, "Redis read failed");
            StoreError::Redis(e)
        })?;

        match raw {
            Some(raw) => parse_count(&full, &raw),
            None => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError> {
        let full = self.full_key(key);
        let mut conn = self.conn.clone();

        // PEXPIRE on a missing key is a no-op that replies 0
        let _: i64 = conn.pexpire(&full, duration_millis(ttl)).await?;
        Ok(())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }
}

/// Fall back to the default namespace for blank prefixes.
fn normalize_prefix(prefix: &str) -> String {
    if prefix.trim().is_empty() {
        DEFAULT_KEY_PREFIX.to_string()
    } else {
        prefix.to_string()
    }
}

fn parse_count(key: &str, raw: &str) -> std::result::Result<u64, StoreError> {
    raw.trim().parse::<u64>().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// Hide credentials before a URL reaches the logs.
fn sanitize_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
