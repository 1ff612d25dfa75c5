//! Counter stores backing the sliding window limiter.
//!
//! A store keeps opaque bucket identifiers mapped to expiring integer
//! counters. Increments to the same key must be atomic across every caller
//! sharing the store; reads never create keys.

mod distributed;
mod memory;

pub use distributed::RedisCounterStore;
pub use memory::MemoryCounterStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::ratelimit::Clock;

/// Trait for counter store implementations.
///
/// TTL policy is backend specific: the in-process store refreshes the TTL on
/// every increment, Redis fixes it when the key is created. Callers must not
/// rely on either behavior being portable.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to the counter, creating it at 1 if absent or expired, and
    /// return the value after the increment.
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> std::result::Result<u64, StoreError>;

    /// Current value, or 0 when the key is absent or expired.
    async fn get(&self, key: &str) -> std::result::Result<u64, StoreError>;

    /// Overwrite the remaining time-to-live. No-op for missing keys.
    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError>;

    /// Short backend name used in logs and metrics.
    fn backend(&self) -> StoreBackend;
}

/// Available counter store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Node-local, bounded, in-process store
    #[default]
    Memory,
    /// Shared store on a Redis server
    Redis,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Redis => "redis",
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the store selected by configuration.
///
/// Redis connections are established eagerly so that an unreachable server
/// fails startup instead of the first request.
pub async fn build_store(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    info!(backend = %config.backend, "Building counter store");

    let store: Arc<dyn CounterStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryCounterStore::with_clock(config.max_size, clock)?),
        StoreBackend::Redis => Arc::new(RedisCounterStore::connect(config).await?),
    };
    Ok(store)
}

/// A store whose every call fails as if the server were unreachable.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct UnavailableStore;

#[cfg(test)]
#[async_trait]
impl CounterStore for UnavailableStore {
    async fn increment_and_get(&self, _key: &str, _ttl: Duration) -> std::result::Result<u64, StoreError> {
        Err(unreachable_server())
    }

    async fn get(&self, _key: &str) -> std::result::Result<u64, StoreError> {
        Err(unreachable_server())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> std::result::Result<(), StoreError> {
        Err(unreachable_server())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }
}

#[cfg(test)]
fn unreachable_server() -> StoreError {
    StoreError::Redis(::redis::RedisError::from((
        ::redis::ErrorKind::IoError,
        "connection refused",
    )))
}
