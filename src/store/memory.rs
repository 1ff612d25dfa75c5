//! In-process counter store.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{CounterStore, StoreBackend};
use crate::error::{GateError, Result, StoreError};
use crate::ratelimit::clock::duration_millis;
use crate::ratelimit::{Clock, SystemClock};

/// A single counter and the instant it stops counting.
#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at: i64,
}

impl Slot {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// Node-local counter store bounded by a maximum number of entries.
///
/// Counters sit in an LRU ordered by last increment, under one lock, so every
/// operation is O(1) and concurrent hits on the same key are serialized.
/// Every increment resets the key's TTL, which makes the least recently
/// incremented entry also the one closest to expiry.
///
/// When full, inserting a new key evicts that entry. Expired entries are
/// dropped lazily, on read or by eviction. An early eviction only resets that
/// bucket early, which the sliding window already tolerates.
pub struct MemoryCounterStore {
    slots: Mutex<LruCache<String, Slot>>,
    max_size: NonZeroUsize,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create a store on the system clock.
    pub fn new(max_size: usize) -> Result<Self> {
        Self::with_clock(max_size, Arc::new(SystemClock))
    }

    /// Create a store whose expiry is judged against `clock`.
    pub fn with_clock(max_size: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        let max_size = NonZeroUsize::new(max_size)
            .ok_or_else(|| GateError::Config("max_size must be > 0".to_string()))?;

        info!(max_size = max_size.get(), "In-process counter store created");

        Ok(Self {
            slots: Mutex::new(LruCache::new(max_size)),
            max_size,
            clock,
        })
    }

    /// Number of entries currently held, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Get the entry bound for this store.
    pub fn max_size(&self) -> usize {
        self.max_size.get()
    }
}

impl std::fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCounterStore")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> std::result::Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get_mut(key) {
            if !slot.is_live(now) {
                slot.count = 0;
            }
            slot.count += 1;
            slot.expires_at = expires_at;
            return Ok(slot.count);
        }

        let evicted = slots.push(key.to_string(), Slot { count: 1, expires_at });
        if let Some((victim, slot)) = evicted {
            if slot.is_live(now) {
                debug!(key = %victim, "Evicted live counter to stay within max_size");
            }
        }
        Ok(1)
    }

    async fn get(&self, key: &str) -> std::result::Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut slots = self.slots.lock();

        // Reads leave recency alone so eviction follows increments only
        let live = slots.peek(key).map(|slot| slot.is_live(now).then_some(slot.count));
        match live {
            Some(Some(count)) => Ok(count),
            Some(None) => {
                slots.pop(key);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError> {
        let now = self.clock.now_millis();

        if let Some(slot) = self.slots.lock().peek_mut(key) {
            if slot.is_live(now) {
                slot.expires_at = now.saturating_add(duration_millis(ttl));
            }
        }
        Ok(())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }
}
