//! Resolution cache with TTL expiration and LRU eviction.
//!
//! A single network boot makes dozens of requests for the same address
//! within seconds (script, kernel, initrd, ...). Entries are keyed by the
//! requested address and the lifecycle threshold of the lookup, so a
//! kickstart lookup never sees a boot-script result or the other way round.
//!
//! A capacity or TTL of zero disables caching entirely.

use metalboot_common::{HwAddr, InstallState};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::resolver::Resolution;

type Key = (HwAddr, InstallState);

struct CacheEntry {
    value: Resolution,
    inserted_at: Instant,
    /// Access tick for LRU ordering
    last_accessed: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Key, CacheEntry>,
    tick: u64,
    stats: CacheStats,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_lru(&mut self) {
        let lru_key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());

        if let Some(key) = lru_key {
            self.entries.remove(&key);
            self.stats.evictions += 1;
            tracing::debug!(
                mac = %key.0,
                cache_evictions = self.stats.evictions,
                "resolution cache LRU eviction"
            );
        }
    }
}

/// Bounded, internally synchronized resolution cache
pub struct ResolutionCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl ResolutionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A cache that never stores anything
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0 && !self.ttl.is_zero()
    }

    // a panic while holding the lock leaves the map consistent
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a fresh entry. Expired entries are removed eagerly.
    pub fn get(&self, mac: &HwAddr, threshold: InstallState) -> Option<Resolution> {
        if !self.is_enabled() {
            return None;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        let key = (mac.clone(), threshold);
        let tick = inner.next_tick();

        let expired = match inner.entries.get_mut(&key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                entry.last_accessed = tick;
                let value = entry.value.clone();
                inner.stats.hits += 1;
                tracing::debug!(mac = %mac, cache_hits = inner.stats.hits, "resolution cache hit");
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(&key);
        }
        inner.stats.misses += 1;
        tracing::debug!(
            mac = %mac,
            expired,
            cache_misses = inner.stats.misses,
            "resolution cache miss"
        );
        None
    }

    /// Insert or replace an entry; last writer wins.
    pub fn insert(&self, mac: &HwAddr, threshold: InstallState, value: Resolution) {
        if !self.is_enabled() {
            return;
        }

        let mut inner = self.lock();
        let key = (mac.clone(), threshold);
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            inner.evict_lru();
        }

        let last_accessed = inner.next_tick();
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                last_accessed,
            },
        );
    }

    /// Drop every entry that resolved to the given installation.
    pub fn invalidate_installation(&self, uuid: Uuid) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| entry.value.installation.uuid != uuid);
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
