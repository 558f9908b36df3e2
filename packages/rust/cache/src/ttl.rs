//! Time-bounded cache tier.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use updaterelay_shared::Payload;

use crate::key::CacheKey;

/// A payload stored in the TTL tier.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Payload,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(payload: Payload, ttl: Duration) -> Self {
        Self {
            payload,
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Fresh while `now - cached_at < ttl`.
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) < self.ttl
    }

    pub fn expires_at(&self) -> Instant {
        self.cached_at + self.ttl
    }
}

/// Self-expiring tier. Expired entries stay in memory until swept but are
/// never returned.
#[derive(Debug)]
pub struct TtlTier {
    entries: DashMap<CacheKey, CacheEntry>,
    capacity: usize,
}

impl TtlTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Insert or replace `key`. Makes room by sweeping expired entries first,
    /// then by evicting the entry closest to expiry.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let swept = self.sweep_expired(Instant::now());
            if swept == 0 && self.entries.len() >= self.capacity {
                self.evict_soonest_expiring();
            }
        }

        self.entries.insert(key, entry);
    }

    /// Payload for `key` if it has not expired at `now`.
    pub fn get_fresh(&self, key: &CacheKey, now: Instant) -> Option<Payload> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh_at(now))
            .map(|entry| entry.payload.clone())
    }

    /// Number of entries still fresh at `now`.
    pub fn fresh_len(&self, now: Instant) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.is_fresh_at(now))
            .count()
    }

    /// Physically remove entries that expired at or before `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh_at(now));
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            debug!(swept, "swept expired ttl entries");
        }
        swept
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn evict_soonest_expiring(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.expires_at())
            .map(|entry| entry.key().clone());

        if let Some(key) = victim {
            self.entries.remove(&key);
            debug!(%key, "ttl tier full, evicted entry closest to expiry");
        }
    }
}
