//! Two-tier volatile cache for processed updates.
//!
//! This crate provides:
//! - [`CacheKey`]: content-addressed fingerprint of `(category, payload)`
//! - [`TtlTier`]: time-bounded tier, consulted first
//! - [`RecencyTier`]: size-bounded LRU tier, the stale fallback
//! - [`DualCache`]: writes both tiers, reads TTL then recency

pub mod key;
pub mod recency;
pub mod ttl;

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use updaterelay_shared::{Category, Payload, PipelineConfig, Result};

pub use key::CacheKey;
pub use recency::RecencyTier;
pub use ttl::{CacheEntry, TtlTier};

/// Which tier an admin operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Ttl,
    Recency,
}

impl std::str::FromStr for CacheTier {
    type Err = updaterelay_shared::UpdateRelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ttl" => Ok(Self::Ttl),
            "recency" | "lru" => Ok(Self::Recency),
            other => Err(updaterelay_shared::UpdateRelayError::validation(format!(
                "unknown cache tier '{other}', expected 'ttl' or 'recency'"
            ))),
        }
    }
}

/// Entry counts per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct CacheStats {
    /// Entries in the TTL tier that are still fresh.
    pub ttl_size: usize,
    /// Entries in the recency tier.
    pub recency_size: usize,
}

/// TTL tier plus recency tier over one key space.
#[derive(Debug)]
pub struct DualCache {
    ttl: TtlTier,
    recency: RecencyTier,
    default_ttl: Duration,
}

impl DualCache {
    pub fn new(default_ttl: Duration, ttl_capacity: usize, recency_capacity: usize) -> Self {
        Self {
            ttl: TtlTier::new(ttl_capacity),
            recency: RecencyTier::new(recency_capacity),
            default_ttl,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.ttl, config.ttl_capacity, config.recency_capacity)
    }

    /// Cache `payload` with the default TTL.
    pub fn put(&self, category: Category, payload: &Payload) -> Result<CacheKey> {
        self.put_with_ttl(category, payload, self.default_ttl)
    }

    /// Cache `payload` in both tiers. Last write for a key wins.
    pub fn put_with_ttl(
        &self,
        category: Category,
        payload: &Payload,
        ttl: Duration,
    ) -> Result<CacheKey> {
        self.store(category, payload, payload.clone(), ttl)
    }

    /// Cache `value` under the key of `shape`, so a later `get(category, shape)`
    /// returns `value`. Used for read-through lookups where the request and
    /// the response differ.
    pub fn put_for(&self, category: Category, shape: &Payload, value: Payload) -> Result<CacheKey> {
        self.store(category, shape, value, self.default_ttl)
    }

    fn store(
        &self,
        category: Category,
        shape: &Payload,
        value: Payload,
        ttl: Duration,
    ) -> Result<CacheKey> {
        let key = CacheKey::compute(category, shape)?;

        self.ttl.insert(key.clone(), CacheEntry::new(value.clone(), ttl));
        self.recency.insert(key.clone(), value);

        debug!(%key, ttl_secs = ttl.as_secs(), "cached payload");
        Ok(key)
    }

    /// Fresh TTL hit, else the recency tier's (possibly stale) copy.
    pub fn get(&self, category: Category, payload: &Payload) -> Option<Payload> {
        let key = self.key_for(category, payload)?;

        if let Some(fresh) = self.ttl.get_fresh(&key, Instant::now()) {
            return Some(fresh);
        }
        self.recency.get(&key)
    }

    /// TTL tier only; `None` once the entry has expired.
    pub fn get_fresh(&self, category: Category, payload: &Payload) -> Option<Payload> {
        let key = self.key_for(category, payload)?;
        self.ttl.get_fresh(&key, Instant::now())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            ttl_size: self.ttl.fresh_len(Instant::now()),
            recency_size: self.recency.len(),
        }
    }

    /// Clear one tier, or both when `tier` is `None`.
    pub fn clear(&self, tier: Option<CacheTier>) {
        if matches!(tier, None | Some(CacheTier::Ttl)) {
            self.ttl.clear();
        }
        if matches!(tier, None | Some(CacheTier::Recency)) {
            self.recency.clear();
        }
    }

    /// Drop expired TTL entries from memory.
    pub fn sweep_expired(&self) -> usize {
        self.ttl.sweep_expired(Instant::now())
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn key_for(&self, category: Category, payload: &Payload) -> Option<CacheKey> {
        match CacheKey::compute(category, payload) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(%category, error = %e, "cannot fingerprint payload for lookup");
                None
            }
        }
    }
}
