//! Recency-bounded (LRU) cache tier.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use updaterelay_shared::Payload;

use crate::key::CacheKey;

#[derive(Debug, Default)]
struct RecencyInner {
    /// key → (payload, last access tick)
    entries: HashMap<CacheKey, (Payload, u64)>,
    /// last access tick → key; the first entry is the least recently used.
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl RecencyInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &CacheKey) -> Option<Payload> {
        let tick = self.next_tick();
        let (payload, last) = self.entries.get_mut(key)?;
        let previous = std::mem::replace(last, tick);
        let payload = payload.clone();
        self.order.remove(&previous);
        self.order.insert(tick, key.clone());
        Some(payload)
    }
}

/// Bounded tier that evicts the least-recently-accessed entry.
///
/// All reads and writes go through one mutex, so a reader never observes a
/// key whose payload and position are out of step.
#[derive(Debug)]
pub struct RecencyTier {
    capacity: usize,
    inner: Mutex<RecencyInner>,
}

impl RecencyTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(RecencyInner::default()),
        }
    }

    /// Insert or replace `key`, marking it most recently used. Returns the
    /// evicted key, if any.
    pub fn insert(&self, key: CacheKey, payload: Payload) -> Option<CacheKey> {
        if self.capacity == 0 {
            return None;
        }

        let mut inner = self.lock();
        let tick = inner.next_tick();

        if let Some((_, previous)) = inner.entries.insert(key.clone(), (payload, tick)) {
            inner.order.remove(&previous);
        }
        inner.order.insert(tick, key);

        if inner.entries.len() <= self.capacity {
            return None;
        }

        let (_, victim) = inner.order.pop_first()?;
        inner.entries.remove(&victim);
        debug!(key = %victim, "recency tier full, evicted least recently used");
        Some(victim)
    }

    /// Payload for `key`, marking it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Payload> {
        self.lock().touch(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn lock(&self) -> MutexGuard<'_, RecencyInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
