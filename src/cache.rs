//! Shared request cache keyed by request fingerprint.
//!
//! Destinations of the same tap share one cache; destinations resolving to
//! the same key share cached data while keeping independent state records.
//! Any implementation respecting LRU and TTL semantics satisfies the
//! [`RequestCache`] contract; [`LruTtlCache`] is the bundled one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::clock::{Clock, EpochMillis, SystemClock};
use crate::state::RequestKey;

/// A cached fetch result with its storage time and time-to-live.
///
/// `ttl_ms == 0` means the entry does not expire.
pub struct CachedResult<R> {
    pub result: R,
    pub stored_at: EpochMillis,
    pub ttl_ms: u64,
}

impl<R> CachedResult<R> {
    pub fn is_fresh(&self, now: EpochMillis) -> bool {
        self.ttl_ms == 0 || now < self.stored_at.saturating_add(self.ttl_ms)
    }
}

impl<R: Clone> Clone for CachedResult<R> {
    fn clone(&self) -> Self {
        Self { result: self.result.clone(), stored_at: self.stored_at, ttl_ms: self.ttl_ms }
    }
}

impl<R> fmt::Debug for CachedResult<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResult")
            .field("stored_at", &self.stored_at)
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}

/// Storage contract consumed by the request runner.
///
/// `get` returns only fresh entries; expired entries are dropped on access.
pub trait RequestCache<R>: Send + Sync {
    fn get(&self, key: &str) -> Option<CachedResult<R>>;
    fn set(&self, key: RequestKey, entry: CachedResult<R>);
    fn remove(&self, key: &str);
}

struct Slot<R> {
    entry: CachedResult<R>,
    last_used: u64,
}

struct LruState<R> {
    slots: HashMap<RequestKey, Slot<R>>,
    tick: u64,
}

/// Bounded in-memory cache with LRU eviction and TTL expiry.
pub struct LruTtlCache<R> {
    state: Mutex<LruState<R>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl<R: Clone + Send + Sync> LruTtlCache<R> {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LruState { slots: HashMap::new(), tick: 0 }),
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Clone + Send + Sync> RequestCache<R> for LruTtlCache<R> {
    fn get(&self, key: &str) -> Option<CachedResult<R>> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = match state.slots.get(key) {
            Some(slot) => slot.entry.is_fresh(now),
            None => return None,
        };
        if !fresh {
            state.slots.remove(key);
            return None;
        }
        state.tick += 1;
        let tick = state.tick;
        match state.slots.get_mut(key) {
            Some(slot) => {
                slot.last_used = tick;
                Some(slot.entry.clone())
            }
            None => None,
        }
    }

    fn set(&self, key: RequestKey, entry: CachedResult<R>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tick += 1;
        let tick = state.tick;
        state.slots.insert(key, Slot { entry, last_used: tick });
        if state.slots.len() > self.capacity {
            if let Some(oldest) = state
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(key, _)| Arc::clone(key))
            {
                state.slots.remove(&oldest);
            }
        }
    }

    fn remove(&self, key: &str) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).slots.remove(key);
    }
}

impl<R> fmt::Debug for LruTtlCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruTtlCache").field("capacity", &self.capacity).finish()
    }
}
