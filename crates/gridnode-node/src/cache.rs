//! Idle-expiring cache with explicit sweeps.
//!
//! Each entry remembers when it was last read or written. An entry idle for
//! longer than the TTL is invisible to [`ExpiringCache::get`] but stays in
//! the map until [`ExpiringCache::sweep_expired`] hands it back to the
//! caller, so the caller always runs its own cleanup for every removal.
//! There is no hidden removal listener and no eviction ordering beyond
//! "swept entries come back in one batch".
//!
//! # Concurrency model
//!
//! The cache is **not internally synchronized**. The node wraps each cache
//! in its own `Mutex`. Removed values are handed back so their cleanup can
//! run after the lock is released.

use std::collections::{HashMap, hash_map};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    last_access: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        ttl.is_some_and(|ttl| now.saturating_duration_since(self.last_access) > ttl)
    }
}

/// A map whose entries expire after a period without access.
///
/// A `None` TTL never expires anything; such caches are emptied only by
/// [`invalidate`](Self::invalidate).
pub struct ExpiringCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    ttl: Option<Duration>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// A cache that only loses entries when they are invalidated.
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Insert or replace an entry, returning the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let entry = Entry {
            value,
            last_access: Instant::now(),
        };
        self.entries.insert(key, entry).map(|e| e.value)
    }

    /// Insert only if `key` is not present, expired entries included.
    /// Hands `value` back when the key is taken.
    pub fn try_insert(&mut self, key: K, value: V) -> Result<(), V> {
        match self.entries.entry(key) {
            hash_map::Entry::Occupied(_) => Err(value),
            hash_map::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    value,
                    last_access: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Look up an entry and refresh its idle timer.
    ///
    /// Expired entries read as absent; they are left for the sweep.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        let ttl = self.ttl;
        let entry = self.entries.get_mut(key)?;
        if entry.is_expired(ttl, now) {
            return None;
        }
        entry.last_access = now;
        Some(entry.value.clone())
    }

    /// Look up an entry without refreshing it.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(self.ttl, Instant::now()))
            .map(|e| &e.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Remove an entry regardless of its age.
    pub fn invalidate(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Remove and return every entry idle longer than the TTL at `now`.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<(K, V)> {
        let ttl = self.ttl;
        if ttl.is_none() {
            return Vec::new();
        }
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(ttl, now))
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e.value)))
            .collect()
    }

    /// Remove and return every entry for which `predicate` holds.
    pub fn drain_where(&mut self, mut predicate: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)> {
        let matching: Vec<K> = self
            .entries
            .iter()
            .filter(|(k, e)| predicate(k, &e.value))
            .map(|(k, _)| k.clone())
            .collect();

        matching
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e.value)))
            .collect()
    }

    /// Number of entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }
}
