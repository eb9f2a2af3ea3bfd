//! Keyed memo tables.
//!
//! Values are computed outside the table lock and inserted only if no other
//! caller won the race, so every caller observes the same cached value for a
//! key once one is stored. Concurrent misses on one key may compute twice.

use crate::key::CacheKey;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruConfig {
    /// Entries kept before the least recently used one is dropped.
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Entries live as long as the table.
    #[default]
    Unbounded,
    Lru(LruConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct Entry<V> {
    value: V,
    last_used: u64,
}

struct TableState<V> {
    entries: FxHashMap<CacheKey, Entry<V>>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V> Default for TableState<V> {
    fn default() -> Self {
        Self {
            entries: FxHashMap::default(),
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }
}

pub struct MemoTable<V> {
    name: &'static str,
    policy: CachePolicy,
    state: Mutex<TableState<V>>,
}

impl<V: Clone> MemoTable<V> {
    #[must_use]
    pub fn new(name: &'static str, policy: CachePolicy) -> Self {
        Self {
            name,
            policy,
            state: Mutex::new(TableState::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let entry = state.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    /// Returns the cached value for `key`, computing and storing it on a
    /// miss. Failed computations are not cached.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: CacheKey,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            self.state.lock().hits += 1;
            return Ok(value);
        }
        self.state.lock().misses += 1;
        let value = compute()?;

        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        if let Some(existing) = state.entries.get_mut(&key) {
            existing.last_used = tick;
            return Ok(existing.value.clone());
        }
        state.entries.insert(
            key,
            Entry {
                value: value.clone(),
                last_used: tick,
            },
        );
        if let CachePolicy::Lru(LruConfig { capacity }) = self.policy {
            while state.entries.len() > capacity.max(1) {
                let Some(oldest) = state
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                state.entries.remove(&oldest);
                state.evictions += 1;
                tracing::trace!(table = self.name, key = %oldest.as_string(), "evicted cache entry");
            }
        }
        Ok(value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> TableStats {
        let state = self.state.lock();
        TableStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            entries: state.entries.len(),
        }
    }

    /// Drops every entry and resets the counters.
    pub fn clear(&self) {
        *self.state.lock() = TableState::default();
    }
}

impl<V> fmt::Debug for MemoTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoTable")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("entries", &self.state.lock().entries.len())
            .finish()
    }
}
