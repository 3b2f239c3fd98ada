//! The coherent, bounded LRU cache.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use tracing::debug;

/// Coherence state of a live cache entry.
///
/// INVALID is represented by absence: an invalidated entry is removed. The
/// cluster invariant is that at most one node holds a key MODIFIED; every
/// other copy must be SHARED or gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheState {
    Modified,
    Shared,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    state: CacheState,
}

/// Metrics snapshot for the `/metrics` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub maxsize: usize,
    /// Per-entry states, keyed by cache key.
    pub states: BTreeMap<String, CacheState>,
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Per-node bounded cache with cross-node invalidation hooks.
///
/// Strict LRU at `maxsize`: inserting into a full cache evicts exactly the
/// least-recently-used key. Evicted MODIFIED entries need no write-back; the
/// backing source is authoritative.
#[derive(Debug)]
pub struct CoherentCache {
    inner: Mutex<CacheInner>,
}

impl CoherentCache {
    pub fn new(maxsize: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(maxsize),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Look up a key. A live entry (MODIFIED or SHARED) is a hit and touches
    /// recency; anything else counts a miss and the caller falls through to
    /// the backing source.
    pub fn lookup(&self, key: &str) -> Option<(serde_json::Value, CacheState)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.entries.get(key) {
            Some(entry) => {
                let found = (entry.value.clone(), entry.state);
                inner.hits += 1;
                Some(found)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Install a value fetched from the backing source, in SHARED state.
    pub fn insert_shared(&self, key: impl Into<String>, value: serde_json::Value) {
        self.insert(key.into(), value, CacheState::Shared);
    }

    /// Apply a local write: the entry becomes MODIFIED. The caller must
    /// broadcast `invalidate` to peers after this returns.
    pub fn put_modified(&self, key: impl Into<String>, value: serde_json::Value) {
        self.insert(key.into(), value, CacheState::Modified);
    }

    fn insert(&self, key: String, value: serde_json::Value, state: CacheState) {
        let mut inner = self.inner.lock();
        if inner.entries.len() == inner.entries.cap().get() && !inner.entries.contains(&key) {
            if let Some((evicted, _)) = inner.entries.pop_lru() {
                debug!(key = %evicted, "LRU entry evicted");
            }
        }
        inner.entries.put(key, CacheEntry { value, state });
    }

    /// Drop an entry on a peer's invalidation (or any local reason).
    /// Returns whether an entry existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let existed = self.inner.lock().entries.pop(key).is_some();
        if existed {
            debug!(key, "Cache entry invalidated");
        }
        existed
    }

    /// Current state of a key, without touching recency or counters.
    pub fn state_of(&self, key: &str) -> Option<CacheState> {
        self.inner.lock().entries.peek(key).map(|e| e.state)
    }

    /// Metrics snapshot.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.entries.len(),
            maxsize: inner.entries.cap().get(),
            states: inner
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.state))
                .collect(),
        }
    }
}
