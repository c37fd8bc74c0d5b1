//! The shared query result cache.
//!
//! Keyed by the deterministic operator cache keys; stores materialized
//! results only. One mutex guards the LRU list and the pinned map together.
//! Pinned entries are never evicted and do not count against the LRU entry
//! cap; both caps come from the runtime parameters. A failed insert never
//! fails the query.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::params::RuntimeParameters;
use crate::result::MaterializedResult;

pub type CacheKey = String;

struct CacheState {
    lru: LruCache<CacheKey, MaterializedResult>,
    pinned: FxHashMap<CacheKey, MaterializedResult>,
    /// Total bytes of unpinned entries.
    unpinned_bytes: usize,
}

pub struct QueryCache {
    state: Mutex<CacheState>,
    max_size: usize,
    max_size_single_entry: usize,
}

impl QueryCache {
    pub fn new(params: &RuntimeParameters) -> QueryCache {
        let capacity = NonZeroUsize::new(params.cache_max_num_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        QueryCache {
            state: Mutex::new(CacheState {
                lru: LruCache::new(capacity),
                pinned: FxHashMap::default(),
                unpinned_bytes: 0,
            }),
            max_size: params.cache_max_size,
            max_size_single_entry: params.cache_max_size_single_entry,
        }
    }

    pub fn lookup(&self, key: &str) -> Option<MaterializedResult> {
        let mut state = self.state.lock();
        if let Some(entry) = state.pinned.get(key) {
            return Some(entry.clone());
        }
        state.lru.get(key).cloned()
    }

    /// Insert an unpinned entry, evicting LRU entries until the size cap is
    /// respected. Oversized results are skipped silently.
    pub fn insert(&self, key: CacheKey, result: MaterializedResult) {
        let bytes = result.size_bytes();
        if bytes > self.max_size_single_entry {
            trace!(key, bytes, "result exceeds single-entry cap, not cached");
            return;
        }
        let mut state = self.state.lock();
        if state.pinned.contains_key(&key) {
            return;
        }
        if let Some(old) = state.lru.pop(&key) {
            state.unpinned_bytes -= old.size_bytes();
        }
        state.unpinned_bytes += bytes;
        state.lru.put(key, result);
        while state.unpinned_bytes > self.max_size {
            match state.lru.pop_lru() {
                Some((_, evicted)) => state.unpinned_bytes -= evicted.size_bytes(),
                None => break,
            }
        }
    }

    /// Insert an entry that survives every eviction.
    pub fn insert_pinned(&self, key: CacheKey, result: MaterializedResult) {
        let mut state = self.state.lock();
        if let Some(old) = state.lru.pop(&key) {
            state.unpinned_bytes -= old.size_bytes();
        }
        state.pinned.insert(key, result);
    }

    /// Drop an entry, e.g. when its computation was cancelled mid-insert.
    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(old) = state.lru.pop(key) {
            state.unpinned_bytes -= old.size_bytes();
        }
        state.pinned.remove(key);
    }

    pub fn clear_unpinned(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.unpinned_bytes = 0;
    }

    pub fn num_entries(&self) -> usize {
        let state = self.state.lock();
        state.lru.len() + state.pinned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idtable::IdTable;
    use crate::memory::MemoryLimit;
    use rdf_model::{Id, LocalVocab};
    use std::sync::Arc;

    fn result(rows: usize) -> MaterializedResult {
        let mut table = IdTable::new(1, MemoryLimit::unlimited());
        for i in 0..rows {
            table.push_row(&[Id::int(i as i64).unwrap()]).unwrap();
        }
        MaterializedResult {
            table: Arc::new(table),
            sorted_by: vec![0],
            vocab: Arc::new(LocalVocab::new()),
        }
    }

    fn cache(max_entries: usize, max_size: usize) -> QueryCache {
        let mut params = RuntimeParameters::default();
        params.cache_max_num_entries = max_entries;
        params.cache_max_size = max_size;
        QueryCache::new(&params)
    }

    #[test]
    fn lookup_after_insert() {
        let cache = cache(10, 1 << 20);
        cache.insert("a".into(), result(3));
        assert_eq!(cache.lookup("a").unwrap().table.num_rows(), 3);
        assert!(cache.lookup("b").is_none());
    }

    #[test]
    fn entry_cap_evicts_lru() {
        let cache = cache(2, 1 << 20);
        cache.insert("a".into(), result(1));
        cache.insert("b".into(), result(1));
        cache.insert("c".into(), result(1));
        assert!(cache.lookup("a").is_none());
        assert!(cache.lookup("b").is_some());
        assert!(cache.lookup("c").is_some());
    }

    #[test]
    fn size_cap_evicts() {
        // Each 64-row reservation is 512 bytes.
        let cache = cache(100, 1024);
        cache.insert("a".into(), result(1));
        cache.insert("b".into(), result(1));
        cache.insert("c".into(), result(1));
        assert_eq!(cache.num_entries(), 2);
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let cache = cache(1, 1 << 20);
        cache.insert_pinned("keep".into(), result(1));
        cache.insert("a".into(), result(1));
        cache.insert("b".into(), result(1));
        assert!(cache.lookup("keep").is_some());
        cache.clear_unpinned();
        assert!(cache.lookup("keep").is_some());
        assert!(cache.lookup("b").is_none());
    }

    #[test]
    fn remove_drops_in_progress_entry() {
        let cache = cache(10, 1 << 20);
        cache.insert("a".into(), result(1));
        cache.remove("a");
        assert!(cache.lookup("a").is_none());
    }
}
