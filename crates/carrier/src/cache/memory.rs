//! In-memory cache tier.

use std::sync::{Mutex, MutexGuard};

use lru::LruCache;

use super::CacheEntry;

struct Inner {
    entries: LruCache<String, CacheEntry>,
    cost: usize,
}

/// A bounded in-memory cache of response entries.
///
/// Bounded by entry count and by total cost, where an entry's cost is its
/// body length in bytes. Bounds are best-effort: eviction is oldest-access
/// first but callers must not depend on a particular order, only on the
/// limits being respected after every write.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    count_limit: usize,
    cost_limit: usize,
}

impl MemoryCache {
    /// `0` for either limit means unbounded in that dimension.
    pub fn new(count_limit: usize, cost_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                cost: 0,
            }),
            count_limit,
            cost_limit,
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }

    pub fn put(&self, entry: CacheEntry) {
        let mut inner = self.lock();
        let cost = entry.body.len();
        if let Some(previous) = inner.entries.put(entry.key.clone(), entry) {
            inner.cost -= previous.body.len();
        }
        inner.cost += cost;
        self.trim(&mut inner);
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let removed = inner.entries.pop(key);
        if let Some(entry) = &removed {
            inner.cost -= entry.body.len();
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.cost = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn cost(&self) -> usize {
        self.lock().cost
    }

    fn over_limit(&self, inner: &Inner) -> bool {
        (self.count_limit != 0 && inner.entries.len() > self.count_limit)
            || (self.cost_limit != 0 && inner.cost > self.cost_limit)
    }

    fn trim(&self, inner: &mut MutexGuard<'_, Inner>) {
        while self.over_limit(inner) {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.cost -= evicted.body.len(),
                None => break,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::response::ResponseHeader;

    fn entry(key: &str, size: usize) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            header: ResponseHeader::synthesized(200, None),
            body: Bytes::from(vec![0u8; size]),
        }
    }

    #[test]
    fn round_trips_entries() {
        let cache = MemoryCache::new(0, 0);
        cache.put(entry("a", 16));

        let found = cache.get("a").unwrap();
        assert_eq!(found.body.len(), 16);
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn count_limit_is_enforced() {
        let cache = MemoryCache::new(2, 0);
        cache.put(entry("a", 1));
        cache.put(entry("b", 1));
        cache.put(entry("c", 1));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn cost_limit_evicts_oldest_access_first() {
        let cache = MemoryCache::new(0, 100);
        cache.put(entry("a", 50));
        cache.put(entry("b", 50));
        // Touch "a" so "b" is the eviction candidate.
        let _ = cache.get("a");
        cache.put(entry("c", 50));

        assert!(cache.cost() <= 100);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn replacing_an_entry_adjusts_cost() {
        let cache = MemoryCache::new(0, 0);
        cache.put(entry("a", 50));
        cache.put(entry("a", 10));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.cost(), 10);
    }

    #[test]
    fn remove_and_clear() {
        let cache = MemoryCache::new(0, 0);
        cache.put(entry("a", 5));
        cache.put(entry("b", 5));

        assert!(cache.remove("a").is_some());
        assert!(cache.get("a").is_none());
        assert_eq!(cache.cost(), 5);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.cost(), 0);
    }
}
