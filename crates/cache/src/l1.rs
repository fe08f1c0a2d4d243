//! In-process LRU tier.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::entry::{now_millis, CacheEntry, CacheKey, Dtype};
use crate::error::CacheError;

/// Counters for one cache tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub errors: u64,
    pub size: usize,
}

#[derive(Debug, Default)]
pub(crate) struct TierCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub errors: AtomicU64,
}

impl TierCounters {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, size: usize) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            size,
        }
    }
}

/// Fixed-capacity LRU keyed by content hash.
///
/// The LRU list itself is unbounded; capacity is enforced here so that pinned
/// entries can be skipped when choosing a victim. Reorder on read and eviction
/// on insert happen under the same lock.
#[derive(Debug)]
pub struct L1Cache {
    capacity: usize,
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    counters: TierCounters,
}

impl L1Cache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(LruCache::unbounded()),
            counters: TierCounters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `key`, marking it most recently used and bumping its access
    /// count. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = now_millis();
        let mut entries = self.lock();

        let (found, expired) = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch();
                (Some(entry.clone()), false)
            }
            Some(_) => (None, true),
            None => (None, false),
        };

        if expired {
            entries.pop(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        drop(entries);

        if found.is_some() {
            self.counters.hit();
        } else {
            self.counters.miss();
        }
        found
    }

    /// Presence check that neither reorders nor counts.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = now_millis();
        self.lock()
            .peek(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Insert or replace an entry. When the cache is full and the key is new,
    /// the least recently used unpinned entry is evicted and its key returned.
    pub fn insert(&self, entry: CacheEntry) -> Result<Option<CacheKey>, CacheError> {
        let mut entries = self.lock();

        if entries.contains(&entry.key) {
            entries.put(entry.key.clone(), entry);
            return Ok(None);
        }

        let mut evicted = None;
        if entries.len() >= self.capacity {
            // iter() runs most- to least-recent.
            let victim = entries
                .iter()
                .rev()
                .find(|(_, candidate)| !candidate.pinned)
                .map(|(key, _)| key.clone());

            match victim {
                Some(victim) => {
                    entries.pop(&victim);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    evicted = Some(victim);
                }
                None => {
                    return Err(CacheError::CapacityPinned {
                        capacity: self.capacity,
                    });
                }
            }
        }

        entries.put(entry.key.clone(), entry);
        Ok(evicted)
    }

    /// Returns false when `key` is not resident.
    pub fn set_pinned(&self, key: &CacheKey, pinned: bool) -> bool {
        match self.lock().peek_mut(key) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock().pop(key)
    }

    /// Drop every entry whose tag set intersects `tags`. Returns the removed keys.
    pub fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> Vec<CacheKey> {
        self.remove_where(|entry| entry.has_any_tag(tags))
    }

    pub fn invalidate_dtype(&self, dtype: Dtype) -> Vec<CacheKey> {
        self.remove_where(|entry| entry.dtype == dtype)
    }

    /// Physically remove expired entries.
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        let removed = self.remove_where(|entry| entry.is_expired_at(now)).len();
        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> Vec<CacheKey> {
        let mut entries = self.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> TierStats {
        self.counters.snapshot(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Payload;
    use std::time::Duration;

    fn entry(text: &str) -> CacheEntry {
        CacheEntry::new(CacheKey::for_text(text), Payload::F32(vec![1.0, 2.0]), 1.0, None)
    }

    #[test]
    fn evicts_least_recently_used() {
        let l1 = L1Cache::new(3);
        for text in ["k1", "k2", "k3", "k4"] {
            l1.insert(entry(text)).unwrap();
        }

        assert_eq!(l1.len(), 3);
        assert!(l1.get(&CacheKey::for_text("k1")).is_none());
        for text in ["k2", "k3", "k4"] {
            assert!(l1.get(&CacheKey::for_text(text)).is_some(), "{text} should hit");
        }
        assert_eq!(l1.stats().evictions, 1);
    }

    #[test]
    fn read_refreshes_recency() {
        let l1 = L1Cache::new(2);
        l1.insert(entry("a")).unwrap();
        l1.insert(entry("b")).unwrap();
        l1.get(&CacheKey::for_text("a"));

        let evicted = l1.insert(entry("c")).unwrap();
        assert_eq!(evicted, Some(CacheKey::for_text("b")));
    }

    #[test]
    fn replacing_existing_key_does_not_evict() {
        let l1 = L1Cache::new(2);
        l1.insert(entry("a")).unwrap();
        l1.insert(entry("b")).unwrap();
        assert_eq!(l1.insert(entry("a")).unwrap(), None);
        assert_eq!(l1.len(), 2);
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let l1 = L1Cache::new(2);
        l1.insert(entry("pinned").with_pinned(true)).unwrap();
        l1.insert(entry("b")).unwrap();

        let evicted = l1.insert(entry("c")).unwrap();
        assert_eq!(evicted, Some(CacheKey::for_text("b")));
        assert!(l1.contains(&CacheKey::for_text("pinned")));
    }

    #[test]
    fn all_pinned_refuses_insert() {
        let l1 = L1Cache::new(1);
        l1.insert(entry("a").with_pinned(true)).unwrap();
        let err = l1.insert(entry("b")).unwrap_err();
        assert_eq!(err, CacheError::CapacityPinned { capacity: 1 });
        assert_eq!(l1.len(), 1);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let l1 = L1Cache::new(4);
        let short = CacheEntry::new(
            CacheKey::for_text("short"),
            Payload::F32(vec![1.0]),
            1.0,
            Some(Duration::from_millis(20)),
        );
        l1.insert(short).unwrap();
        assert!(l1.get(&CacheKey::for_text("short")).is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(l1.get(&CacheKey::for_text("short")).is_none());
        assert_eq!(l1.len(), 0);
        assert_eq!(l1.stats().expirations, 1);
    }

    #[test]
    fn access_count_increments_on_hit() {
        let l1 = L1Cache::new(4);
        l1.insert(entry("a")).unwrap();
        l1.get(&CacheKey::for_text("a"));
        let second = l1.get(&CacheKey::for_text("a")).unwrap();
        assert_eq!(second.access_count, 2);
    }

    #[test]
    fn tag_invalidation_is_exact() {
        let l1 = L1Cache::new(8);
        l1.insert(entry("a").with_tags(["t1"])).unwrap();
        l1.insert(entry("b").with_tags(["t2", "t3"])).unwrap();
        l1.insert(entry("c").with_tags(["t4"])).unwrap();
        l1.insert(entry("d")).unwrap();

        let removed = l1.invalidate_tags(&["t1", "t3"]);
        assert_eq!(removed.len(), 2);
        assert!(!l1.contains(&CacheKey::for_text("a")));
        assert!(!l1.contains(&CacheKey::for_text("b")));
        assert!(l1.contains(&CacheKey::for_text("c")));
        assert!(l1.contains(&CacheKey::for_text("d")));
    }

    #[test]
    fn dtype_invalidation_and_purge() {
        let l1 = L1Cache::new(8);
        l1.insert(entry("f")).unwrap();
        l1.insert(CacheEntry::new(
            CacheKey::for_text("q"),
            Payload::I8(vec![1]),
            0.1,
            Some(Duration::from_millis(1)),
        ))
        .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(l1.purge_expired(), 1);
        assert_eq!(l1.invalidate_dtype(Dtype::F32).len(), 1);
        assert!(l1.is_empty());
    }
}
