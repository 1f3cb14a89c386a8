//! Bounded result caches
//!
//! Layer proxies keep their results in [`KeyedCache`]s keyed by reconstruction
//! time (plus whatever parameters the result depends on). Bounded caches evict
//! the least-recently-used entry on overflow.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Statistics about one cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cache Statistics:")?;
        writeln!(
            f,
            "  Hits: {} | Misses: {} | Hit Rate: {:.1}%",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0
        )?;
        writeln!(
            f,
            "  Entries: {}/{} | Evictions: {}",
            self.entries, self.capacity, self.evictions
        )?;
        Ok(())
    }
}

/// What happened when a value was inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Inserted,
    Replaced,
    /// The least-recently-used entry was dropped to make room.
    Evicted,
}

/// LRU cache from a request key to a shared result.
#[derive(Debug)]
pub struct KeyedCache<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

fn capacity(max_entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)
}

impl<K: Hash + Eq, V: Clone> KeyedCache<K, V> {
    /// A cache holding at most `max_entries` (at least one).
    pub fn new(max_entries: usize) -> Self {
        KeyedCache {
            entries: LruCache::new(capacity(max_entries)),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up `key` without touching recency or statistics.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Insertion {
        if self.entries.contains(&key) {
            self.entries.put(key, value);
            return Insertion::Replaced;
        }
        match self.entries.push(key, value) {
            Some(_) => {
                self.evictions += 1;
                Insertion::Evicted
            }
            None => Insertion::Inserted,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key)
    }

    /// Drop every entry; returns whether anything was dropped.
    pub fn clear(&mut self) -> bool {
        let had_entries = !self.entries.is_empty();
        self.entries.clear();
        had_entries
    }

    /// Change the bound, evicting least-recently-used entries if it shrinks.
    pub fn resize(&mut self, max_entries: usize) {
        let before = self.entries.len();
        self.entries.resize(capacity(max_entries));
        self.evictions += (before - self.entries.len()) as u64;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.entries.len(),
            capacity: self.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_insert() {
        let mut cache = KeyedCache::new(2);

        assert_eq!(cache.insert(1, "one"), Insertion::Inserted);
        assert_eq!(cache.get(&1), Some("one"));
        assert_eq!(cache.get(&2), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = KeyedCache::new(2);
        cache.insert(1, 'a');
        cache.insert(2, 'b');
        cache.get(&1);

        assert_eq!(cache.insert(3, 'c'), Insertion::Evicted);
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_is_not_eviction() {
        let mut cache = KeyedCache::new(1);
        cache.insert(1, 'a');
        assert_eq!(cache.insert(1, 'b'), Insertion::Replaced);
        assert_eq!(cache.peek(&1), Some(&'b'));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_resize_shrinks() {
        let mut cache = KeyedCache::new(3);
        for key in 0..3 {
            cache.insert(key, key);
        }
        cache.resize(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&2));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut cache = KeyedCache::new(0);
        cache.insert(1, 1);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.clear());
        assert!(!cache.clear());
    }
}
