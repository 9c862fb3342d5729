//! S3-FIFO cache of decoded btree nodes.
//!
//! New entries go to a small FIFO queue. Entries that are read again before
//! they reach its head move to the main queue; the rest are evicted and
//! remembered in a ghost queue so that a quick re-insert goes straight to
//! main. Node addresses are immutable, so entries never need invalidating.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_FREQUENCY: u8 = 3;

struct Slot<V> {
    value: V,
    freq: u8,
}

pub struct Cache<K, V> {
    capacity: usize,
    small_capacity: usize,
    small: VecDeque<K>,
    main: VecDeque<K>,
    ghost: VecDeque<K>,
    ghost_keys: HashSet<K>,
    entries: HashMap<K, Slot<V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            small_capacity: (capacity / 10).max(1),
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            ghost_keys: HashSet::new(),
            entries: HashMap::new(),
            stats: Stats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.freq = (slot.freq + 1).min(MAX_FREQUENCY);
                self.stats.hit();
                Some(slot.value.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.value = value;
            return;
        }
        while self.entries.len() >= self.capacity {
            self.evict();
        }
        if self.ghost_keys.remove(&key) {
            self.ghost.retain(|k| k != &key);
            self.main.push_back(key.clone());
        } else {
            self.small.push_back(key.clone());
        }
        self.entries.insert(key, Slot { value, freq: 0 });
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn evict(&mut self) {
        if self.small.len() >= self.small_capacity || self.main.is_empty() {
            if self.evict_small() {
                return;
            }
        }
        self.evict_main();
    }

    /// Returns true if an entry left the cache.
    fn evict_small(&mut self) -> bool {
        while let Some(key) = self.small.pop_front() {
            let freq = self.entries.get(&key).map(|s| s.freq).unwrap_or(0);
            if freq > 0 {
                if let Some(slot) = self.entries.get_mut(&key) {
                    slot.freq = 0;
                }
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.remember(key);
                return true;
            }
        }
        false
    }

    fn evict_main(&mut self) {
        while let Some(key) = self.main.pop_front() {
            match self.entries.get_mut(&key) {
                Some(slot) if slot.freq > 0 => {
                    slot.freq -= 1;
                    self.main.push_back(key);
                }
                _ => {
                    self.entries.remove(&key);
                    return;
                }
            }
        }
    }

    fn remember(&mut self, key: K) {
        if self.ghost.len() >= self.capacity {
            if let Some(old) = self.ghost.pop_front() {
                self.ghost_keys.remove(&old);
            }
        }
        self.ghost_keys.insert(key.clone());
        self.ghost.push_back(key);
    }
}

#[derive(Default)]
struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read() {
        let mut cache = Cache::new(2);

        cache.insert("apple", "red");
        cache.insert("banana", "yellow");

        assert_eq!(cache.get(&"apple"), Some("red"));
        assert_eq!(cache.get(&"banana"), Some("yellow"));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut cache = Cache::new(10);
        for i in 0..1000 {
            cache.insert(i, i * 2);
            assert!(cache.len() <= 10);
        }
        assert_eq!(cache.get(&999), Some(1998));
        assert!(cache.get(&0).is_none());
    }

    #[test]
    fn test_frequently_read_entries_survive() {
        let mut cache = Cache::new(10);
        cache.insert(-1, -1);
        for i in 0..100 {
            cache.get(&-1);
            cache.insert(i, i);
        }
        assert_eq!(cache.get(&-1), Some(-1));
    }

    #[test]
    fn test_hit_ratio() {
        let cap = 10;
        let mut cache = Cache::new(cap);

        for i in 0..cap {
            cache.insert(i, i);
        }
        for i in 0..cap {
            assert_eq!(cache.get(&i), Some(i));
        }
        cache.get(&(cap + 1));

        assert_eq!(cache.stats(), (cap, 1));
    }
}
