//! # cache
//!
//! why: answer repeated reads without touching the backing map or the replicas
//! relations: fronts KvStore in store.rs and backs the coordinator's write cache
//! what: KvCache, fixed capacity with oldest-insertion eviction

use std::collections::{HashMap, VecDeque};

/// Fixed-capacity map that evicts its oldest insertion first.
///
/// Reads take `&self`, so a cache behind an `RwLock` serves concurrent
/// readers. A capacity of zero disables caching.
#[derive(Debug, Clone)]
pub struct KvCache {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl KvCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Inserts or overwrites `key`; overwriting keeps its eviction position.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let key = key.into();
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value.into();
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value.into());
    }

    /// Removes `key`, returning whether it was cached.
    pub fn delete(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entry_is_evicted() {
        let mut cache = KvCache::new(2);
        cache.put("a", "1");
        cache.put("b", "2");
        cache.put("c", "3");

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some("2"));
        assert_eq!(cache.get("c"), Some("3"));
    }

    #[test]
    fn overwrite_does_not_evict() {
        let mut cache = KvCache::new(2);
        cache.put("a", "1");
        cache.put("b", "2");
        cache.put("a", "updated");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some("updated"));
    }

    #[test]
    fn delete_frees_a_slot() {
        let mut cache = KvCache::new(2);
        cache.put("a", "1");
        cache.put("b", "2");
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.put("c", "3");

        assert_eq!(cache.get("b"), Some("2"));
        assert_eq!(cache.get("c"), Some("3"));
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = KvCache::new(0);
        cache.put("a", "1");
        assert!(cache.is_empty());
    }
}
