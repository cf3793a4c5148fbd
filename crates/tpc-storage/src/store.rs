//! # store
//!
//! why: hold a participant's committed data and answer its plain reads without touching the log
//! relations: written by tpc-node's participant on commit and by log replay; fronted by cache.rs
//! what: KeyValueStore trait, KvStore (bounded KvCache in front of a backing map)

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tpc_core::message::{check_key, check_value};
use tpc_core::{KvError, Mutation};

use crate::cache::KvCache;

/// Text of the not-found error returned to clients.
pub const DOES_NOT_EXIST: &str = "Does not exist";

/// The storage engine interface the participant depends on.
pub trait KeyValueStore: Send + Sync {
    /// Current value, or `KvError::NotFound`.
    fn get(&self, key: &str) -> Result<String, KvError>;

    fn put(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Removes `key`, returning whether it existed.
    fn delete(&self, key: &str) -> Result<bool, KvError>;

    fn apply(&self, mutation: &Mutation) -> Result<(), KvError> {
        match mutation {
            Mutation::Put { key, value } => self.put(key, value),
            Mutation::Delete { key } => self.delete(key).map(|_| ()),
        }
    }
}

/// Thread-safe in-memory store with a read cache.
pub struct KvStore {
    cache: Mutex<KvCache>,
    data: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(KvCache::new(cache_capacity)),
            data: Mutex::new(BTreeMap::new()),
        }
    }

    /// Copy of the backing map, for inspection.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.data).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.data).is_empty()
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KeyValueStore for KvStore {
    fn get(&self, key: &str) -> Result<String, KvError> {
        check_key(key)?;

        if let Some(value) = lock(&self.cache).get(key) {
            return Ok(value.to_string());
        }
        // keep the store locked until the cache is filled, or a put landing
        // in between would be shadowed by this older value
        let data = lock(&self.data);
        let value = data
            .get(key)
            .cloned()
            .ok_or_else(|| KvError::NotFound(DOES_NOT_EXIST.to_string()))?;
        lock(&self.cache).put(key, value.clone());
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        check_key(key)?;
        check_value(value)?;

        // store first, then cache, so a reader never sees a cached value the store lacks
        let mut data = lock(&self.data);
        data.insert(key.to_string(), value.to_string());
        lock(&self.cache).put(key, value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        check_key(key)?;

        let mut data = lock(&self.data);
        lock(&self.cache).delete(key);
        Ok(data.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_not_found() {
        let store = KvStore::new(10);
        let err = store.get("nope").unwrap_err();
        assert!(matches!(err, KvError::NotFound(_)));
        assert_eq!(err.to_string(), DOES_NOT_EXIST);
    }

    #[test]
    fn reads_fall_through_an_evicted_cache() {
        let store = KvStore::new(1);
        store.put("a", "1").unwrap();
        store.put("b", "2").unwrap();

        assert_eq!(store.get("a").unwrap(), "1");
        assert_eq!(store.get("b").unwrap(), "2");
    }

    #[test]
    fn delete_reports_presence() {
        let store = KvStore::new(10);
        store.put("a", "1").unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.get("a").is_err());
    }

    #[test]
    fn cache_fill_never_shadows_a_newer_put() {
        let store = KvStore::new(1);
        store.put("k", "0").unwrap();
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while !done.load(std::sync::atomic::Ordering::Relaxed) {
                        store.get("k").unwrap();
                    }
                });
            }
            for i in 1..=2000 {
                // evict "k" so readers keep refilling it from the store
                store.put("x", "evict").unwrap();
                store.put("k", &i.to_string()).unwrap();
            }
            done.store(true, std::sync::atomic::Ordering::Relaxed);
        });

        assert_eq!(store.snapshot()["k"], "2000");
        assert_eq!(store.get("k").unwrap(), "2000");
    }

    #[test]
    fn limits_are_enforced_at_the_store() {
        let store = KvStore::new(10);
        assert!(matches!(store.put("", "v"), Err(KvError::Validation(_))));
        assert!(matches!(store.put("k", ""), Err(KvError::Validation(_))));
        assert!(store.is_empty());
    }
}
