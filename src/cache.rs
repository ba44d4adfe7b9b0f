//! Thread-safe key/value cache shared by definition sources.
//!
//! A single reader-writer lock guards both the values and the set of known
//! keys: lookups run in parallel, writes are exclusive.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug)]
struct CacheInner<K, V> {
    values: HashMap<K, V>,
    keys: HashSet<K>,
}

/// Key/value store plus the set of keys it currently knows.
#[derive(Debug)]
pub struct ValueCache<K, V> {
    inner: RwLock<CacheInner<K, V>>,
}

impl<K, V> ValueCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                values: HashMap::new(),
                keys: HashSet::new(),
            }),
        }
    }

    /// Create a cache pre-filled with `items`.
    pub fn with_items(items: impl IntoIterator<Item = (K, V)>) -> Self {
        let cache = Self::new();
        cache.add_or_replace(items);
        cache
    }

    pub fn try_get(&self, key: &K) -> Option<V> {
        self.inner.read().values.get(key).cloned()
    }

    /// Values for the requested keys. Unknown keys are dropped and a key
    /// requested twice is returned once.
    pub fn get_many<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> Vec<V>
    where
        K: 'a,
    {
        let inner = self.inner.read();
        let mut seen = HashSet::new();

        keys.into_iter()
            .filter(|k| seen.insert(*k))
            .filter_map(|k| inner.values.get(k).cloned())
            .collect()
    }

    /// Linear scan over every cached value.
    pub fn get_by_predicate(&self, predicate: impl Fn(&V) -> bool) -> Vec<V> {
        self.inner
            .read()
            .values
            .values()
            .filter(|v| predicate(v))
            .cloned()
            .collect()
    }

    /// First cached value matching `predicate`, in no particular order.
    pub fn find(&self, predicate: impl Fn(&V) -> bool) -> Option<V> {
        self.inner
            .read()
            .values
            .values()
            .find(|v| predicate(v))
            .cloned()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.read().values.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.read().keys.iter().cloned().collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().values.is_empty()
    }

    pub fn add_or_replace(&self, items: impl IntoIterator<Item = (K, V)>) {
        let mut inner = self.inner.write();
        for (key, value) in items {
            inner.keys.insert(key.clone());
            inner.values.insert(key, value);
        }
    }

    /// Remove `keys`, returning the ones that were actually present.
    pub fn remove<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> Vec<K>
    where
        K: 'a,
    {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        for key in keys {
            if inner.values.remove(key).is_some() {
                inner.keys.remove(key);
                removed.push(key.clone());
            }
        }
        removed
    }

    /// Evict every entry for which `should_evict` returns true, atomically
    /// with respect to readers and other writers.
    pub fn evict_where(&self, mut should_evict: impl FnMut(&K, &V) -> bool) -> Vec<K> {
        let mut inner = self.inner.write();
        let CacheInner { values, keys } = &mut *inner;

        let mut evicted = Vec::new();
        values.retain(|k, v| {
            if should_evict(k, v) {
                evicted.push(k.clone());
                false
            } else {
                true
            }
        });
        for key in &evicted {
            keys.remove(key);
        }
        evicted
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.values.clear();
        inner.keys.clear();
    }
}

impl<K, V> Default for ValueCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
