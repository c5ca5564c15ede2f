use std::hash::Hash;

use dashmap::{
    DashMap,
    DashSet,
};

/// Keyed store with per-entry mutation. Reads hand out clones so callers
/// never hold a shard lock across their own work.
#[derive(Debug, Default)]
pub struct Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    inner: DashMap<K, V>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn set(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Mutates an entry in place while its shard is held.
    pub fn update<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        match self.inner.get_mut(key) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }
}

/// Set owning its values; insertion order is not preserved.
#[derive(Debug, Default)]
pub struct ConcurrentSet<T>
where
    T: Eq + Hash + Clone,
{
    inner: DashSet<T>,
}

impl<T> ConcurrentSet<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: DashSet::new(),
        }
    }

    /// Returns true when the value was newly inserted.
    pub fn insert(&self, value: T) -> bool {
        self.inner.insert(value)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.inner.contains(value)
    }

    pub fn remove(&self, value: &T) -> bool {
        self.inner.remove(value).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }
}
