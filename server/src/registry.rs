//! Thread-safe keyed entity collections.
//!
//! One registry per entity kind, all owned by the simulation engine. Lookups
//! and mutation are safe while other tasks iterate; `snapshot` hands out a
//! point-in-time copy with no ordering guarantee.

use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;
use std::hash::Hash;

pub struct Registry<K: Eq + Hash, V> {
    items: DashMap<K, V>,
}

impl<K: Eq + Hash + Copy, V> Registry<K, V> {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
        }
    }

    pub fn insert(&self, id: K, value: V) {
        self.items.insert(id, value);
    }

    /// Removes and returns the entry. Removing an absent id is a no-op.
    pub fn remove(&self, id: K) -> Option<V> {
        self.items.remove(&id).map(|(_, v)| v)
    }

    pub fn get(&self, id: K) -> Option<Ref<'_, K, V>> {
        self.items.get(&id)
    }

    pub fn get_mut(&self, id: K) -> Option<RefMut<'_, K, V>> {
        self.items.get_mut(&id)
    }

    pub fn contains(&self, id: K) -> bool {
        self.items.contains_key(&id)
    }

    /// Applies `f` to the entry if present. A missing id yields `None`,
    /// which callers treat as a benign race, not an error.
    pub fn update<R>(&self, id: K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.items.get_mut(&id).map(|mut entry| f(entry.value_mut()))
    }

    pub fn for_each_mut(&self, mut f: impl FnMut(&mut V)) {
        for mut entry in self.items.iter_mut() {
            f(entry.value_mut());
        }
    }

    pub fn retain(&self, f: impl FnMut(&K, &mut V) -> bool) {
        self.items.retain(f);
    }

    pub fn ids(&self) -> Vec<K> {
        self.items.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<K: Eq + Hash + Copy, V: Clone> Registry<K, V> {
    /// Point-in-time copy of every value, safe to build while other tasks
    /// insert or remove.
    pub fn snapshot(&self) -> Vec<V> {
        self.items.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl<K: Eq + Hash + Copy, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
