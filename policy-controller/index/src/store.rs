//! Keyed, multi-index in-memory stores.
//!
//! Every entity the reconciler owns lives in a [`Store`]: items are
//! addressed by a primary key and, optionally, through named secondary
//! indices derived from the item itself. Stores are plain in-memory maps
//! mutated only by the reconciler task.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};

/// Items that carry their own primary key.
pub(crate) trait Indexed {
    fn store_key(&self) -> String;
}

/// A named secondary index: derives zero or more index keys from an item.
pub(crate) type IndexFn<T> = fn(&T) -> Vec<String>;

pub(crate) struct Store<T: Indexed> {
    items: HashMap<String, T>,
    indexers: Vec<(&'static str, IndexFn<T>)>,
    inverted: HashMap<&'static str, HashMap<String, HashSet<String>>>,
}

impl<T: Indexed> Store<T> {
    pub(crate) fn new(indexers: Vec<(&'static str, IndexFn<T>)>) -> Self {
        let inverted = indexers
            .iter()
            .map(|(name, _)| (*name, HashMap::default()))
            .collect();
        Self {
            items: HashMap::default(),
            indexers,
            inverted,
        }
    }

    /// Inserts or replaces an item, refreshing all secondary indices.
    pub(crate) fn insert(&mut self, item: T) {
        let key = item.store_key();
        self.remove(&key);
        for (name, index_fn) in &self.indexers {
            for index_key in index_fn(&item) {
                self.inverted
                    .get_mut(name)
                    .unwrap()
                    .entry(index_key)
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.items.insert(key, item);
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<T> {
        let item = self.items.remove(key)?;
        for (name, index_fn) in &self.indexers {
            let map = self.inverted.get_mut(name).unwrap();
            for index_key in index_fn(&item) {
                if let Some(keys) = map.get_mut(&index_key) {
                    keys.remove(key);
                    if keys.is_empty() {
                        map.remove(&index_key);
                    }
                }
            }
        }
        Some(item)
    }

    pub(crate) fn get(&self, key: &str) -> Option<&T> {
        self.items.get(key)
    }

    /// Mutable access to an item. Callers must not change fields that feed a
    /// secondary index; remove and reinsert instead.
    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.items.get_mut(key)
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Primary keys of the items matching `index_key` under the named index.
    pub(crate) fn by_index(&self, index: &'static str, index_key: &str) -> Vec<String> {
        let mut keys = self
            .inverted
            .get(index)
            .and_then(|map| map.get(index_key))
            .map(|keys| keys.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys = self.items.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.items.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}
