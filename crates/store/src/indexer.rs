//! Primary object map plus secondary indices, kept consistent under one lock.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::{FxHashMap, FxHashSet};
use skein_core::{ObjectKey, Resource};

use crate::StoreError;

/// Derives zero or more index values from an object.
pub type IndexFunc<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

pub const NAMESPACE_INDEX: &str = "namespace";

pub fn namespace_index_func<K: Resource>() -> IndexFunc<K> {
    Arc::new(|obj: &K| obj.namespace().map(|ns| vec![ns.to_string()]).unwrap_or_default())
}

/// Named index functions.
pub struct Indexers<K> {
    funcs: BTreeMap<String, IndexFunc<K>>,
}

impl<K> Clone for Indexers<K> {
    fn clone(&self) -> Self {
        Self { funcs: self.funcs.clone() }
    }
}

impl<K> Default for Indexers<K> {
    fn default() -> Self {
        Self { funcs: BTreeMap::new() }
    }
}

impl<K: Resource> Indexers<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexers with only the namespace index.
    pub fn namespaced() -> Self {
        Self::new().with(NAMESPACE_INDEX, namespace_index_func())
    }

    pub fn with(mut self, name: &str, func: IndexFunc<K>) -> Self {
        self.funcs.insert(name.to_string(), func);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.funcs.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

type Index = FxHashMap<String, FxHashSet<ObjectKey>>;

struct Inner<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    funcs: BTreeMap<String, IndexFunc<K>>,
    indices: FxHashMap<String, Index>,
}

impl<K: Resource> Inner<K> {
    fn reindex(&mut self, key: &ObjectKey, old: Option<&K>, new: Option<&K>) {
        for (name, func) in &self.funcs {
            let old_vals = old.map(|o| func(o)).unwrap_or_default();
            let new_vals = new.map(|n| func(n)).unwrap_or_default();
            if old_vals == new_vals {
                continue;
            }
            let index = self.indices.entry(name.clone()).or_default();
            for v in &old_vals {
                if let Some(set) = index.get_mut(v) {
                    set.remove(key);
                    if set.is_empty() {
                        index.remove(v);
                    }
                }
            }
            for v in new_vals {
                index.entry(v).or_default().insert(key.clone());
            }
        }
    }
}

/// Thread-safe indexed store. Writers take the lock exclusively per mutation,
/// readers share it, so a reader never sees the primary map and an index disagree.
pub struct Indexer<K> {
    inner: RwLock<Inner<K>>,
}

impl<K: Resource> Indexer<K> {
    pub fn new(indexers: Indexers<K>) -> Self {
        Self {
            inner: RwLock::new(Inner { items: FxHashMap::default(), funcs: indexers.funcs, indices: FxHashMap::default() }),
        }
    }

    // Every critical section leaves the maps consistent, so a poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace; returns the previous object.
    pub fn update(&self, key: ObjectKey, obj: Arc<K>) -> Option<Arc<K>> {
        let mut inner = self.write();
        let old = inner.items.insert(key.clone(), Arc::clone(&obj));
        inner.reindex(&key, old.as_deref(), Some(obj.as_ref()));
        old
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut inner = self.write();
        let old = inner.items.remove(key);
        if let Some(o) = &old {
            inner.reindex(key, Some(o.as_ref()), None);
        }
        old
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().items.get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.read().items.contains_key(key)
    }

    /// Snapshot of all objects, ordered by key. Later mutations do not affect it.
    pub fn list(&self) -> Vec<Arc<K>> {
        let inner = self.read();
        let mut entries: Vec<(&ObjectKey, &Arc<K>)> = inner.items.iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    pub fn list_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>, StoreError> {
        let inner = self.read();
        if !inner.funcs.contains_key(index) {
            return Err(StoreError::UnknownIndex(index.to_string()));
        }
        let mut keys: Vec<ObjectKey> = inner
            .indices
            .get(index)
            .and_then(|idx| idx.get(value))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        Ok(keys)
    }

    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> {
        let inner = self.read();
        if !inner.funcs.contains_key(index) {
            return Err(StoreError::UnknownIndex(index.to_string()));
        }
        let Some(set) = inner.indices.get(index).and_then(|idx| idx.get(value)) else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<&ObjectKey> = set.iter().collect();
        keys.sort_unstable();
        Ok(keys.into_iter().filter_map(|k| inner.items.get(k).cloned()).collect())
    }

    /// Distinct values currently present in an index.
    pub fn list_index_values(&self, index: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.read();
        if !inner.funcs.contains_key(index) {
            return Err(StoreError::UnknownIndex(index.to_string()));
        }
        let mut vals: Vec<String> = inner.indices.get(index).map(|idx| idx.keys().cloned().collect()).unwrap_or_default();
        vals.sort_unstable();
        Ok(vals)
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.read().funcs.contains_key(index)
    }

    /// Register more indices; existing objects are indexed immediately.
    pub fn add_indexers(&self, indexers: Indexers<K>) -> Result<(), StoreError> {
        let mut inner = self.write();
        if let Some(dup) = indexers.funcs.keys().find(|n| inner.funcs.contains_key(*n)) {
            return Err(StoreError::IndexerConflict(dup.clone()));
        }
        for (name, func) in indexers.funcs {
            let mut index = Index::default();
            for (key, obj) in &inner.items {
                for v in func(obj) {
                    index.entry(v).or_default().insert(key.clone());
                }
            }
            inner.indices.insert(name.clone(), index);
            inner.funcs.insert(name, func);
        }
        Ok(())
    }
}
