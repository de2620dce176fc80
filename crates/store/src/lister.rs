//! Read-only query facade over an [`Indexer`].

use std::sync::Arc;

use skein_core::{ObjectKey, Resource, Selector};

use crate::{Indexer, StoreError, NAMESPACE_INDEX};

pub struct Lister<K> {
    indexer: Arc<Indexer<K>>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self { indexer: Arc::clone(&self.indexer) }
    }
}

impl<K: Resource> Lister<K> {
    pub fn new(indexer: Arc<Indexer<K>>) -> Self {
        Self { indexer }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.indexer.get(key)
    }

    pub fn list(&self, selector: &Selector) -> Vec<Arc<K>> {
        let all = self.indexer.list();
        if selector.is_everything() {
            return all;
        }
        all.into_iter().filter(|o| selector.matches_object(o.as_ref())).collect()
    }

    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> {
        self.indexer.by_index(index, value)
    }

    pub fn namespaced(&self, namespace: &str) -> NamespaceLister<K> {
        NamespaceLister { indexer: Arc::clone(&self.indexer), namespace: namespace.to_string() }
    }
}

/// Lister scoped to one namespace.
pub struct NamespaceLister<K> {
    indexer: Arc<Indexer<K>>,
    namespace: String,
}

impl<K: Resource> NamespaceLister<K> {
    pub fn get(&self, name: &str) -> Option<Arc<K>> {
        self.indexer.get(&ObjectKey::new(Some(&self.namespace), name))
    }

    pub fn list(&self, selector: &Selector) -> Vec<Arc<K>> {
        // Fall back to a scan when the namespace index was not registered.
        let in_ns = match self.indexer.by_index(NAMESPACE_INDEX, &self.namespace) {
            Ok(v) => v,
            Err(_) => self.indexer.list().into_iter().filter(|o| o.namespace() == Some(self.namespace.as_str())).collect(),
        };
        in_ns.into_iter().filter(|o| selector.matches_object(o.as_ref())).collect()
    }
}
