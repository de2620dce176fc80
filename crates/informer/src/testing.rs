//! In-memory doubles for driving informers without a server (tests, demos).

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use skein_core::{ListOptions, ObjectList, RemoteSource, Resource, ResourceVersion, SourceError, WatchEvent, WatchStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestObject {
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: String,
    pub labels: BTreeMap<String, String>,
}

impl TestObject {
    pub fn new(namespace: &str, name: &str, rv: u64) -> Self {
        Self { namespace: Some(namespace.to_string()), name: name.to_string(), resource_version: rv.to_string(), labels: BTreeMap::new() }
    }

    pub fn cluster(name: &str, rv: u64) -> Self {
        Self { namespace: None, name: name.to_string(), resource_version: rv.to_string(), labels: BTreeMap::new() }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

impl Resource for TestObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        Some(&self.resource_version)
    }

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        Some(&self.labels)
    }
}

/// Feeds one scripted watch stream. Dropping it closes the stream normally.
pub struct WatchFeed<K> {
    tx: mpsc::UnboundedSender<WatchEvent<K>>,
}

impl<K> WatchFeed<K> {
    /// Returns false once the consumer has gone away.
    pub fn send(&self, event: WatchEvent<K>) -> bool {
        self.tx.unbounded_send(event).is_ok()
    }

    pub fn added(&self, obj: K) -> bool {
        self.send(WatchEvent::Added(obj))
    }

    pub fn updated(&self, obj: K) -> bool {
        self.send(WatchEvent::Updated(obj))
    }

    pub fn deleted(&self, obj: K) -> bool {
        self.send(WatchEvent::Deleted(obj))
    }

    pub fn expire(&self) -> bool {
        self.send(WatchEvent::Error(SourceError::Expired("too old resource version".into())))
    }

    pub fn close(self) {}
}

/// Remote source answering list/watch calls from scripted responses, in order.
///
/// An unscripted list fails with a transient error; an unscripted watch idles forever.
pub struct ScriptedSource<K> {
    lists: Mutex<VecDeque<Result<ObjectList<K>, SourceError>>>,
    watches: Mutex<VecDeque<Result<WatchStream<K>, SourceError>>>,
    list_calls: AtomicUsize,
    watch_cursors: Mutex<Vec<ResourceVersion>>,
}

impl<K> Default for ScriptedSource<K> {
    fn default() -> Self {
        Self {
            lists: Mutex::new(VecDeque::new()),
            watches: Mutex::new(VecDeque::new()),
            list_calls: AtomicUsize::new(0),
            watch_cursors: Mutex::new(Vec::new()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: Resource> ScriptedSource<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, items: Vec<K>, rv: &str) {
        lock(&self.lists).push_back(Ok(ObjectList { items, resource_version: ResourceVersion::from(rv) }));
    }

    pub fn push_list_error(&self, err: SourceError) {
        lock(&self.lists).push_back(Err(err));
    }

    pub fn push_watch(&self) -> WatchFeed<K> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.watches).push_back(Ok(rx.boxed()));
        WatchFeed { tx }
    }

    pub fn push_watch_error(&self, err: SourceError) {
        lock(&self.watches).push_back(Err(err));
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Cursor passed to every watch call so far.
    pub fn watch_cursors(&self) -> Vec<ResourceVersion> {
        lock(&self.watch_cursors).clone()
    }
}

#[async_trait]
impl<K: Resource> RemoteSource<K> for ScriptedSource<K> {
    async fn list(&self, _options: &ListOptions) -> Result<ObjectList<K>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.lists).pop_front().unwrap_or_else(|| Err(SourceError::Transient("no scripted list".into())))
    }

    async fn watch(&self, _options: &ListOptions, from: &ResourceVersion) -> Result<WatchStream<K>, SourceError> {
        lock(&self.watch_cursors).push(from.clone());
        let next = lock(&self.watches).pop_front();
        match next {
            Some(scripted) => scripted,
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}
