//! Skein core types: object identity, deltas and the remote source contract.
//!
//! Everything here is transport-agnostic. Concrete sources (Kubernetes, in-memory
//! scripts) implement [`RemoteSource`] for their own object type.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod selector;
pub mod source;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use backoff::Backoff;
pub use config::{Config, DeletePolicy};
pub use selector::{Selector, SelectorError};
pub use source::{ListOptions, ObjectList, RemoteSource, SourceError, WatchEvent, WatchStream};

/// An object mirrored from a remote collection.
///
/// Identity is derived from namespace + name, see [`ObjectKey::of`].
pub trait Resource: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn namespace(&self) -> Option<&str>;
    fn resource_version(&self) -> Option<&str>;
    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        None
    }
}

/// Stable identity of an object within one resource type: `ns/name` or `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace(), obj.name())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split back into `(namespace, name)`.
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque cursor handed out by a remote source. Empty means "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn none() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() { f.write_str("(none)") } else { f.write_str(&self.0) }
    }
}

impl From<&str> for ResourceVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Periodic resync of an already stored object.
    Sync,
    /// Emitted by a relist for every listed object.
    Replaced,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Sync => "sync",
            DeltaKind::Replaced => "replaced",
        }
    }
}

/// One observed (or synthesized) change for one object.
#[derive(Debug)]
pub struct Delta<K> {
    pub kind: DeltaKind,
    pub object: Arc<K>,
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self {
        Self { kind: self.kind, object: Arc::clone(&self.object) }
    }
}

impl<K: Resource> Delta<K> {
    pub fn new(kind: DeltaKind, object: impl Into<Arc<K>>) -> Self {
        Self { kind, object: object.into() }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(self.object.as_ref())
    }
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, ListOptions, ObjectKey, ObjectList, RemoteSource, Resource, ResourceVersion,
        Selector, SourceError, WatchEvent, WatchStream,
    };
}
