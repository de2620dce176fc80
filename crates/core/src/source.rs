//! Remote source contract: one list endpoint and one watch endpoint per resource type.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{Resource, ResourceVersion};

/// Filter and transport hints passed through to the remote source untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Server-side watch timeout; the source closes the stream after it.
    pub timeout_secs: Option<u32>,
    /// Page size for list calls; sources that page must still return the full set.
    pub page_size: Option<u32>,
}

impl ListOptions {
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    pub fn timeout(mut self, secs: u32) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: ResourceVersion,
}

/// One element of a watch stream. A stream that ends without an `Error` was closed
/// normally by the source (e.g. server timeout) and may be resumed.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Updated(K),
    Deleted(K),
    /// Cursor advance without an object change.
    Bookmark(ResourceVersion),
    Error(SourceError),
}

pub type WatchStream<K> = BoxStream<'static, WatchEvent<K>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The requested resource version is older than the history the source keeps.
    #[error("history expired: {0}")]
    Expired(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_expired(&self) -> bool {
        matches!(self, SourceError::Expired(_))
    }
}

#[async_trait]
pub trait RemoteSource<K: Resource>: Send + Sync {
    /// Full snapshot of the collection plus the version it was taken at.
    async fn list(&self, options: &ListOptions) -> Result<ObjectList<K>, SourceError>;

    /// Changes strictly after `from`. Must fail (or emit `Error`) with
    /// [`SourceError::Expired`] when `from` can no longer be served.
    async fn watch(&self, options: &ListOptions, from: &ResourceVersion) -> Result<WatchStream<K>, SourceError>;
}
