//! Skein store: the indexed object cache, the delta queue feeding it, and
//! read-only listers over it.

#![forbid(unsafe_code)]

pub mod indexer;
pub mod lister;
pub mod queue;

pub use indexer::{namespace_index_func, IndexFunc, Indexer, Indexers, NAMESPACE_INDEX};
pub use lister::{Lister, NamespaceLister};
pub use queue::{DeltaQueue, Deltas, KnownObjects, PopOutcome, Requeue};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("index {0:?} does not exist")]
    UnknownIndex(String),
    #[error("indexer {0:?} already registered")]
    IndexerConflict(String),
}
