//! Skein informers: the reflector keeping a delta queue fed from a remote source,
//! the shared informer applying those deltas to an indexed store and fanning them
//! out to event handlers, and the factory that keeps one informer per resource type.

#![forbid(unsafe_code)]

pub mod factory;
pub mod handler;
pub mod informer;
pub mod reflector;
pub mod testing;

pub use factory::{InformerFactory, ResourceInformer};
pub use handler::{EventHandler, FilteringHandler, HandlerFuncs, HandlerRegistration, HandlerResult, RetryLater};
pub use informer::{InformerOptions, InformerState, SharedInformer};
pub use reflector::{Reflector, ReflectorState, Resume};

use skein_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum InformerError {
    #[error("informer {0:?} was stopped and cannot be restarted")]
    AlreadyStopped(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("informer {type_id:?} already registered for a different object type (requested {requested})")]
    TypeMismatch { type_id: String, requested: &'static str },
    #[error("informer factory was shut down")]
    ShutDown,
    #[error(transparent)]
    Informer(#[from] InformerError),
}
