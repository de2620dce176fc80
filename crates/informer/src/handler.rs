//! Event handler contract and the stock handler adapters.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Returned by a handler that wants the object's deltas delivered again later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("retry later: {reason}")]
pub struct RetryLater {
    pub reason: String,
}

impl RetryLater {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

pub type HandlerResult = Result<(), RetryLater>;

/// Receives notifications on the informer's processing task, after the store
/// already reflects the change. Implementations must not block for long: every
/// other object of the same informer waits behind them.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) -> HandlerResult {
        Ok(())
    }

    fn on_update(&self, _old: &K, _new: &K) -> HandlerResult {
        Ok(())
    }

    fn on_delete(&self, _obj: &K) -> HandlerResult {
        Ok(())
    }
}

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerRegistration {
    pub(crate) id: Uuid,
    pub(crate) informer: String,
}

impl HandlerRegistration {
    pub fn informer(&self) -> &str {
        &self.informer
    }
}

impl fmt::Display for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.informer, self.id)
    }
}

type AddFn<K> = Box<dyn Fn(&K) + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&K, &K) + Send + Sync>;

/// Closure-based handler; unset callbacks are no-ops. Never requests a retry.
pub struct HandlerFuncs<K> {
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<AddFn<K>>,
}

impl<K> Default for HandlerFuncs<K> {
    fn default() -> Self {
        Self { add: None, update: None, delete: None }
    }
}

impl<K> HandlerFuncs<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl Fn(&K) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&K, &K) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&K) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K> EventHandler<K> for HandlerFuncs<K> {
    fn on_add(&self, obj: &K) -> HandlerResult {
        if let Some(f) = &self.add {
            f(obj);
        }
        Ok(())
    }

    fn on_update(&self, old: &K, new: &K) -> HandlerResult {
        if let Some(f) = &self.update {
            f(old, new);
        }
        Ok(())
    }

    fn on_delete(&self, obj: &K) -> HandlerResult {
        if let Some(f) = &self.delete {
            f(obj);
        }
        Ok(())
    }
}

/// Forwards only objects accepted by `filter`. An update that moves an object into
/// the filter is delivered as an add, one that moves it out as a delete.
pub struct FilteringHandler<K> {
    filter: Box<dyn Fn(&K) -> bool + Send + Sync>,
    inner: Arc<dyn EventHandler<K>>,
}

impl<K> FilteringHandler<K> {
    pub fn new(filter: impl Fn(&K) -> bool + Send + Sync + 'static, inner: Arc<dyn EventHandler<K>>) -> Self {
        Self { filter: Box::new(filter), inner }
    }
}

impl<K> EventHandler<K> for FilteringHandler<K> {
    fn on_add(&self, obj: &K) -> HandlerResult {
        if (self.filter)(obj) { self.inner.on_add(obj) } else { Ok(()) }
    }

    fn on_update(&self, old: &K, new: &K) -> HandlerResult {
        match ((self.filter)(old), (self.filter)(new)) {
            (true, true) => self.inner.on_update(old, new),
            (false, true) => self.inner.on_add(new),
            (true, false) => self.inner.on_delete(old),
            (false, false) => Ok(()),
        }
    }

    fn on_delete(&self, obj: &K) -> HandlerResult {
        if (self.filter)(obj) { self.inner.on_delete(obj) } else { Ok(()) }
    }
}
