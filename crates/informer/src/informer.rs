//! Shared informer: one reflector, one delta queue, one indexed store and a
//! fan-out list of event handlers for a single resource type.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::counter;
use skein_core::{Backoff, Config, DeletePolicy, Delta, DeltaKind, ListOptions, ObjectKey, RemoteSource, Resource, ResourceVersion};
use skein_store::{DeltaQueue, Deltas, Indexer, Indexers, KnownObjects, Lister, PopOutcome, Requeue};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handler::{EventHandler, HandlerRegistration, HandlerResult};
use crate::reflector::Reflector;
use crate::InformerError;

/// Pause after a handler asked for a retry, so a failing object does not spin the pop loop.
const REQUEUE_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct InformerOptions {
    pub list: ListOptions,
    /// Zero disables resync.
    pub resync: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub delete_policy: DeletePolicy,
}

impl InformerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            list: ListOptions::default().timeout(cfg.watch_timeout_secs),
            resync: cfg.resync,
            backoff_initial: cfg.backoff_initial,
            backoff_max: cfg.backoff_max,
            delete_policy: cfg.delete_policy,
        }
    }

    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync = period;
        self
    }
}

impl Default for InformerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformerState {
    Created,
    Running,
    Stopped,
}

enum Lifecycle {
    Created,
    Running { token: CancellationToken, tasks: Vec<JoinHandle<()>> },
    Stopped,
}

struct Registered<K> {
    id: Uuid,
    handler: Arc<dyn EventHandler<K>>,
}

impl<K> Clone for Registered<K> {
    fn clone(&self) -> Self {
        Self { id: self.id, handler: Arc::clone(&self.handler) }
    }
}

enum Notification<K> {
    Add(Arc<K>),
    Update(Arc<K>, Arc<K>),
    Delete(Arc<K>),
}

impl<K> Notification<K> {
    fn deliver(&self, handler: &dyn EventHandler<K>) -> HandlerResult {
        match self {
            Notification::Add(obj) => handler.on_add(obj),
            Notification::Update(old, new) => handler.on_update(old, new),
            Notification::Delete(obj) => handler.on_delete(obj),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SharedInformer<K: Resource> {
    name: String,
    source: Arc<dyn RemoteSource<K>>,
    options: InformerOptions,
    indexer: Arc<Indexer<K>>,
    queue: Arc<DeltaQueue<K>>,
    handlers: ArcSwap<Vec<Registered<K>>>,
    // Held while deltas are delivered and while the handler list changes.
    delivery: Mutex<()>,
    cursor: Arc<ArcSwap<ResourceVersion>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<K: Resource> SharedInformer<K> {
    pub fn new(name: impl Into<String>, source: Arc<dyn RemoteSource<K>>, indexers: Indexers<K>, options: InformerOptions) -> Self {
        let indexer = Arc::new(Indexer::new(indexers));
        let queue = Arc::new(DeltaQueue::new(Arc::clone(&indexer) as Arc<dyn KnownObjects<K>>, options.delete_policy));
        Self {
            name: name.into(),
            source,
            options,
            indexer,
            queue,
            handlers: ArcSwap::from_pointee(Vec::new()),
            delivery: Mutex::new(()),
            cursor: Arc::new(ArcSwap::from_pointee(ResourceVersion::none())),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &InformerOptions {
        &self.options
    }

    pub fn state(&self) -> InformerState {
        match *lock(&self.lifecycle) {
            Lifecycle::Created => InformerState::Created,
            Lifecycle::Running { .. } => InformerState::Running,
            Lifecycle::Stopped => InformerState::Stopped,
        }
    }

    /// Spawn the reflector, the pop loop and the resync timer on a child of `stop`.
    /// A second call while running is a no-op; starting after [`stop`](Self::stop) fails.
    pub fn start(self: &Arc<Self>, stop: &CancellationToken) -> Result<(), InformerError> {
        let mut lifecycle = lock(&self.lifecycle);
        match *lifecycle {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Stopped => return Err(InformerError::AlreadyStopped(self.name.clone())),
            Lifecycle::Created => {}
        }

        let token = stop.child_token();
        let reflector = Reflector::new(
            self.name.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.queue),
            self.options.list.clone(),
            Backoff::new(self.options.backoff_initial, self.options.backoff_max),
        )
        .with_cursor(Arc::clone(&self.cursor));

        let tasks = vec![
            tokio::spawn(reflector.run(token.clone())),
            tokio::spawn(Arc::clone(self).process_loop(token.clone())),
            tokio::spawn(Arc::clone(self).resync_loop(token.clone())),
        ];
        *lifecycle = Lifecycle::Running { token, tasks };
        info!(resource = %self.name, resync_secs = self.options.resync.as_secs(), "informer: started");
        Ok(())
    }

    /// Cancel every task of this informer and wait for all of them to exit.
    pub async fn stop(&self) {
        let tasks = {
            let mut lifecycle = lock(&self.lifecycle);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running { token, tasks } => {
                    token.cancel();
                    tasks
                }
                _ => Vec::new(),
            }
        };
        self.queue.close();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(resource = %self.name, error = %e, "informer: task ended abnormally");
            }
        }
        info!(resource = %self.name, "informer: stopped");
    }

    /// True once the first list has been fully delivered.
    pub fn has_synced(&self) -> bool {
        self.queue.has_synced()
    }

    /// Cursor of the most recent list or watch event.
    pub fn last_sync_resource_version(&self) -> ResourceVersion {
        ResourceVersion::clone(&self.cursor.load())
    }

    pub fn indexer(&self) -> Arc<Indexer<K>> {
        Arc::clone(&self.indexer)
    }

    pub fn lister(&self) -> Lister<K> {
        Lister::new(Arc::clone(&self.indexer))
    }

    pub fn add_indexers(&self, indexers: Indexers<K>) -> Result<(), InformerError> {
        self.indexer.add_indexers(indexers).map_err(InformerError::from)
    }

    /// Register a handler. It first receives `on_add` for every object already in the
    /// store, with delivery paused, then joins the regular fan-out.
    ///
    /// Must not be called from inside a handler of the same informer.
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) -> HandlerRegistration {
        let id = Uuid::new_v4();
        let _delivery = lock(&self.delivery);
        let existing = self.indexer.list();
        for obj in &existing {
            if let Err(e) = handler.on_add(obj) {
                debug!(resource = %self.name, key = %ObjectKey::of(obj.as_ref()), reason = %e.reason, "informer: catch-up add refused");
            }
        }
        self.handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Registered { id, handler: Arc::clone(&handler) });
            next
        });
        debug!(resource = %self.name, handler = %id, replayed = existing.len(), "informer: handler registered");
        HandlerRegistration { id, informer: self.name.clone() }
    }

    /// Unregister; once this returns the handler receives nothing more.
    /// Returns false if the registration is unknown here.
    ///
    /// Must not be called from inside a handler of the same informer.
    pub fn remove_event_handler(&self, registration: &HandlerRegistration) -> bool {
        if registration.informer != self.name {
            return false;
        }
        let _delivery = lock(&self.delivery);
        let mut removed = false;
        self.handlers.rcu(|current| {
            let next: Vec<Registered<K>> = current.iter().filter(|r| r.id != registration.id).cloned().collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.load().len()
    }

    async fn process_loop(self: Arc<Self>, stop: CancellationToken) {
        loop {
            match self.queue.pop(&stop, |key, deltas| self.handle_deltas(key, deltas)).await {
                PopOutcome::Processed(_) => {}
                PopOutcome::Requeued(_) => {
                    counter!("skein_handler_requeues_total", 1u64);
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(REQUEUE_PAUSE) => {}
                    }
                }
                PopOutcome::Stopped | PopOutcome::Closed => break,
            }
        }
        debug!(resource = %self.name, "informer: pop loop exited");
    }

    async fn resync_loop(self: Arc<Self>, stop: CancellationToken) {
        let period = self.options.resync;
        if period.is_zero() {
            return;
        }
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let queued = self.queue.resync();
            debug!(resource = %self.name, queued, "informer: resync");
        }
    }

    /// Apply each delta to the store, then notify every handler in registration order.
    /// If a handler asks for a retry, that delta's store change is undone and the
    /// unprocessed tail (starting at that delta) is handed back to the queue.
    fn handle_deltas(&self, key: &ObjectKey, deltas: Deltas<K>) -> Result<(), Requeue<K>> {
        let _delivery = lock(&self.delivery);
        let handlers = self.handlers.load();
        for (i, delta) in deltas.iter().enumerate() {
            let (previous, notification) = self.apply(key, delta);
            let Some(notification) = notification else { continue };
            for registered in handlers.iter() {
                if let Err(e) = notification.deliver(registered.handler.as_ref()) {
                    debug!(resource = %self.name, key = %key, kind = delta.kind.as_str(), reason = %e.reason, "informer: handler asked for retry");
                    self.revert(key, previous);
                    return Err(Requeue { remaining: deltas[i..].iter().cloned().collect(), reason: e.reason });
                }
            }
        }
        Ok(())
    }

    fn apply(&self, key: &ObjectKey, delta: &Delta<K>) -> (Option<Arc<K>>, Option<Notification<K>>) {
        let obj = Arc::clone(&delta.object);
        match delta.kind {
            DeltaKind::Deleted => {
                let previous = self.indexer.delete(key);
                let notification = previous.as_ref().map(|_| Notification::Delete(obj));
                (previous, notification)
            }
            DeltaKind::Added | DeltaKind::Updated | DeltaKind::Sync => {
                let previous = self.indexer.update(key.clone(), Arc::clone(&obj));
                let notification = match &previous {
                    None => Notification::Add(obj),
                    Some(old) => Notification::Update(Arc::clone(old), obj),
                };
                (previous, Some(notification))
            }
            DeltaKind::Replaced => {
                let previous = self.indexer.update(key.clone(), Arc::clone(&obj));
                let notification = match &previous {
                    None => Some(Notification::Add(obj)),
                    Some(old) if same_version(old.as_ref(), obj.as_ref()) => None,
                    Some(old) => Some(Notification::Update(Arc::clone(old), obj)),
                };
                (previous, notification)
            }
        }
    }

    fn revert(&self, key: &ObjectKey, previous: Option<Arc<K>>) {
        match previous {
            Some(old) => {
                self.indexer.update(key.clone(), old);
            }
            None => {
                self.indexer.delete(key);
            }
        }
    }
}

fn same_version<K: Resource>(a: &K, b: &K) -> bool {
    match (a.resource_version(), b.resource_version()) {
        (Some(x), Some(y)) => !x.is_empty() && x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RetryLater;
    use crate::testing::{ScriptedSource, TestObject};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl EventHandler<TestObject> for Recorder {
        fn on_add(&self, obj: &TestObject) -> HandlerResult {
            self.events.lock().unwrap().push(format!("add {}@{}", obj.name, obj.resource_version));
            Ok(())
        }
        fn on_update(&self, old: &TestObject, new: &TestObject) -> HandlerResult {
            self.events.lock().unwrap().push(format!("update {}@{}->{}", new.name, old.resource_version, new.resource_version));
            Ok(())
        }
        fn on_delete(&self, obj: &TestObject) -> HandlerResult {
            self.events.lock().unwrap().push(format!("delete {}@{}", obj.name, obj.resource_version));
            Ok(())
        }
    }

    fn informer() -> SharedInformer<TestObject> {
        let src: Arc<dyn RemoteSource<TestObject>> = Arc::new(ScriptedSource::<TestObject>::new());
        SharedInformer::new("widgets", src, Indexers::namespaced(), InformerOptions::default())
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(Some("ns"), name)
    }

    fn deltas(items: Vec<(DeltaKind, TestObject)>) -> Deltas<TestObject> {
        items.into_iter().map(|(k, o)| Delta::new(k, o)).collect()
    }

    #[test]
    fn dispatch_follows_store_presence() {
        let inf = informer();
        let rec = Arc::new(Recorder::default());
        inf.add_event_handler(rec.clone());

        inf.handle_deltas(
            &key("a"),
            deltas(vec![
                (DeltaKind::Updated, TestObject::new("ns", "a", 1)),
                (DeltaKind::Added, TestObject::new("ns", "a", 2)),
                (DeltaKind::Sync, TestObject::new("ns", "a", 2)),
                (DeltaKind::Deleted, TestObject::new("ns", "a", 2)),
                (DeltaKind::Deleted, TestObject::new("ns", "a", 2)),
            ]),
        )
        .unwrap();
        assert_eq!(rec.take(), vec!["add a@1", "update a@1->2", "update a@2->2", "delete a@2"]);
        assert!(inf.indexer().is_empty());
    }

    #[test]
    fn replaced_with_same_version_is_silent() {
        let inf = informer();
        let rec = Arc::new(Recorder::default());
        inf.add_event_handler(rec.clone());
        inf.handle_deltas(&key("a"), deltas(vec![(DeltaKind::Replaced, TestObject::new("ns", "a", 1))])).unwrap();
        inf.handle_deltas(&key("a"), deltas(vec![(DeltaKind::Replaced, TestObject::new("ns", "a", 1))])).unwrap();
        inf.handle_deltas(&key("a"), deltas(vec![(DeltaKind::Replaced, TestObject::new("ns", "a", 3))])).unwrap();
        assert_eq!(rec.take(), vec!["add a@1", "update a@1->3"]);
    }

    struct Flaky {
        failures_left: AtomicUsize,
        seen: Recorder,
    }

    impl EventHandler<TestObject> for Flaky {
        fn on_add(&self, obj: &TestObject) -> HandlerResult {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(RetryLater::new("not ready"));
            }
            self.seen.on_add(obj)
        }
    }

    #[test]
    fn retry_request_reverts_store_and_returns_tail() {
        let inf = informer();
        let flaky = Arc::new(Flaky { failures_left: AtomicUsize::new(1), seen: Recorder::default() });
        inf.add_event_handler(flaky.clone());

        let err = inf
            .handle_deltas(
                &key("a"),
                deltas(vec![(DeltaKind::Added, TestObject::new("ns", "a", 1)), (DeltaKind::Updated, TestObject::new("ns", "a", 2))]),
            )
            .unwrap_err();
        assert_eq!(err.remaining.len(), 2);
        assert_eq!(err.reason, "not ready");
        assert!(inf.indexer().get(&key("a")).is_none());

        // second attempt sees the same add again
        inf.handle_deltas(&key("a"), err.remaining).unwrap();
        assert_eq!(flaky.seen.take(), vec!["add a@1"]);
        assert_eq!(inf.indexer().get(&key("a")).unwrap().resource_version, "2");
    }

    #[test]
    fn late_handler_catches_up_and_unregisters() {
        let inf = informer();
        inf.handle_deltas(&key("a"), deltas(vec![(DeltaKind::Added, TestObject::new("ns", "a", 1))])).unwrap();
        inf.handle_deltas(&key("b"), deltas(vec![(DeltaKind::Added, TestObject::new("ns", "b", 1))])).unwrap();

        let rec = Arc::new(Recorder::default());
        let reg = inf.add_event_handler(rec.clone());
        assert_eq!(rec.take(), vec!["add a@1", "add b@1"]);
        assert_eq!(inf.handler_count(), 1);

        assert!(inf.remove_event_handler(&reg));
        assert!(!inf.remove_event_handler(&reg));
        inf.handle_deltas(&key("a"), deltas(vec![(DeltaKind::Updated, TestObject::new("ns", "a", 2))])).unwrap();
        assert!(rec.take().is_empty());
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let inf = informer();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            inf.add_event_handler(Arc::new(crate::HandlerFuncs::new().on_add(move |_: &TestObject| order.lock().unwrap().push(tag))));
        }
        inf.handle_deltas(&key("a"), deltas(vec![(DeltaKind::Added, TestObject::new("ns", "a", 1))])).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_terminal() {
        let inf = Arc::new(informer());
        let stop = CancellationToken::new();
        assert_eq!(inf.state(), InformerState::Created);
        inf.start(&stop).unwrap();
        inf.start(&stop).unwrap();
        assert_eq!(inf.state(), InformerState::Running);

        tokio::time::timeout(Duration::from_secs(2), inf.stop()).await.unwrap();
        assert_eq!(inf.state(), InformerState::Stopped);
        assert!(matches!(inf.start(&stop), Err(InformerError::AlreadyStopped(_))));
        // the parent token is untouched
        assert!(!stop.is_cancelled());
    }
}
