//! Registry guaranteeing at most one [`SharedInformer`] per resource-type id.
//!
//! The factory is an explicit value: build one per application context and hand
//! it (or an `Arc` of it) to every consumer that needs an informer.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use skein_core::{Config, ListOptions, RemoteSource, Resource};
use skein_store::{Indexers, Lister};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::informer::{InformerOptions, SharedInformer};
use crate::{FactoryError, InformerError};

/// Type-erased view of an informer, so informers of different object types share one map.
trait ManagedInformer: Send + Sync {
    fn start_erased(self: Arc<Self>, stop: &CancellationToken) -> Result<(), InformerError>;
    fn has_synced(&self) -> bool;
    fn stop_erased(self: Arc<Self>) -> BoxFuture<'static, ()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K: Resource> ManagedInformer for SharedInformer<K> {
    fn start_erased(self: Arc<Self>, stop: &CancellationToken) -> Result<(), InformerError> {
        self.start(stop)
    }

    fn has_synced(&self) -> bool {
        SharedInformer::has_synced(self)
    }

    fn stop_erased(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.stop().await })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Default)]
struct Registry {
    informers: BTreeMap<String, Arc<dyn ManagedInformer>>,
    started: BTreeSet<String>,
    stop: Option<CancellationToken>,
    shut_down: bool,
}

pub struct InformerFactory {
    config: Config,
    custom_resync: BTreeMap<String, Duration>,
    registry: Mutex<Registry>,
}

impl InformerFactory {
    pub fn new(config: Config) -> Self {
        Self { config, custom_resync: BTreeMap::new(), registry: Mutex::new(Registry::default()) }
    }

    /// Override the resync period for one resource type.
    pub fn with_custom_resync(mut self, type_id: &str, period: Duration) -> Self {
        self.custom_resync.insert(type_id.to_string(), period);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Options a newly built informer for `type_id` should use.
    pub fn options_for(&self, type_id: &str) -> InformerOptions {
        let opts = InformerOptions::from_config(&self.config);
        match self.custom_resync.get(type_id) {
            Some(period) => opts.with_resync(*period),
            None => opts,
        }
    }

    /// Return the informer registered under `type_id`, building it with `build` if
    /// there is none yet. Concurrent callers for the same id share one construction.
    /// When the factory is already started the new informer starts immediately.
    /// After [`shutdown`](Self::shutdown) only existing informers are handed out.
    ///
    /// `build` runs under the registry lock and must not call back into the factory.
    pub fn informer_for<K, F>(&self, type_id: &str, build: F) -> Result<Arc<SharedInformer<K>>, FactoryError>
    where
        K: Resource,
        F: FnOnce(InformerOptions) -> SharedInformer<K>,
    {
        let mut reg = self.registry();
        if let Some(existing) = reg.informers.get(type_id) {
            return Arc::clone(existing).into_any().downcast::<SharedInformer<K>>().map_err(|_| FactoryError::TypeMismatch {
                type_id: type_id.to_string(),
                requested: std::any::type_name::<K>(),
            });
        }
        if reg.shut_down {
            return Err(FactoryError::ShutDown);
        }

        let informer = Arc::new(build(self.options_for(type_id)));
        reg.informers.insert(type_id.to_string(), Arc::clone(&informer) as Arc<dyn ManagedInformer>);
        debug!(type_id, "factory: informer registered");

        if let Some(stop) = reg.stop.clone() {
            informer.start(&stop)?;
            reg.started.insert(type_id.to_string());
            info!(type_id, "factory: started late-registered informer");
        }
        Ok(informer)
    }

    /// Start every registered informer that has not been started yet. Later
    /// registrations start on their own. Repeated calls keep the first stop signal.
    pub fn start(&self, stop: &CancellationToken) -> Result<(), FactoryError> {
        let mut reg = self.registry();
        if reg.shut_down {
            return Err(FactoryError::ShutDown);
        }
        let Registry { informers, started, stop: current, .. } = &mut *reg;
        let token = current.get_or_insert_with(|| stop.clone()).clone();
        for (type_id, informer) in informers.iter() {
            if started.contains(type_id) {
                continue;
            }
            Arc::clone(informer).start_erased(&token)?;
            started.insert(type_id.clone());
        }
        info!(informers = started.len(), "factory: started");
        Ok(())
    }

    /// Wait until every started informer has synced. Returns false if `stop` fires first.
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> bool {
        loop {
            if stop.is_cancelled() {
                return false;
            }
            let (synced, total) = {
                let reg = self.registry();
                let total = reg.started.len();
                let synced = reg.started.iter().filter_map(|id| reg.informers.get(id)).filter(|i| i.has_synced()).count();
                (synced, total)
            };
            if synced == total {
                debug!(informers = total, "factory: caches synced");
                return true;
            }
            tokio::select! {
                biased;
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(self.config.sync_poll) => {}
            }
        }
    }

    /// Ids of informers that have been started, sorted.
    pub fn started_informers(&self) -> Vec<String> {
        self.registry().started.iter().cloned().collect()
    }

    pub fn registered_informers(&self) -> Vec<String> {
        self.registry().informers.keys().cloned().collect()
    }

    /// Stop every registered informer and wait for all of their tasks. The factory
    /// cannot be started again and refuses new registrations.
    pub async fn shutdown(&self) {
        let informers: Vec<Arc<dyn ManagedInformer>> = {
            let mut reg = self.registry();
            reg.shut_down = true;
            reg.stop = None;
            reg.informers.values().cloned().collect()
        };
        for informer in informers {
            informer.stop_erased().await;
        }
        info!("factory: shut down");
    }

    /// Typed accessor for one resource type.
    pub fn for_resource<K: Resource>(&self, type_id: &str, source: Arc<dyn RemoteSource<K>>) -> ResourceInformer<'_, K> {
        ResourceInformer {
            factory: self,
            type_id: type_id.to_string(),
            source,
            indexers: Indexers::namespaced(),
            list: None,
        }
    }
}

impl Default for InformerFactory {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Per-type handle bundling the source and store layout for one resource type.
pub struct ResourceInformer<'f, K: Resource> {
    factory: &'f InformerFactory,
    type_id: String,
    source: Arc<dyn RemoteSource<K>>,
    indexers: Indexers<K>,
    list: Option<ListOptions>,
}

impl<'f, K: Resource> ResourceInformer<'f, K> {
    pub fn with_indexers(mut self, indexers: Indexers<K>) -> Self {
        self.indexers = indexers;
        self
    }

    /// Selectors and paging for this type. The watch timeout comes from config unless set here.
    pub fn with_list_options(mut self, list: ListOptions) -> Self {
        self.list = Some(list);
        self
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn informer(&self) -> Result<Arc<SharedInformer<K>>, FactoryError> {
        let source = Arc::clone(&self.source);
        let indexers = self.indexers.clone();
        let list = self.list.clone();
        let name = self.type_id.clone();
        self.factory.informer_for(&self.type_id, move |mut opts| {
            if let Some(mut list) = list {
                if list.timeout_secs.is_none() {
                    list.timeout_secs = opts.list.timeout_secs;
                }
                opts.list = list;
            }
            SharedInformer::new(name, source, indexers, opts)
        })
    }

    pub fn lister(&self) -> Result<Lister<K>, FactoryError> {
        Ok(self.informer()?.lister())
    }
}
