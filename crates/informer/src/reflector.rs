//! List-then-watch driver that keeps a [`DeltaQueue`] fed with one gap-free change
//! stream per resource type.
//!
//! The loop is an explicit state machine so each transition can be driven and
//! asserted on its own through [`Reflector::step`]:
//!
//! ```text
//! Listing --ok--> Watching --stream closed--> Watching
//!    |               |  \--history expired--> Listing
//!    |               \--transient error--> Backoff(Rewatch) --> Watching
//!    \--error--> Backoff(Relist) --> Listing
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::StreamExt;
use metrics::counter;
use skein_core::{Backoff, Delta, DeltaKind, ListOptions, RemoteSource, Resource, ResourceVersion, SourceError, WatchEvent};
use skein_store::DeltaQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A watch that closes this fast without delivering anything is treated as a failure.
const MIN_WATCH_DURATION: Duration = Duration::from_secs(1);

/// Where to go once a backoff delay has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Relist,
    Rewatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorState {
    Listing,
    Watching,
    Backoff(Resume),
    Stopped,
}

pub struct Reflector<K: Resource> {
    name: String,
    source: Arc<dyn RemoteSource<K>>,
    queue: Arc<DeltaQueue<K>>,
    options: ListOptions,
    backoff: Backoff,
    cursor: Arc<ArcSwap<ResourceVersion>>,
    state: ReflectorState,
}

impl<K: Resource> Reflector<K> {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn RemoteSource<K>>,
        queue: Arc<DeltaQueue<K>>,
        options: ListOptions,
        backoff: Backoff,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            queue,
            options,
            backoff,
            cursor: Arc::new(ArcSwap::from_pointee(ResourceVersion::none())),
            state: ReflectorState::Listing,
        }
    }

    /// Publish the cursor through a cell owned by someone else (the informer).
    pub fn with_cursor(mut self, cursor: Arc<ArcSwap<ResourceVersion>>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn cursor(&self) -> Arc<ArcSwap<ResourceVersion>> {
        Arc::clone(&self.cursor)
    }

    pub fn resource_version(&self) -> ResourceVersion {
        ResourceVersion::clone(&self.cursor.load())
    }

    pub fn state(&self) -> ReflectorState {
        self.state
    }

    /// Run until `stop` fires.
    pub async fn run(mut self, stop: CancellationToken) {
        info!(resource = %self.name, "reflector: started");
        while self.step(&stop).await != ReflectorState::Stopped {}
        info!(resource = %self.name, rv = %self.resource_version(), "reflector: stopped");
    }

    /// Perform the work of the current state and move to the next one.
    pub async fn step(&mut self, stop: &CancellationToken) -> ReflectorState {
        let next = if stop.is_cancelled() {
            ReflectorState::Stopped
        } else {
            match self.state {
                ReflectorState::Listing => self.list(stop).await,
                ReflectorState::Watching => self.watch(stop).await,
                ReflectorState::Backoff(resume) => self.wait(resume, stop).await,
                ReflectorState::Stopped => ReflectorState::Stopped,
            }
        };
        self.state = next;
        next
    }

    async fn list(&mut self, stop: &CancellationToken) -> ReflectorState {
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => return ReflectorState::Stopped,
            r = self.source.list(&self.options) => r,
        };
        match result {
            Ok(list) => {
                let items = list.items.len();
                let pushed = self.queue.replace(list.items, &list.resource_version);
                info!(resource = %self.name, items, pushed, rv = %list.resource_version, "reflector: list ok");
                self.cursor.store(Arc::new(list.resource_version));
                self.backoff.reset();
                ReflectorState::Watching
            }
            Err(e) => {
                warn!(resource = %self.name, error = %e, "reflector: list failed");
                ReflectorState::Backoff(Resume::Relist)
            }
        }
    }

    async fn watch(&mut self, stop: &CancellationToken) -> ReflectorState {
        let from = self.cursor.load_full();
        let opened = tokio::select! {
            biased;
            _ = stop.cancelled() => return ReflectorState::Stopped,
            r = self.source.watch(&self.options, &from) => r,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.on_watch_error(e),
        };
        debug!(resource = %self.name, rv = %from, "reflector: watching");

        let opened_at = Instant::now();
        let mut events = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => return ReflectorState::Stopped,
                ev = stream.next() => ev,
            };
            match next {
                Some(WatchEvent::Added(obj)) => self.observe(DeltaKind::Added, obj),
                Some(WatchEvent::Updated(obj)) => self.observe(DeltaKind::Updated, obj),
                Some(WatchEvent::Deleted(obj)) => self.observe(DeltaKind::Deleted, obj),
                Some(WatchEvent::Bookmark(rv)) => {
                    counter!("skein_watch_events_total", 1u64, "kind" => "bookmark");
                    self.cursor.store(Arc::new(rv));
                    self.backoff.reset();
                }
                Some(WatchEvent::Error(e)) => return self.on_watch_error(e),
                None => break,
            }
            events += 1;
        }

        if events == 0 && opened_at.elapsed() < MIN_WATCH_DURATION {
            debug!(resource = %self.name, "reflector: watch closed without events");
            return ReflectorState::Backoff(Resume::Rewatch);
        }
        debug!(resource = %self.name, events, rv = %self.resource_version(), "reflector: watch closed, resuming");
        ReflectorState::Watching
    }

    fn observe(&mut self, kind: DeltaKind, obj: K) {
        counter!("skein_watch_events_total", 1u64, "kind" => kind.as_str());
        if let Some(rv) = obj.resource_version().filter(|rv| !rv.is_empty()) {
            self.cursor.store(Arc::new(ResourceVersion::from(rv)));
        }
        self.queue.push(Delta::new(kind, obj));
        self.backoff.reset();
    }

    fn on_watch_error(&mut self, e: SourceError) -> ReflectorState {
        if e.is_expired() {
            info!(resource = %self.name, rv = %self.resource_version(), error = %e, "reflector: history expired, relisting");
            counter!("skein_relists_total", 1u64, "reason" => "expired");
            ReflectorState::Listing
        } else {
            warn!(resource = %self.name, error = %e, "reflector: watch failed");
            ReflectorState::Backoff(Resume::Rewatch)
        }
    }

    async fn wait(&mut self, resume: Resume, stop: &CancellationToken) -> ReflectorState {
        let delay = self.backoff.next_delay();
        warn!(
            resource = %self.name,
            attempt = self.backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            resume = ?resume,
            "reflector: backing off"
        );
        tokio::select! {
            biased;
            _ = stop.cancelled() => ReflectorState::Stopped,
            _ = tokio::time::sleep(delay) => match resume {
                Resume::Relist => {
                    counter!("skein_relists_total", 1u64, "reason" => "retry");
                    ReflectorState::Listing
                }
                Resume::Rewatch => ReflectorState::Watching,
            },
        }
    }
}
