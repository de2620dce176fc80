//! Per-object delta queue: one FIFO position per key, an ordered delta list behind it.
//!
//! Cross-key order is first-arrival order. A key that is already queued keeps its
//! position and accumulates deltas, so the queue grows with the number of distinct
//! objects, not with the number of changes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use skein_core::{DeletePolicy, Delta, DeltaKind, ObjectKey, Resource, ResourceVersion};
use smallvec::SmallVec;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Indexer;

/// Pending deltas for one key, oldest first.
pub type Deltas<K> = SmallVec<[Delta<K>; 4]>;

/// The store contents the queue reconciles relists and resyncs against.
pub trait KnownObjects<K>: Send + Sync {
    fn list_keys(&self) -> Vec<ObjectKey>;
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>>;
}

impl<K: Resource> KnownObjects<K> for Indexer<K> {
    fn list_keys(&self) -> Vec<ObjectKey> {
        Indexer::list_keys(self)
    }

    fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        Indexer::get(self, key)
    }
}

/// Returned by a pop callback to put the unprocessed tail back.
#[derive(Debug)]
pub struct Requeue<K> {
    pub remaining: Deltas<K>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome {
    Processed(ObjectKey),
    Requeued(ObjectKey),
    Stopped,
    Closed,
}

struct InFlight<K> {
    key: ObjectKey,
    /// Object the store will hold once processing finishes; `None` if the batch ends in a delete.
    last_live: Option<Arc<K>>,
}

struct State<K> {
    items: FxHashMap<ObjectKey, Deltas<K>>,
    order: VecDeque<ObjectKey>,
    in_flight: Option<InFlight<K>>,
    populated: bool,
    initial_population: usize,
    closed: bool,
}

pub struct DeltaQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    known: Arc<dyn KnownObjects<K>>,
    policy: DeletePolicy,
}

impl<K: Resource> DeltaQueue<K> {
    pub fn new(known: Arc<dyn KnownObjects<K>>, policy: DeletePolicy) -> Self {
        Self {
            state: Mutex::new(State {
                items: FxHashMap::default(),
                order: VecDeque::new(),
                in_flight: None,
                populated: false,
                initial_population: 0,
                closed: false,
            }),
            notify: Notify::new(),
            known,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue one delta. Never waits on processing.
    pub fn push(&self, delta: Delta<K>) {
        {
            let mut st = self.lock();
            self.push_locked(&mut st, delta);
            gauge!("skein_queue_depth", st.order.len() as f64);
        }
        self.notify.notify_one();
    }

    fn push_locked(&self, st: &mut State<K>, delta: Delta<K>) {
        counter!("skein_deltas_pushed_total", 1u64, "kind" => delta.kind.as_str());
        let key = delta.key();
        match st.items.get_mut(&key) {
            Some(pending) => combine(pending, delta, self.policy),
            None => {
                let mut pending = Deltas::new();
                pending.push(delta);
                st.items.insert(key.clone(), pending);
                st.order.push_back(key);
            }
        }
    }

    /// Wait for a queued key, hand its deltas to `process`, and requeue the tail at the
    /// back of the queue if `process` asks for it.
    pub async fn pop<F>(&self, stop: &CancellationToken, process: F) -> PopOutcome
    where
        F: FnOnce(&ObjectKey, Deltas<K>) -> Result<(), Requeue<K>>,
    {
        let (key, deltas) = loop {
            {
                let mut st = self.lock();
                if let Some((key, deltas)) = take_head(&mut st) {
                    let last_live = deltas.last().filter(|d| d.kind != DeltaKind::Deleted).map(|d| Arc::clone(&d.object));
                    st.in_flight = Some(InFlight { key: key.clone(), last_live });
                    gauge!("skein_queue_depth", st.order.len() as f64);
                    break (key, deltas);
                }
                if st.closed {
                    return PopOutcome::Closed;
                }
            }
            tokio::select! {
                biased;
                _ = stop.cancelled() => return PopOutcome::Stopped,
                _ = self.notify.notified() => {}
            }
        };

        let started = Instant::now();
        let result = process(&key, deltas);
        histogram!("skein_delta_process_ms", started.elapsed().as_secs_f64() * 1000.0);

        let requeued = {
            let mut st = self.lock();
            st.in_flight = None;
            if st.initial_population > 0 {
                st.initial_population -= 1;
            }
            match result {
                Ok(()) => false,
                Err(Requeue { remaining, reason }) => {
                    debug!(key = %key, pending = remaining.len(), reason = %reason, "queue: requeue at tail");
                    requeue_locked(&mut st, key.clone(), remaining);
                    true
                }
            }
        };
        if requeued {
            self.notify.notify_one();
            PopOutcome::Requeued(key)
        } else {
            PopOutcome::Processed(key)
        }
    }

    /// Relist reconciliation. Listed objects get a `Replaced` delta; keys that are known
    /// (stored, queued or in flight) but absent from `list` get a `Deleted` delta carrying
    /// their last known state. Runs under the queue lock, so no push interleaves with it.
    pub fn replace(&self, list: Vec<K>, resource_version: &ResourceVersion) -> usize {
        let mut pushed = 0usize;
        {
            let mut st = self.lock();
            let mut listed: FxHashSet<ObjectKey> = FxHashSet::default();
            for obj in list {
                let delta = Delta::new(DeltaKind::Replaced, obj);
                listed.insert(delta.key());
                self.push_locked(&mut st, delta);
                pushed += 1;
            }

            let mut tombstones: Vec<(ObjectKey, Arc<K>)> = st
                .items
                .iter()
                .filter(|(k, _)| !listed.contains(*k))
                .filter_map(|(k, pending)| {
                    pending.last().filter(|d| d.kind != DeltaKind::Deleted).map(|d| (k.clone(), Arc::clone(&d.object)))
                })
                .collect();
            if let Some(f) = &st.in_flight {
                if !listed.contains(&f.key) && !st.items.contains_key(&f.key) {
                    if let Some(obj) = &f.last_live {
                        tombstones.push((f.key.clone(), Arc::clone(obj)));
                    }
                }
            }
            let mut handled: FxHashSet<ObjectKey> = st.items.keys().filter(|k| !listed.contains(*k)).cloned().collect();
            for (key, obj) in tombstones {
                handled.insert(key);
                self.push_locked(&mut st, Delta::new(DeltaKind::Deleted, obj));
                pushed += 1;
            }

            for key in self.known.list_keys() {
                if listed.contains(&key) || handled.contains(&key) {
                    continue;
                }
                if let Some(obj) = self.known.get(&key) {
                    self.push_locked(&mut st, Delta::new(DeltaKind::Deleted, obj));
                    pushed += 1;
                }
            }

            if !st.populated {
                st.populated = true;
                st.initial_population = st.items.len();
            }
            gauge!("skein_queue_depth", st.order.len() as f64);
        }
        debug!(rv = %resource_version, pushed, "queue: replace");
        self.notify.notify_one();
        pushed
    }

    /// Queue a `Sync` delta for every stored object that has nothing pending.
    /// Keys with pending deltas are skipped; they will be delivered anyway. So is the
    /// key being processed: the store still holds its previous object.
    pub fn resync(&self) -> usize {
        let mut pushed = 0usize;
        {
            let mut st = self.lock();
            let in_flight = st.in_flight.as_ref().map(|f| f.key.clone());
            for key in self.known.list_keys() {
                if st.items.contains_key(&key) || in_flight.as_ref() == Some(&key) {
                    continue;
                }
                if let Some(obj) = self.known.get(&key) {
                    self.push_locked(&mut st, Delta::new(DeltaKind::Sync, obj));
                    pushed += 1;
                }
            }
        }
        if pushed > 0 {
            self.notify.notify_one();
        }
        pushed
    }

    /// True once the first `replace` happened and everything it queued was processed.
    pub fn has_synced(&self) -> bool {
        let st = self.lock();
        st.populated && st.initial_population == 0
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Queued keys in pop order.
    pub fn list_keys(&self) -> Vec<ObjectKey> {
        self.lock().order.iter().cloned().collect()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Deltas<K>> {
        self.lock().items.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn take_head<K>(st: &mut State<K>) -> Option<(ObjectKey, Deltas<K>)> {
    while let Some(key) = st.order.pop_front() {
        if let Some(deltas) = st.items.remove(&key) {
            return Some((key, deltas));
        }
    }
    None
}

fn combine<K>(pending: &mut Deltas<K>, delta: Delta<K>, policy: DeletePolicy) {
    if delta.kind == DeltaKind::Deleted {
        match policy {
            DeletePolicy::Collapse => {
                pending.clear();
                pending.push(delta);
                return;
            }
            DeletePolicy::Retain => {
                if let Some(last) = pending.last_mut() {
                    if last.kind == DeltaKind::Deleted {
                        *last = delta;
                        return;
                    }
                }
            }
        }
    }
    pending.push(delta);
}

/// Put `remaining` back in front of anything that arrived for the key meanwhile.
fn requeue_locked<K>(st: &mut State<K>, key: ObjectKey, mut remaining: Deltas<K>) {
    match st.items.get_mut(&key) {
        Some(newer) => {
            remaining.extend(newer.drain(..));
            *newer = remaining;
        }
        None => {
            st.items.insert(key.clone(), remaining);
            st.order.push_back(key);
        }
    }
}
