#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skein_core::{Config, DeletePolicy, RemoteSource, Selector};
use skein_informer::testing::{ScriptedSource, TestObject};
use skein_informer::{EventHandler, HandlerResult, InformerFactory, InformerOptions, RetryLater, SharedInformer};
use skein_store::Indexers;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl Recorder {
    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl EventHandler<TestObject> for Recorder {
    fn on_add(&self, obj: &TestObject) -> HandlerResult {
        self.0.lock().unwrap().push(format!("add {}@{}", obj.name, obj.resource_version));
        Ok(())
    }
    fn on_update(&self, old: &TestObject, new: &TestObject) -> HandlerResult {
        self.0.lock().unwrap().push(format!("update {}@{}->{}", new.name, old.resource_version, new.resource_version));
        Ok(())
    }
    fn on_delete(&self, obj: &TestObject) -> HandlerResult {
        self.0.lock().unwrap().push(format!("delete {}@{}", obj.name, obj.resource_version));
        Ok(())
    }
}

fn fast_options() -> InformerOptions {
    InformerOptions { backoff_initial: Duration::from_millis(5), backoff_max: Duration::from_millis(20), ..InformerOptions::default() }
}

fn informer(src: &Arc<ScriptedSource<TestObject>>, options: InformerOptions) -> Arc<SharedInformer<TestObject>> {
    let source: Arc<dyn RemoteSource<TestObject>> = src.clone();
    Arc::new(SharedInformer::new("widgets", source, Indexers::namespaced(), options))
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_relist_of_unchanged_state_fires_nothing() {
    let src = Arc::new(ScriptedSource::new());
    src.push_list(vec![TestObject::new("ns", "foo", 1)], "1");
    let feed = src.push_watch();
    src.push_list(vec![TestObject::new("ns", "foo", 2)], "2");

    let inf = informer(&src, fast_options());
    let rec = Arc::new(Recorder::default());
    inf.add_event_handler(rec.clone());
    let stop = CancellationToken::new();
    inf.start(&stop).unwrap();

    wait_until("initial sync", || inf.has_synced() && rec.len() == 1).await;
    assert_eq!(rec.snapshot(), vec!["add foo@1"]);

    feed.updated(TestObject::new("ns", "foo", 2));
    wait_until("update", || rec.len() == 2).await;

    feed.expire();
    wait_until("relist", || src.list_calls() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(rec.snapshot(), vec!["add foo@1", "update foo@1->2"]);
    let stored = inf.lister().namespaced("ns").get("foo").unwrap();
    assert_eq!(stored.resource_version, "2");
    assert_eq!(inf.last_sync_resource_version().as_str(), "2");

    inf.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relist_reconciles_removed_and_new_objects() {
    let src = Arc::new(ScriptedSource::new());
    src.push_list(vec![TestObject::new("ns", "a", 1), TestObject::new("ns", "b", 1)], "1");
    let feed = src.push_watch();
    src.push_list(vec![TestObject::new("ns", "b", 1), TestObject::new("ns", "c", 1)], "5");

    let inf = informer(&src, fast_options());
    let rec = Arc::new(Recorder::default());
    inf.add_event_handler(rec.clone());
    let stop = CancellationToken::new();
    inf.start(&stop).unwrap();
    wait_until("initial sync", || rec.len() == 2).await;

    feed.expire();
    wait_until("reconciliation", || rec.len() == 4).await;

    assert_eq!(rec.snapshot(), vec!["add a@1", "add b@1", "add c@1", "delete a@1"]);
    let names: Vec<String> = inf.lister().list(&Selector::everything()).iter().map(|o| o.name.clone()).collect();
    assert_eq!(names, vec!["b", "c"]);

    inf.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_redelivers_stored_objects() {
    let src = Arc::new(ScriptedSource::new());
    src.push_list(vec![TestObject::new("ns", "a", 1)], "1");

    let inf = informer(&src, fast_options().with_resync(Duration::from_millis(40)));
    let rec = Arc::new(Recorder::default());
    inf.add_event_handler(rec.clone());
    let stop = CancellationToken::new();
    inf.start(&stop).unwrap();

    wait_until("two resyncs", || rec.len() >= 3).await;
    let seen = rec.snapshot();
    assert_eq!(seen[0], "add a@1");
    assert!(seen[1..].iter().all(|e| e == "update a@1->1"));

    inf.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notifications_for_one_object_keep_arrival_order() {
    let src = Arc::new(ScriptedSource::new());
    src.push_list(vec![], "1");
    let feed = src.push_watch();

    let options = InformerOptions { delete_policy: DeletePolicy::Retain, ..fast_options() };
    let inf = informer(&src, options);
    let rec = Arc::new(Recorder::default());
    inf.add_event_handler(rec.clone());
    let stop = CancellationToken::new();
    inf.start(&stop).unwrap();
    wait_until("initial sync", || inf.has_synced()).await;

    feed.added(TestObject::new("ns", "a", 2));
    feed.added(TestObject::new("ns", "b", 3));
    feed.updated(TestObject::new("ns", "a", 4));
    feed.updated(TestObject::new("ns", "b", 5));
    feed.updated(TestObject::new("ns", "a", 6));
    feed.deleted(TestObject::new("ns", "a", 7));
    wait_until("all deliveries", || rec.len() == 6).await;

    let for_a: Vec<String> = rec.snapshot().into_iter().filter(|e| e.contains(" a@")).collect();
    assert_eq!(for_a, vec!["add a@2", "update a@2->4", "update a@4->6", "delete a@7"]);
    let for_b: Vec<String> = rec.snapshot().into_iter().filter(|e| e.contains(" b@")).collect();
    assert_eq!(for_b, vec!["add b@3", "update b@3->5"]);

    inf.stop().await;
}

struct RefusesFirst {
    name: &'static str,
    refusals: AtomicUsize,
    accepted: Recorder,
}

impl EventHandler<TestObject> for RefusesFirst {
    fn on_add(&self, obj: &TestObject) -> HandlerResult {
        if obj.name == self.name && self.refusals.load(Ordering::SeqCst) > 0 {
            self.refusals.fetch_sub(1, Ordering::SeqCst);
            return Err(RetryLater::new("dependency missing"));
        }
        self.accepted.on_add(obj)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_object_is_retried_behind_others() {
    let src = Arc::new(ScriptedSource::new());
    src.push_list(vec![TestObject::new("ns", "a", 1), TestObject::new("ns", "b", 1)], "1");

    let inf = informer(&src, fast_options());
    let handler = Arc::new(RefusesFirst { name: "a", refusals: AtomicUsize::new(2), accepted: Recorder::default() });
    inf.add_event_handler(handler.clone());
    let stop = CancellationToken::new();
    inf.start(&stop).unwrap();

    wait_until("retry succeeds", || handler.accepted.len() == 2).await;
    assert_eq!(handler.accepted.snapshot(), vec!["add b@1", "add a@1"]);
    assert_eq!(handler.refusals.load(Ordering::SeqCst), 0);

    inf.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn factory_waits_for_sync_and_serves_listers() {
    let config = Config { backoff_initial: Duration::from_millis(5), sync_poll: Duration::from_millis(5), ..Config::default() };
    let factory = InformerFactory::new(config);

    let widgets = Arc::new(ScriptedSource::new());
    widgets.push_list(
        vec![TestObject::new("prod", "w1", 3).with_label("tier", "web"), TestObject::new("dev", "w2", 4).with_label("tier", "db")],
        "4",
    );
    let nodes = Arc::new(ScriptedSource::new());
    nodes.push_list(vec![TestObject::cluster("node-1", 9)], "9");

    let widget_lister = factory.for_resource::<TestObject>("widgets", widgets.clone()).lister().unwrap();
    let node_informer = factory.for_resource::<TestObject>("nodes", nodes.clone()).informer().unwrap();

    let stop = CancellationToken::new();
    factory.start(&stop).unwrap();
    assert!(factory.wait_for_cache_sync(&stop).await);
    assert!(node_informer.has_synced());

    let web: Selector = "tier=web".parse().unwrap();
    let names: Vec<String> = widget_lister.list(&web).iter().map(|o| o.name.clone()).collect();
    assert_eq!(names, vec!["w1"]);
    assert_eq!(widget_lister.namespaced("dev").list(&Selector::everything()).len(), 1);
    assert!(node_informer.lister().get(&"node-1".into()).is_some());

    factory.shutdown().await;
}
