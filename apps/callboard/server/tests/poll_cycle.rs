use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use callboard_core::{fingerprint, normalize_dataset, BroadcastEvent, Dataset, Fingerprint, CALLS_GROUP};
use callboard_server::{
    broadcast::{BroadcastError, EventPublisher},
    fetcher::{FetchTimeouts, SnapshotFetcher},
    scheduler::{CycleError, CycleOutcome, Poller, PollerConfig},
    store::{FingerprintStore, MemoryFingerprintStore},
    upstream::{ScriptedResponse, ScriptedUpstream},
};
use parking_lot::Mutex;
use serde_json::{json, Value};

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<BroadcastEvent>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    fn count(&self) -> usize {
        self.events.lock().len()
    }

    fn last(&self) -> BroadcastEvent {
        self.events.lock().last().cloned().expect("no events published")
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, _group: &str, event: BroadcastEvent) -> Result<usize, BroadcastError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BroadcastError::Unavailable(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "redis down",
            ))));
        }
        self.events.lock().push(event);
        Ok(1)
    }

    fn backend(&self) -> &'static str {
        "recording"
    }
}

struct Rig {
    upstream: Arc<ScriptedUpstream>,
    store: Arc<MemoryFingerprintStore>,
    publisher: Arc<RecordingPublisher>,
    poller: Poller,
}

fn rig() -> Rig {
    rig_with_store(Arc::new(MemoryFingerprintStore::new()))
}

fn rig_with_store(store: Arc<MemoryFingerprintStore>) -> Rig {
    let upstream = Arc::new(ScriptedUpstream::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let poller = Poller::new(
        SnapshotFetcher::new(upstream.clone(), FetchTimeouts::default()),
        store.clone(),
        publisher.clone(),
        PollerConfig::default(),
    );
    Rig {
        upstream,
        store,
        publisher,
        poller,
    }
}

fn fp(dataset: Dataset, body: Value) -> Fingerprint {
    fingerprint(&normalize_dataset(dataset, body).unwrap())
}

async fn stored(rig: &Rig, dataset: Dataset) -> Option<Fingerprint> {
    rig.store.get(dataset.key()).await.unwrap()
}

#[test_timeout::tokio_timeout_test(paused)]
async fn change_detection_survives_an_upstream_outage() {
    let rig = rig();

    // Cycle 1: first data seen.
    rig.upstream.set(Dataset::CallsOnHold, json!([{"id": 1}]));
    rig.upstream.set(Dataset::LiveQueueStatus, json!([]));
    let outcome = rig.poller.poll_once().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Published { .. }));
    assert_eq!(rig.publisher.count(), 1);
    assert_eq!(
        serde_json::to_value(rig.publisher.last()).unwrap(),
        json!({
            "type": "dataUpdate",
            "payload": {"getCallsOnHoldData": [{"id": 1}], "getLiveQueueStatusData": []}
        })
    );
    let h1 = fp(Dataset::CallsOnHold, json!([{"id": 1}]));
    assert_eq!(stored(&rig, Dataset::CallsOnHold).await, Some(h1));

    // Cycle 2: identical data.
    let writes = rig.store.writes();
    assert_eq!(rig.poller.poll_once().await.unwrap(), CycleOutcome::Unchanged);
    assert_eq!(rig.publisher.count(), 1);
    assert_eq!(rig.store.writes(), writes);

    // Cycle 3: a second call joins the hold list.
    rig.upstream
        .set(Dataset::CallsOnHold, json!([{"id": 1}, {"id": 2}]));
    assert!(matches!(
        rig.poller.poll_once().await.unwrap(),
        CycleOutcome::Published { .. }
    ));
    assert_eq!(rig.publisher.count(), 2);
    assert_eq!(
        rig.publisher.last().payload().calls_on_hold.len(),
        2
    );
    let h2 = fp(Dataset::CallsOnHold, json!([{"id": 1}, {"id": 2}]));
    assert_eq!(stored(&rig, Dataset::CallsOnHold).await, Some(h2.clone()));

    // Cycle 4: the calls endpoint hangs past its timeout.
    rig.upstream
        .replace(Dataset::CallsOnHold, ScriptedResponse::Hang);
    assert_eq!(
        rig.poller.poll_once().await.unwrap(),
        CycleOutcome::Skipped {
            unavailable: vec![Dataset::CallsOnHold]
        }
    );
    assert_eq!(rig.publisher.count(), 2);
    assert_eq!(stored(&rig, Dataset::CallsOnHold).await, Some(h2.clone()));

    // Cycle 5: recovered with the same data.
    rig.upstream
        .set(Dataset::CallsOnHold, json!([{"id": 1}, {"id": 2}]));
    assert_eq!(rig.poller.poll_once().await.unwrap(), CycleOutcome::Unchanged);
    assert_eq!(rig.publisher.count(), 2);
    assert_eq!(stored(&rig, Dataset::CallsOnHold).await, Some(h2));
}

#[test_timeout::tokio_timeout_test]
async fn draining_a_queue_is_broadcast_once() {
    let rig = rig();
    rig.upstream.set(
        Dataset::LiveQueueStatus,
        json!([{"queue": "Sales", "waiting": 3}]),
    );
    rig.poller.poll_once().await.unwrap();
    assert_eq!(rig.publisher.count(), 1);

    rig.upstream.set(Dataset::LiveQueueStatus, json!([]));
    match rig.poller.poll_once().await.unwrap() {
        CycleOutcome::Published {
            fingerprints,
            lost_races,
            ..
        } => {
            assert_eq!(fingerprints.live_queue_status, Fingerprint::empty());
            assert!(lost_races.is_empty());
        }
        other => panic!("expected a publish, got {other:?}"),
    }
    assert!(rig.publisher.last().payload().is_empty());
    assert_eq!(
        stored(&rig, Dataset::LiveQueueStatus).await,
        Some(Fingerprint::empty())
    );

    assert_eq!(rig.poller.poll_once().await.unwrap(), CycleOutcome::Unchanged);
    assert_eq!(rig.publisher.count(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn key_order_alone_is_not_a_change() {
    let rig = rig();
    let first: Value = serde_json::from_str(r#"[{"queue":"Sales","agents":4}]"#).unwrap();
    let second: Value = serde_json::from_str(r#"[{"agents":4,"queue":"Sales"}]"#).unwrap();

    rig.upstream.set(Dataset::LiveQueueStatus, first);
    rig.poller.poll_once().await.unwrap();
    rig.upstream.set(Dataset::LiveQueueStatus, second);
    assert_eq!(rig.poller.poll_once().await.unwrap(), CycleOutcome::Unchanged);
    assert_eq!(rig.publisher.count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn failed_publish_leaves_the_store_alone_and_retries() {
    let rig = rig();
    rig.upstream.set(Dataset::CallsOnHold, json!([{"id": 5}]));
    rig.publisher.failing.store(true, Ordering::SeqCst);

    let err = rig.poller.poll_once().await.unwrap_err();
    assert!(matches!(err, CycleError::Broadcast(_)));
    assert_eq!(rig.store.writes(), 0);
    assert_eq!(stored(&rig, Dataset::CallsOnHold).await, None);

    rig.publisher.failing.store(false, Ordering::SeqCst);
    assert!(matches!(
        rig.poller.poll_once().await.unwrap(),
        CycleOutcome::Published { .. }
    ));
    assert_eq!(rig.publisher.count(), 1);
    // The empty queue dataset is recorded alongside the changed one.
    assert_eq!(rig.store.writes(), 2);
    assert_eq!(
        stored(&rig, Dataset::LiveQueueStatus).await,
        Some(Fingerprint::empty())
    );
}

#[test_timeout::tokio_timeout_test]
async fn malformed_dataset_is_published_as_empty() {
    let rig = rig();
    rig.upstream
        .set(Dataset::LiveQueueStatus, json!([{"queue": "Billing"}]));
    rig.poller.poll_once().await.unwrap();

    rig.upstream.set(
        Dataset::LiveQueueStatus,
        json!({"status": "error", "description": "vendor maintenance"}),
    );
    assert!(matches!(
        rig.poller.poll_once().await.unwrap(),
        CycleOutcome::Published { .. }
    ));
    assert!(rig.publisher.last().payload().live_queue_status.is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn pollers_sharing_a_store_publish_a_change_once() {
    let store = Arc::new(MemoryFingerprintStore::new());
    let first = rig_with_store(store.clone());
    let second = rig_with_store(store);
    for rig in [&first, &second] {
        rig.upstream.set(Dataset::CallsOnHold, json!([{"id": 8}]));
    }

    assert!(matches!(
        first.poller.poll_once().await.unwrap(),
        CycleOutcome::Published { .. }
    ));
    assert_eq!(second.poller.poll_once().await.unwrap(), CycleOutcome::Unchanged);
    assert_eq!(first.publisher.count() + second.publisher.count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn group_name_reaches_the_publisher() {
    struct GroupCheck;

    #[async_trait]
    impl EventPublisher for GroupCheck {
        async fn publish(&self, group: &str, _event: BroadcastEvent) -> Result<usize, BroadcastError> {
            assert_eq!(group, CALLS_GROUP);
            Ok(0)
        }

        fn backend(&self) -> &'static str {
            "check"
        }
    }

    let upstream = Arc::new(ScriptedUpstream::new());
    upstream.set(Dataset::CallsOnHold, json!([{"id": 1}]));
    let poller = Poller::new(
        SnapshotFetcher::new(upstream, FetchTimeouts::default()),
        Arc::new(MemoryFingerprintStore::new()),
        Arc::new(GroupCheck),
        PollerConfig::default(),
    );
    match poller.poll_once().await.unwrap() {
        CycleOutcome::Published { receivers, .. } => assert_eq!(receivers, 0),
        other => panic!("expected a publish, got {other:?}"),
    }
}
