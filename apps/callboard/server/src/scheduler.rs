//! The poller: fetch, fingerprint, compare, and publish on change.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use callboard_core::{BroadcastEvent, Dataset, Fingerprint, FingerprintPair, CALLS_GROUP};
use futures_util::FutureExt;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    broadcast::{BroadcastError, EventPublisher},
    fetcher::SnapshotFetcher,
    store::{FingerprintStore, StoreError},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub group: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            group: CALLS_GROUP.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    #[default]
    Idle,
    Fetching,
    Comparing,
    Publishing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Both fingerprints matched the store; nothing was published or written.
    Unchanged,
    /// A snapshot went out. `lost_races` lists datasets whose store update
    /// lost to a concurrent poller.
    Published {
        receivers: usize,
        fingerprints: FingerprintPair,
        lost_races: Vec<Dataset>,
    },
    /// Upstream could not vouch for these datasets; the cycle was abandoned
    /// before comparing.
    Skipped { unavailable: Vec<Dataset> },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Unchanged => "unchanged",
            CycleOutcome::Published { .. } => "published",
            CycleOutcome::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fingerprint store failed: {0}")]
    Store(#[from] StoreError),
    #[error("broadcast failed: {0}")]
    Broadcast(#[from] BroadcastError),
}

impl CycleError {
    fn metric_label(&self) -> &'static str {
        match self {
            CycleError::Store(_) => "store_error",
            CycleError::Broadcast(_) => "broadcast_error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CycleOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerStatus {
    pub state: PollerState,
    pub cycles: u64,
    pub panics: u64,
    pub last_cycle: Option<CycleReport>,
}

/// Read side of a poller's status, shared with the HTTP layer.
#[derive(Clone, Default)]
pub struct PollerStatusHandle {
    inner: Arc<RwLock<PollerStatus>>,
}

impl PollerStatusHandle {
    pub fn snapshot(&self) -> PollerStatus {
        self.inner.read().clone()
    }

    fn set_state(&self, state: PollerState) {
        self.inner.write().state = state;
    }
}

pub struct Poller {
    fetcher: SnapshotFetcher,
    store: Arc<dyn FingerprintStore>,
    publisher: Arc<dyn EventPublisher>,
    config: PollerConfig,
    cycles: AtomicU64,
    status: PollerStatusHandle,
}

impl Poller {
    pub fn new(
        fetcher: SnapshotFetcher,
        store: Arc<dyn FingerprintStore>,
        publisher: Arc<dyn EventPublisher>,
        config: PollerConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            publisher,
            config,
            cycles: AtomicU64::new(0),
            status: PollerStatusHandle::default(),
        }
    }

    pub fn status(&self) -> PollerStatusHandle {
        self.status.clone()
    }

    /// Runs one cycle. Errors are logged here as well as returned.
    pub async fn poll_once(&self) -> Result<CycleOutcome, CycleError> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let result = self
            .run_cycle()
            .instrument(info_span!("poll_cycle", cycle))
            .await;
        self.finish(cycle, started.elapsed(), &result);
        result
    }

    async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        self.status.set_state(PollerState::Fetching);
        let fetched = self.fetcher.fetch_detailed().await;
        let unavailable = fetched.unavailable();
        if !unavailable.is_empty() {
            warn!(?unavailable, "upstream unavailable; skipping cycle");
            return Ok(CycleOutcome::Skipped { unavailable });
        }

        self.status.set_state(PollerState::Comparing);
        let fingerprints = FingerprintPair::of(&fetched.snapshot);
        // Datasets whose stored value differs from the current fingerprint,
        // including keys never written because the dataset was always empty.
        let mut pending: Vec<(Dataset, Option<Fingerprint>)> = Vec::new();
        let mut changed = false;
        for dataset in Dataset::ALL {
            let stored = self.store.get(dataset.key()).await?;
            let current = fingerprints.get(dataset);
            if stored.as_ref() == Some(current) {
                continue;
            }
            let previous = stored.clone().unwrap_or_else(Fingerprint::empty);
            if &previous != current {
                debug!(
                    %dataset,
                    previous = previous.short(),
                    current = current.short(),
                    "dataset changed"
                );
                changed = true;
            }
            pending.push((dataset, stored));
        }

        if !changed {
            debug!("no changes detected");
            return Ok(CycleOutcome::Unchanged);
        }

        self.status.set_state(PollerState::Publishing);
        let cleared = fetched.snapshot.is_empty();
        let event = BroadcastEvent::data_update(fetched.snapshot);
        let receivers = self.publisher.publish(&self.config.group, event).await?;
        counter!("callboard_broadcasts_total", "backend" => self.publisher.backend()).increment(1);
        histogram!("callboard_broadcast_receivers").record(receivers as f64);

        let mut lost_races = Vec::new();
        for (dataset, stored) in pending {
            let swapped = self
                .store
                .compare_and_set(dataset.key(), stored.as_ref(), fingerprints.get(dataset))
                .await?;
            if !swapped {
                counter!("callboard_fingerprint_conflicts_total", "dataset" => dataset.key())
                    .increment(1);
                info!(%dataset, "another poller updated the fingerprint first");
                lost_races.push(dataset);
            }
        }

        info!(
            group = %self.config.group,
            receivers,
            calls_on_hold = fingerprints.calls_on_hold.short(),
            live_queue_status = fingerprints.live_queue_status.short(),
            cleared,
            "published data update"
        );
        Ok(CycleOutcome::Published {
            receivers,
            fingerprints,
            lost_races,
        })
    }

    fn finish(&self, cycle: u64, elapsed: Duration, result: &Result<CycleOutcome, CycleError>) {
        let label = match result {
            Ok(outcome) => outcome.label(),
            Err(err) => {
                error!(cycle, error = %err, "poll cycle failed");
                err.metric_label()
            }
        };
        counter!("callboard_poll_cycles_total", "outcome" => label).increment(1);
        histogram!("callboard_poll_cycle_duration_ms").record(elapsed.as_secs_f64() * 1000.0);

        let mut status = self.status.inner.write();
        status.state = PollerState::Idle;
        status.cycles = cycle;
        status.last_cycle = Some(CycleReport {
            cycle,
            finished_at: OffsetDateTime::now_utc(),
            duration_ms: elapsed.as_millis() as u64,
            outcome: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(ToString::to_string),
        });
    }

    /// Polls on the configured interval until `cancel` fires. A panicking
    /// cycle is logged and the loop carries on with the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            group = %self.config.group,
            store = self.store.backend(),
            fanout = self.publisher.backend(),
            "poller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cycle = AssertUnwindSafe(self.poll_once()).catch_unwind();
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = cycle => {
                    if let Err(panic) = result {
                        counter!("callboard_poll_cycle_panics_total").increment(1);
                        error!(panic = panic_message(panic.as_ref()), "poll cycle panicked");
                        let mut status = self.status.inner.write();
                        status.state = PollerState::Idle;
                        status.panics += 1;
                    }
                }
            }
        }
        info!("poller stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broadcast::{GroupHub, LocalPublisher},
        fetcher::FetchTimeouts,
        store::MemoryFingerprintStore,
        upstream::{ScriptedResponse, ScriptedUpstream, UpstreamError},
    };
    use serde_json::json;

    struct Harness {
        upstream: Arc<ScriptedUpstream>,
        store: Arc<MemoryFingerprintStore>,
        hub: GroupHub,
        poller: Arc<Poller>,
    }

    fn harness(interval: Duration) -> Harness {
        let upstream = Arc::new(ScriptedUpstream::new());
        let store = Arc::new(MemoryFingerprintStore::new());
        let hub = GroupHub::new(8);
        let poller = Arc::new(Poller::new(
            SnapshotFetcher::new(upstream.clone(), FetchTimeouts::default()),
            store.clone(),
            Arc::new(LocalPublisher::new(hub.clone())),
            PollerConfig {
                interval,
                group: CALLS_GROUP.to_string(),
            },
        ));
        Harness {
            upstream,
            store,
            hub,
            poller,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn status_tracks_the_last_cycle() {
        let h = harness(DEFAULT_POLL_INTERVAL);
        h.upstream.set(Dataset::CallsOnHold, json!([{"id": 1}]));
        let _member = h.hub.join(CALLS_GROUP, uuid::Uuid::new_v4());

        let outcome = h.poller.poll_once().await.unwrap();
        assert_eq!(outcome.label(), "published");

        let status = h.poller.status().snapshot();
        assert_eq!(status.state, PollerState::Idle);
        assert_eq!(status.cycles, 1);
        let report = status.last_cycle.unwrap();
        assert_eq!(report.cycle, 1);
        assert!(report.error.is_none());
        assert!(matches!(
            report.outcome,
            Some(CycleOutcome::Published { receivers: 1, .. })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn empty_upstream_on_a_fresh_store_is_unchanged() {
        let h = harness(DEFAULT_POLL_INTERVAL);
        assert_eq!(h.poller.poll_once().await.unwrap(), CycleOutcome::Unchanged);
        assert_eq!(h.store.writes(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unavailable_dataset_skips_the_cycle() {
        let h = harness(DEFAULT_POLL_INTERVAL);
        h.upstream.set(Dataset::CallsOnHold, json!([{"id": 1}]));
        h.upstream.push(
            Dataset::LiveQueueStatus,
            ScriptedResponse::Fail(UpstreamError::Connect("refused".into())),
        );

        assert_eq!(
            h.poller.poll_once().await.unwrap(),
            CycleOutcome::Skipped {
                unavailable: vec![Dataset::LiveQueueStatus]
            }
        );
        assert_eq!(h.store.writes(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn publishing_records_absent_keys_for_empty_datasets() {
        let h = harness(DEFAULT_POLL_INTERVAL);
        h.upstream.set(Dataset::CallsOnHold, json!([{"id": 1}]));

        h.poller.poll_once().await.unwrap();
        assert_eq!(
            h.store.get(Dataset::LiveQueueStatus.key()).await.unwrap(),
            Some(Fingerprint::empty())
        );
        assert_eq!(h.store.writes(), 2);

        assert_eq!(h.poller.poll_once().await.unwrap(), CycleOutcome::Unchanged);
        assert_eq!(h.store.writes(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn cycles_are_counted_by_outcome() {
        let recorder = crate::telemetry::prometheus_recorder();
        let handle = recorder.handle();
        let _local = metrics::set_default_local_recorder(&recorder);

        let h = harness(DEFAULT_POLL_INTERVAL);
        h.upstream.set(Dataset::CallsOnHold, json!([{"id": 1}]));
        h.poller.poll_once().await.unwrap();
        h.poller.poll_once().await.unwrap();

        let rendered = handle.render();
        assert!(rendered.contains(r#"callboard_poll_cycles_total{outcome="published"} 1"#));
        assert!(rendered.contains(r#"callboard_poll_cycles_total{outcome="unchanged"} 1"#));
        assert!(rendered.contains(r#"callboard_broadcasts_total{backend="local"} 1"#));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn run_polls_on_every_tick_until_cancelled() {
        let h = harness(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let poller = h.poller.clone();
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(h.upstream.calls(Dataset::CallsOnHold), 3);
        assert_eq!(h.poller.status().snapshot().cycles, 3);
    }

    #[test_timeout::timeout]
    fn panic_messages_are_extracted() {
        let text: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(text.as_ref()), "boom");
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(owned.as_ref()), "bang");
        let other: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
