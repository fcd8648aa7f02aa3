use std::{sync::Arc, time::Duration};

use callboard_core::{check_shape, into_records, Dataset, Record, Snapshot};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use crate::upstream::{preview, FailureKind, UpstreamError, UpstreamSource};

const MALFORMED_BODY_PREVIEW: usize = 256;

/// Upper bound for each dataset's upstream call.
#[derive(Debug, Clone, Copy)]
pub struct FetchTimeouts {
    pub calls_on_hold: Duration,
    pub live_queue_status: Duration,
}

impl FetchTimeouts {
    pub fn for_dataset(&self, dataset: Dataset) -> Duration {
        match dataset {
            Dataset::CallsOnHold => self.calls_on_hold,
            Dataset::LiveQueueStatus => self.live_queue_status,
        }
    }
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            calls_on_hold: Duration::from_secs(15),
            live_queue_status: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetFailure {
    pub dataset: Dataset,
    pub kind: FailureKind,
    pub error: String,
}

/// Snapshot plus what went wrong while building it.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub snapshot: Snapshot,
    pub failures: Vec<DatasetFailure>,
}

impl FetchOutcome {
    /// Datasets whose real state is unknown this round.
    pub fn unavailable(&self) -> Vec<Dataset> {
        self.failures
            .iter()
            .filter(|failure| failure.kind == FailureKind::Unavailable)
            .map(|failure| failure.dataset)
            .collect()
    }
}

/// Reads both datasets and coerces every failure to an empty dataset.
#[derive(Clone)]
pub struct SnapshotFetcher {
    upstream: Arc<dyn UpstreamSource>,
    timeouts: FetchTimeouts,
}

impl SnapshotFetcher {
    pub fn new(upstream: Arc<dyn UpstreamSource>, timeouts: FetchTimeouts) -> Self {
        Self { upstream, timeouts }
    }

    /// Never fails; an unreadable dataset comes back empty.
    pub async fn fetch(&self) -> Snapshot {
        self.fetch_detailed().await.snapshot
    }

    pub async fn fetch_detailed(&self) -> FetchOutcome {
        let (calls, queues) = tokio::join!(
            self.fetch_dataset(Dataset::CallsOnHold),
            self.fetch_dataset(Dataset::LiveQueueStatus)
        );

        let mut outcome = FetchOutcome::default();
        for (dataset, result) in [
            (Dataset::CallsOnHold, calls),
            (Dataset::LiveQueueStatus, queues),
        ] {
            match result {
                Ok(records) => outcome.snapshot.set_dataset(dataset, records),
                Err(failure) => outcome.failures.push(failure),
            }
        }
        outcome
    }

    async fn fetch_dataset(&self, dataset: Dataset) -> Result<Vec<Record>, DatasetFailure> {
        let limit = self.timeouts.for_dataset(dataset);
        let body = match tokio::time::timeout(limit, self.upstream.fetch(dataset)).await {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => return Err(record_failure(dataset, err, None)),
            Err(_) => {
                debug!(%dataset, timeout_ms = limit.as_millis() as u64, "upstream call exceeded its timeout");
                return Err(record_failure(dataset, UpstreamError::Timeout, None));
            }
        };

        if let Err(err) = check_shape(dataset, &body) {
            let context = preview(&body.to_string(), MALFORMED_BODY_PREVIEW);
            return Err(record_failure(dataset, err.into(), Some(context)));
        }
        let records = into_records(dataset, body);
        debug!(%dataset, records = records.len(), "dataset fetched");
        Ok(records)
    }
}

fn record_failure(dataset: Dataset, err: UpstreamError, body: Option<String>) -> DatasetFailure {
    let kind = err.kind();
    counter!(
        "callboard_upstream_failures_total",
        "dataset" => dataset.key(),
        "kind" => kind.label()
    )
    .increment(1);
    match &body {
        Some(body) => warn!(
            %dataset,
            kind = kind.label(),
            error = %err,
            body = %body,
            "dataset coerced to empty"
        ),
        None => warn!(
            %dataset,
            kind = kind.label(),
            error = %err,
            "dataset coerced to empty"
        ),
    }
    DatasetFailure {
        dataset,
        kind,
        error: err.to_string(),
    }
}
