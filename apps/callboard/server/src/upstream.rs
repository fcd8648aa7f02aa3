//! Clients for the vendor queue API.
//!
//! The server never talks to the vendor directly: every call goes through the
//! dashboard proxy, which injects the vendor credentials. [`ProxyUpstream`]
//! is the production client, [`FileUpstream`] replays a JSON file for local
//! work, and [`ScriptedUpstream`] is the test double.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    time::Duration,
};

use async_trait::async_trait;
use callboard_core::{Dataset, ShapeError};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

const ERROR_BODY_PREVIEW: usize = 512;

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("upstream call timed out")]
    Timeout,
    #[error("upstream unreachable: {0}")]
    Connect(String),
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upstream body is not valid JSON: {0}")]
    Decode(String),
    #[error("upstream body has the wrong shape: {0}")]
    Shape(#[from] ShapeError),
}

/// How a failed dataset is treated by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Nothing trustworthy came back; the dataset's real state is unknown.
    Unavailable,
    /// A response arrived but could not be read; the dataset is coerced to empty.
    Malformed,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Unavailable => "unavailable",
            FailureKind::Malformed => "malformed",
        }
    }
}

impl UpstreamError {
    pub fn kind(&self) -> FailureKind {
        match self {
            UpstreamError::Timeout | UpstreamError::Connect(_) | UpstreamError::Status { .. } => {
                FailureKind::Unavailable
            }
            UpstreamError::Decode(_) | UpstreamError::Shape(_) => FailureKind::Malformed,
        }
    }
}

/// Source of raw dataset bodies. Implementations return whatever JSON the
/// vendor produced; shape checks happen in the fetcher.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn fetch(&self, dataset: Dataset) -> Result<Value, UpstreamError>;
}

#[derive(Debug, Serialize)]
struct ProxyRequest<'a> {
    endpoint: &'a str,
    payload: Value,
}

/// Calls the dashboard's generic vendor proxy.
#[derive(Clone)]
pub struct ProxyUpstream {
    http: reqwest::Client,
    proxy_url: String,
}

impl ProxyUpstream {
    pub fn new(proxy_url: impl Into<String>, connect_timeout: Duration) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            proxy_url: proxy_url.into(),
        })
    }
}

#[async_trait]
impl UpstreamSource for ProxyUpstream {
    async fn fetch(&self, dataset: Dataset) -> Result<Value, UpstreamError> {
        let request = ProxyRequest {
            endpoint: dataset.endpoint(),
            payload: json!({}),
        };
        debug!(%dataset, url = %self.proxy_url, "requesting dataset from proxy");

        let response = self
            .http
            .post(&self.proxy_url)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: preview(&body, ERROR_BODY_PREVIEW),
            });
        }

        let bytes = response.bytes().await.map_err(classify_transport)?;
        serde_json::from_slice(&bytes).map_err(|err| {
            UpstreamError::Decode(format!(
                "{err}; body starts with {:?}",
                preview(&String::from_utf8_lossy(&bytes), ERROR_BODY_PREVIEW)
            ))
        })
    }
}

fn classify_transport(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout
    } else if err.is_decode() {
        UpstreamError::Decode(err.to_string())
    } else {
        UpstreamError::Connect(err.to_string())
    }
}

/// Truncates `text` to at most `max` bytes on a char boundary.
pub fn preview(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Re-reads a JSON file shaped like a `dataUpdate` payload on every call, so
/// a developer can edit the file and watch changes reach the browser.
pub struct FileUpstream {
    path: PathBuf,
}

impl FileUpstream {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl UpstreamSource for FileUpstream {
    async fn fetch(&self, dataset: Dataset) -> Result<Value, UpstreamError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|err| {
            UpstreamError::Connect(format!("failed to read {}: {err}", self.path.display()))
        })?;
        let mut body: Value =
            serde_json::from_slice(&raw).map_err(|err| UpstreamError::Decode(err.to_string()))?;
        Ok(body
            .get_mut(dataset.wire_field())
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Body(Value),
    Fail(UpstreamError),
    /// Never completes; exercises the fetcher's timeout.
    Hang,
}

/// Upstream double that replays queued responses per dataset. The last
/// queued response repeats once the queue is down to one entry; a dataset
/// with nothing queued answers with an empty array.
#[derive(Default)]
pub struct ScriptedUpstream {
    queues: Mutex<HashMap<Dataset, VecDeque<ScriptedResponse>>>,
    calls: Mutex<HashMap<Dataset, usize>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, dataset: Dataset, response: ScriptedResponse) {
        self.queues
            .lock()
            .entry(dataset)
            .or_default()
            .push_back(response);
    }

    /// Replaces everything queued for `dataset` with a single sticky body.
    pub fn set(&self, dataset: Dataset, body: Value) {
        self.replace(dataset, ScriptedResponse::Body(body));
    }

    /// Replaces everything queued for `dataset` with a single sticky response.
    pub fn replace(&self, dataset: Dataset, response: ScriptedResponse) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(dataset).or_default();
        queue.clear();
        queue.push_back(response);
    }

    pub fn calls(&self, dataset: Dataset) -> usize {
        self.calls.lock().get(&dataset).copied().unwrap_or(0)
    }

    fn next(&self, dataset: Dataset) -> ScriptedResponse {
        *self.calls.lock().entry(dataset).or_default() += 1;
        let mut queues = self.queues.lock();
        match queues.get_mut(&dataset) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or(ScriptedResponse::Body(json!([]))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or(ScriptedResponse::Body(json!([]))),
            None => ScriptedResponse::Body(json!([])),
        }
    }
}

#[async_trait]
impl UpstreamSource for ScriptedUpstream {
    async fn fetch(&self, dataset: Dataset) -> Result<Value, UpstreamError> {
        match self.next(dataset) {
            ScriptedResponse::Body(body) => Ok(body),
            ScriptedResponse::Fail(err) => Err(err),
            ScriptedResponse::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn transport_failures_are_unavailable() {
        assert_eq!(UpstreamError::Timeout.kind(), FailureKind::Unavailable);
        assert_eq!(
            UpstreamError::Status {
                status: 502,
                body: String::new()
            }
            .kind(),
            FailureKind::Unavailable
        );
        assert_eq!(
            UpstreamError::Decode("eof".into()).kind(),
            FailureKind::Malformed
        );
        assert_eq!(
            UpstreamError::Shape(ShapeError::NotAnArray("a string")).kind(),
            FailureKind::Malformed
        );
    }

    #[test_timeout::timeout]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("llamadas", 4), "llam…");
        assert_eq!(preview("añb", 2), "a…");
    }

    #[test_timeout::tokio_timeout_test]
    async fn scripted_upstream_replays_then_sticks() {
        let upstream = ScriptedUpstream::new();
        upstream.push(Dataset::CallsOnHold, ScriptedResponse::Body(json!([{"id": 1}])));
        upstream.push(
            Dataset::CallsOnHold,
            ScriptedResponse::Fail(UpstreamError::Timeout),
        );

        assert_eq!(
            upstream.fetch(Dataset::CallsOnHold).await.unwrap(),
            json!([{"id": 1}])
        );
        assert!(upstream.fetch(Dataset::CallsOnHold).await.is_err());
        assert!(upstream.fetch(Dataset::CallsOnHold).await.is_err());
        assert_eq!(
            upstream.fetch(Dataset::LiveQueueStatus).await.unwrap(),
            json!([])
        );
        assert_eq!(upstream.calls(Dataset::CallsOnHold), 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn file_upstream_reads_wire_fields() {
        let path = std::env::temp_dir().join(format!("callboard-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(
            &path,
            r#"{"getCallsOnHoldData":[{"id":7}],"getLiveQueueStatusData":null}"#,
        )
        .await
        .unwrap();

        let upstream = FileUpstream::new(&path);
        assert_eq!(
            upstream.fetch(Dataset::CallsOnHold).await.unwrap(),
            json!([{"id": 7}])
        );
        assert_eq!(
            upstream.fetch(Dataset::LiveQueueStatus).await.unwrap(),
            Value::Null
        );

        tokio::fs::remove_file(&path).await.unwrap();
        assert_eq!(
            upstream.fetch(Dataset::CallsOnHold).await.unwrap_err().kind(),
            FailureKind::Unavailable
        );
    }
}
