//! Process-wide logging, tracing and metrics for the callboard binary.

use anyhow::{anyhow, Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "callboard";
const DEFAULT_FILTER: &str = "info";

/// Set to `1`, `true`, `yes` or `on` to print finished spans to stdout.
pub const OTEL_STDOUT_ENV: &str = "CALLBOARD_OTEL_STDOUT";

/// Keep alive for the life of the process; dropping it flushes spans.
pub struct Telemetry {
    metrics_handle: Option<PrometheusHandle>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Subscriber plus a global Prometheus recorder.
    pub fn init() -> Result<Self> {
        let mut telemetry = Self::init_tracing()?;

        let recorder = prometheus_recorder();
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|_| anyhow!("a global metrics recorder is already installed"))?;
        describe_metrics();

        telemetry.metrics_handle = Some(handle);
        Ok(telemetry)
    }

    /// Subscriber only. The `watch` client has nothing to scrape.
    pub fn init_tracing() -> Result<Self> {
        let tracer_provider = stdout_spans_requested().then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
            )
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("span export to stdout enabled via {OTEL_STDOUT_ENV}");
        }

        Ok(Self {
            metrics_handle: None,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> Option<PrometheusHandle> {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let Some(provider) = self.tracer_provider.take() else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            warn!(error = %err, "span exporter did not shut down cleanly");
        }
    }
}

/// An uninstalled recorder. Install it globally, or scope it to a thread
/// with `metrics::set_default_local_recorder`.
pub fn prometheus_recorder() -> PrometheusRecorder {
    PrometheusBuilder::new().build_recorder()
}

/// Registers help text for every series the server emits with whichever
/// recorder is current.
pub fn describe_metrics() {
    describe_counter!(
        "callboard_poll_cycles_total",
        "Poll cycles by outcome: unchanged, published, skipped, store_error or broadcast_error"
    );
    describe_histogram!(
        "callboard_poll_cycle_duration_ms",
        Unit::Milliseconds,
        "Wall time of one poll cycle"
    );
    describe_counter!(
        "callboard_poll_cycle_panics_total",
        "Poll cycles that panicked and were contained"
    );
    describe_counter!(
        "callboard_upstream_failures_total",
        "Dataset fetches that failed, by dataset and failure kind"
    );
    describe_counter!(
        "callboard_broadcasts_total",
        "Data updates published, by fan-out backend"
    );
    describe_histogram!(
        "callboard_broadcast_receivers",
        "Receivers reported for each published update"
    );
    describe_counter!(
        "callboard_fingerprint_conflicts_total",
        "Fingerprint writes lost to a concurrent poller"
    );
    describe_counter!(
        "callboard_group_lagged_events_total",
        "Group events skipped by sessions that fell behind"
    );
    describe_counter!(
        "callboard_group_relay_reconnects_total",
        "Times the Redis group relay resubscribed"
    );
    describe_counter!("callboard_sessions_opened_total", "WebSocket sessions accepted");
    describe_counter!(
        "callboard_sessions_closed_total",
        "WebSocket sessions closed, by reason"
    );
    describe_gauge!("callboard_sessions_active", "WebSocket sessions currently open");
    describe_histogram!(
        "callboard_session_duration_seconds",
        Unit::Seconds,
        "Lifetime of closed WebSocket sessions"
    );
    describe_counter!(
        "callboard_frames_sent_total",
        "Frames written to sessions, by frame type"
    );
    describe_counter!("callboard_client_pings_total", "Application-level pings received");
    describe_counter!(
        "callboard_client_frames_ignored_total",
        "Client frames dropped as unknown or malformed"
    );
    describe_counter!(
        "callboard_ws_rejected_total",
        "WebSocket upgrades refused, by reason"
    );
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes([KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn stdout_spans_requested() -> bool {
    std::env::var(OTEL_STDOUT_ENV)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|accepted| value.trim().eq_ignore_ascii_case(accepted))
}
