use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use callboard_core::Dataset;
use futures_util::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    scheduler::{PollerStatus, PollerStatusHandle},
    session::{self, SessionContext},
    store::FingerprintStore,
};

pub struct AppState {
    pub session: SessionContext,
    pub store: Arc<dyn FingerprintStore>,
    pub poller: Option<PollerStatusHandle>,
    pub metrics: Option<PrometheusHandle>,
    pub ws_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SocketQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    group: String,
    member_count: usize,
    members: Vec<Uuid>,
    store: &'static str,
    groups: Vec<String>,
    fingerprints: BTreeMap<&'static str, Option<String>>,
    /// Datasets whose stored fingerprint is the empty-dataset digest.
    empty_datasets: Vec<&'static str>,
    poller: Option<PollerStatus>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/ws/calls", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let group = state.session.group.clone();
    let members = state.session.hub.members(&group);

    let mut fingerprints = BTreeMap::new();
    let mut empty_datasets = Vec::new();
    for dataset in Dataset::ALL {
        let stored = match state.store.get(dataset.key()).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(%dataset, error = %err, "failed to read stored fingerprint");
                None
            }
        };
        if stored.as_ref().is_some_and(|fp| fp.is_empty_dataset()) {
            empty_datasets.push(dataset.key());
        }
        fingerprints.insert(dataset.key(), stored.map(|fp| fp.to_string()));
    }

    Json(StatsResponse {
        member_count: members.len(),
        members,
        group,
        groups: state.session.hub.groups(),
        store: state.store.backend(),
        fingerprints,
        empty_datasets,
        poller: state.poller.as_ref().map(PollerStatusHandle::snapshot),
    })
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Some(expected) = &state.ws_token {
        if query.token.as_deref() != Some(expected.as_str()) {
            let reason = if query.token.is_some() {
                "invalid_token"
            } else {
                "missing_token"
            };
            counter!("callboard_ws_rejected_total", "reason" => reason).increment(1);
            warn!(reason, "rejected websocket upgrade");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    info!(session_id = %session_id, "websocket connected");
    let (sink, stream) = socket.split();
    session::serve(session_id, sink, stream, state.session.clone()).await;
}
