use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use redis::aio::ConnectionManager;
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    broadcast::{EventPublisher, GroupHub, GroupRelay, LocalPublisher, RedisPublisher},
    config::{FanoutBackend, ServerConfig, StoreBackend, UpstreamConfig},
    fetcher::{FetchTimeouts, SnapshotFetcher},
    routes::{self, AppState},
    scheduler::{Poller, PollerConfig},
    session::SessionContext,
    store::{FingerprintStore, MemoryFingerprintStore, RedisFingerprintStore},
    upstream::{FileUpstream, ProxyUpstream, UpstreamSource},
};

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let cancel = CancellationToken::new();
    let hub = GroupHub::new(config.group_capacity);

    let redis = if config.needs_redis() {
        let client = redis::Client::open(config.redis_url.clone())
            .context("failed to create redis client")?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to redis")?;
        Some((client, manager))
    } else {
        None
    };

    let store: Arc<dyn FingerprintStore> = match (config.store, &redis) {
        (StoreBackend::Redis, Some((_, manager))) => Arc::new(RedisFingerprintStore::with_manager(
            manager.clone(),
            config.fingerprint_prefix.clone(),
        )),
        _ => Arc::new(MemoryFingerprintStore::new()),
    };

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let publisher: Arc<dyn EventPublisher> = match (config.fanout, &redis) {
        (FanoutBackend::Redis, Some((client, manager))) => {
            let relay = GroupRelay::new(
                client.clone(),
                hub.clone(),
                config.channel_prefix.clone(),
                vec![config.group.clone()],
            );
            tasks.push(tokio::spawn(relay.run(cancel.clone())));
            Arc::new(RedisPublisher::new(
                manager.clone(),
                config.channel_prefix.clone(),
            ))
        }
        _ => Arc::new(LocalPublisher::new(hub.clone())),
    };

    let upstream: Arc<dyn UpstreamSource> = match &config.upstream {
        UpstreamConfig::Proxy { url } => Arc::new(
            ProxyUpstream::new(url.clone(), config.connect_timeout)
                .context("failed to build upstream http client")?,
        ),
        UpstreamConfig::File { path } => Arc::new(FileUpstream::new(path.clone())),
    };
    let fetcher = SnapshotFetcher::new(
        upstream,
        FetchTimeouts {
            calls_on_hold: config.calls_timeout,
            live_queue_status: config.queues_timeout,
        },
    );

    let poller_status = if config.run_poller {
        let poller = Poller::new(
            fetcher.clone(),
            store.clone(),
            publisher.clone(),
            PollerConfig {
                interval: config.poll_interval,
                group: config.group.clone(),
            },
        );
        let status = poller.status();
        let poller_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { poller.run(poller_cancel).await }));
        Some(status)
    } else {
        info!("poller disabled; serving sessions only");
        None
    };

    let state = Arc::new(AppState {
        session: SessionContext {
            hub,
            fetcher,
            group: config.group.clone(),
            heartbeat_interval: config.heartbeat_interval,
        },
        store,
        poller: poller_status,
        metrics,
        ws_token: config.ws_token.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("callboard listening on {}", config.listen_addr);

    let shutdown = cancel.clone();
    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("server shutdown with error")?;

    cancel.cancel();
    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; waiting for background tasks"
    );
    let drain = async {
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!("background tasks did not stop within the grace period");
    }
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
