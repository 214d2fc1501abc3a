//! rpc-failover daemon: runs the probe loop and logs selection changes.
//!
//! Selections are persisted to SQLite, so other processes pointed at the same
//! file start on a recent primary.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rpc_failover::{
    ErrorReporter, FailoverConfig, HttpTransport, InMemoryStorage, RpcFailover, SqliteStorage,
    Storage, TracingReporter, WebhookReporter,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match FailoverConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let db_path =
        std::env::var("RPC_FAILOVER_DB_PATH").unwrap_or_else(|_| "./rpc-failover.db".to_string());
    let storage: Arc<dyn Storage> = match SqliteStorage::open(&db_path) {
        Ok(store) => {
            tracing::info!("Selection store: SQLite at {db_path}");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!("Failed to open SQLite store at {db_path}: {e}");
            tracing::warn!("Falling back to in-memory store; selections will not survive restart");
            Arc::new(InMemoryStorage::new())
        }
    };

    let webhook_urls: Vec<String> = std::env::var("RPC_FAILOVER_WEBHOOK_URLS")
        .ok()
        .map(|urls| {
            urls.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let reporter: Arc<dyn ErrorReporter> = if webhook_urls.is_empty() {
        Arc::new(TracingReporter)
    } else {
        tracing::info!("Anomaly webhooks configured: {}", webhook_urls.len());
        Arc::new(WebhookReporter::new(webhook_urls))
    };

    let failover = match RpcFailover::builder(config, HttpTransport::new())
        .with_storage(storage)
        .with_reporter(reporter)
        .build()
    {
        Ok(f) => Arc::new(f),
        Err(e) => {
            tracing::error!("Failed to initialize rpc failover: {e}");
            std::process::exit(1);
        }
    };

    let watcher = Arc::downgrade(&failover);
    failover
        .subscribe(move |event| {
            let Some(failover) = watcher.upgrade() else {
                return;
            };
            if let Some(snapshot) = failover.snapshot(&event.chain_id) {
                tracing::info!(
                    chain_id = %event.chain_id,
                    primary = %snapshot.endpoints.primary,
                    secondary = %snapshot.endpoints.secondary,
                    degraded = snapshot.degraded,
                    height_gap = ?snapshot.best_height_gap,
                    "selection applied"
                );
            }
        })
        .detach();

    for chain_id in failover.chain_ids() {
        let endpoints = failover.current_endpoints(&chain_id);
        tracing::info!(
            chain_id = %chain_id,
            primary = %endpoints.primary,
            secondary = %endpoints.secondary,
            "initial selection"
        );
    }

    failover.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    tracing::info!("Shutting down");
    failover.stop().await;
    tracing::debug!("final metrics:\n{}", rpc_failover::metrics::metrics_output());
}
