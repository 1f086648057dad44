//! Session store daemon.
//!
//! Runs the background half of the session store against Redis: the
//! expiration sweeper and the event notifier. Lifecycle events are logged;
//! applications embedding the repository attach their own publisher instead.
//!
//! Configuration comes from `SESSION_*` environment variables. `METRICS_ADDR`
//! (e.g. `0.0.0.0:9090`) enables the Prometheus endpoint.
//!
//! Run with: `cargo run --bin session-store`

use anyhow::Context;
use session_store_core::{BroadcastEventPublisher, SessionConfig};
use session_store_redis::RedisKeyValueStore;
use session_store_runtime::metrics::MetricsServer;
use session_store_runtime::{EventNotifier, ExpirationSweeper, SessionRepository};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SessionConfig::from_env();
    config.validate().context("invalid session configuration")?;
    info!(
        namespace = %config.namespace,
        database = config.database,
        max_inactive_interval_seconds = config.max_inactive_interval_seconds,
        cleanup_cron = %config.cleanup_cron,
        "Starting session store daemon"
    );

    let _metrics = match std::env::var("METRICS_ADDR") {
        Ok(addr) => {
            let addr: SocketAddr = addr.parse().context("invalid METRICS_ADDR")?;
            let mut server = MetricsServer::new(addr);
            server.start()?;
            Some(server)
        }
        Err(_) => None,
    };

    let store = RedisKeyValueStore::new(&config.redis_url).await?;
    let config = config
        .for_connected_database(store.database())
        .context("SESSION_DATABASE does not match REDIS_URL")?;
    if config.configure_keyspace_notifications {
        store.enable_keyspace_notifications().await?;
    }

    let repository = Arc::new(
        SessionRepository::builder(store)
            .config(config)
            .build()?,
    );

    let publisher = Arc::new(BroadcastEventPublisher::default());
    let mut events = publisher.subscribe();
    let relay = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    kind = event.kind(),
                    session_id = %event.session_id(),
                    "Session event"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let notifier = EventNotifier::new(Arc::clone(&repository), publisher)
        .start()
        .await?;
    let sweeper = ExpirationSweeper::new(Arc::clone(&repository))?.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    sweeper.shutdown().await;
    notifier.shutdown().await;
    relay.abort();

    info!("Session store daemon stopped");
    Ok(())
}
