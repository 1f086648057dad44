//! Prometheus metrics for the session store.
//!
//! This module provides metric collection for:
//! - Repository saves and delta writes
//! - Rename races recovered during id rotation
//! - Expiration sweeps
//! - Session events published by the notifier
//!
//! # Example
//!
//! ```rust,no_run
//! use session_store_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the
    /// listener is not started and this returns `Ok`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    // `ExporterError` implements neither `Debug` nor `Display` in 0.15.
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Repository Metrics
    describe_counter!(
        "session_saves_total",
        "Total number of persists that wrote a delta"
    );
    describe_counter!(
        "session_deltas_written_total",
        "Total number of record fields written or removed"
    );
    describe_counter!(
        "session_rename_races_total",
        "Total number of renames whose source key had already vanished"
    );

    // Sweep Metrics
    describe_counter!(
        "session_sweeps_total",
        "Total number of expiration sweeps run"
    );
    describe_counter!(
        "session_sweep_failures_total",
        "Total number of expiration sweeps that failed"
    );
    describe_counter!(
        "session_sweep_touched_total",
        "Total number of expiration-tracking keys probed by sweeps"
    );
    describe_histogram!(
        "session_sweep_duration_seconds",
        "Time taken by an expiration sweep"
    );

    // Notifier Metrics
    describe_counter!(
        "session_events_published_total",
        "Total number of session events handed to the publisher"
    );
    describe_counter!(
        "session_notification_failures_total",
        "Total number of store notifications that could not be turned into events"
    );
}

/// Session repository and notifier metrics recorder.
pub struct SessionMetrics;

impl SessionMetrics {
    /// Record a persist that wrote `fields` record fields.
    pub fn record_save(fields: usize) {
        counter!("session_saves_total").increment(1);
        counter!("session_deltas_written_total").increment(fields as u64);
    }

    /// Record a rename whose source had already vanished.
    pub fn record_rename_race() {
        counter!("session_rename_races_total").increment(1);
    }

    /// Record a completed sweep.
    pub fn record_sweep(touched: usize, duration: Duration) {
        counter!("session_sweeps_total").increment(1);
        counter!("session_sweep_touched_total").increment(touched as u64);
        histogram!("session_sweep_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed sweep.
    pub fn record_sweep_failure() {
        counter!("session_sweep_failures_total").increment(1);
    }

    /// Record an event handed to the publisher.
    pub fn record_event_published(kind: &'static str) {
        counter!("session_events_published_total", "kind" => kind).increment(1);
    }

    /// Record a notification that was dropped.
    pub fn record_notification_failure() {
        counter!("session_notification_failures_total").increment(1);
    }
}
