//! Cron-driven expiration sweep.

use crate::handle::SessionBackend;
use crate::metrics::SessionMetrics;
use crate::repository::SessionRepository;
use crate::task::TaskHandle;
use chrono::Utc;
use session_store_core::{KeyValueStore, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Runs [`SessionRepository::cleanup_expired_sessions`] on the configured
/// cron schedule (every minute on the minute by default).
pub struct ExpirationSweeper<S> {
    repository: Arc<SessionRepository<S>>,
    schedule: cron::Schedule,
}

impl<S> std::fmt::Debug for ExpirationSweeper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationSweeper")
            .field("schedule", &self.schedule.to_string())
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore + 'static> ExpirationSweeper<S> {
    /// Sweeper on the repository's configured schedule.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`](session_store_core::SessionError::Configuration)
    /// if the cron expression does not parse.
    pub fn new(repository: Arc<SessionRepository<S>>) -> Result<Self> {
        let schedule = repository.config().cleanup_schedule()?;
        Ok(Self {
            repository,
            schedule,
        })
    }

    /// Run one sweep now. Failures are logged and counted, never returned.
    pub async fn sweep(&self) -> usize {
        match self.repository.cleanup_expired_sessions().await {
            Ok(touched) => touched,
            Err(e) => {
                SessionMetrics::record_sweep_failure();
                tracing::error!(error = %e, "Expiration sweep failed");
                0
            }
        }
    }

    /// Spawn the schedule loop.
    #[must_use]
    pub fn start(self) -> TaskHandle {
        tracing::info!(schedule = %self.schedule, "Expiration sweeper scheduled");
        TaskHandle::spawn("expiration-sweeper", move |shutdown| self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                tracing::warn!("Sweep schedule has no upcoming run");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(wait) => {
                    let touched = self.sweep().await;
                    tracing::debug!(touched, at = %next, "Scheduled sweep ran");
                }
            }
        }
    }
}
