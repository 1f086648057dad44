//! Background task handles with broadcast shutdown.

use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Handle to a spawned background loop.
///
/// Dropping the handle leaves the task running; call
/// [`shutdown`](Self::shutdown) to stop it and wait for it to finish.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `body`, handing it the shutdown receiver.
    pub(crate) fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(body(shutdown_rx));
        tracing::info!(task = name, "Background task started");
        Self {
            name,
            shutdown_tx,
            task,
        }
    }

    /// Task name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `true` once the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop and wait for it.
    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            tracing::debug!(task = self.name, "Task already stopped");
        }
        if let Err(e) = self.task.await {
            tracing::error!(task = self.name, error = %e, "Background task panicked");
        }
        tracing::info!(task = self.name, "Background task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let handle = TaskHandle::spawn("idle", |mut shutdown| async move {
            let _ = shutdown.recv().await;
        });
        assert_eq!(handle.name(), "idle");
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_after_exit() {
        let handle = TaskHandle::spawn("done", |_shutdown| async {});
        tokio::task::yield_now().await;
        handle.shutdown().await;
    }
}
