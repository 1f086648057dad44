//! Store notifications to session lifecycle events.
//!
//! The notifier holds one subscription covering three sources:
//!
//! | Channel | Kind | Event |
//! |---|---|---|
//! | `<ns>:event:<db>:created:*` | pattern | [`SessionEvent::Created`] |
//! | `__keyevent@<db>__:del` | channel | [`SessionEvent::Deleted`] |
//! | `__keyevent@<db>__:expired` | channel | [`SessionEvent::Expired`] |
//!
//! Key-event payloads are key names; only expiration-tracking keys
//! (`<ns>:sessions:expires:<id>`) are acted on. The session record outlives
//! its tracking key by the expiration grace period, so it can still be loaded
//! to populate the event.
//!
//! Nothing that goes wrong while handling one message stops the loop: decode
//! failures, vanished records and publisher errors are logged and counted.
//! If the subscription itself ends, it is re-established with backoff.

use crate::metrics::SessionMetrics;
use crate::repository::SessionRepository;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::task::TaskHandle;
use futures::StreamExt;
use session_store_core::record;
use session_store_core::{
    ChannelMessage, KeyValueStore, MessageStream, SessionEvent, SessionEventPublisher, StoreError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Turns store notifications into [`SessionEvent`]s.
pub struct EventNotifier<S> {
    repository: Arc<SessionRepository<S>>,
    publisher: Arc<dyn SessionEventPublisher>,
    retry: RetryPolicy,
}

impl<S> std::fmt::Debug for EventNotifier<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore + 'static> EventNotifier<S> {
    /// Notifier reading through `repository` and publishing to `publisher`.
    #[must_use]
    pub fn new(
        repository: Arc<SessionRepository<S>>,
        publisher: Arc<dyn SessionEventPublisher>,
    ) -> Self {
        Self {
            repository,
            publisher,
            retry: RetryPolicy::default(),
        }
    }

    /// Backoff used when the subscription has to be re-established.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Exact channels and patterns the notifier listens on.
    #[must_use]
    pub fn subscriptions(&self) -> (Vec<String>, Vec<String>) {
        let keys = self.repository.keys();
        (
            vec![keys.deleted_channel(), keys.expired_channel()],
            vec![keys.created_channel_pattern()],
        )
    }

    /// Subscribe, then spawn the delivery loop.
    ///
    /// The subscription is live when this returns, so sessions saved
    /// afterwards are observed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SubscriptionFailed`] if the first subscription
    /// cannot be established.
    pub async fn start(self) -> Result<TaskHandle, StoreError> {
        let notifier = Arc::new(self);
        let stream = notifier.subscribe().await?;
        let (channels, patterns) = notifier.subscriptions();
        tracing::info!(?channels, ?patterns, "Session event notifier subscribed");

        Ok(TaskHandle::spawn("session-event-notifier", move |shutdown| {
            notifier.run(stream, shutdown)
        }))
    }

    /// Handle one message. Never fails.
    pub async fn handle_message(&self, message: &ChannelMessage) {
        let keys = self.repository.keys();

        if let Some(session_id) = message.channel.strip_prefix(&keys.created_channel_prefix()) {
            self.handle_created(session_id, &message.payload);
            return;
        }

        let deleted = message.channel == keys.deleted_channel();
        if !deleted && message.channel != keys.expired_channel() {
            tracing::debug!(channel = %message.channel, "Ignoring message on unrelated channel");
            return;
        }

        let key = message.payload_text();
        let Some(session_id) = key.strip_prefix(&keys.expired_key_prefix()) else {
            return;
        };
        self.handle_removed(session_id, deleted).await;
    }

    fn handle_created(&self, session_id: &str, payload: &[u8]) {
        let fields: HashMap<String, String> = match self.repository.serializer().deserialize(payload)
        {
            Ok(fields) => fields.into_iter().collect(),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Undecodable created payload");
                SessionMetrics::record_notification_failure();
                return;
            }
        };
        match record::decode(session_id, &fields) {
            Ok(session) => self.publish(SessionEvent::Created { session }),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Malformed created payload");
                SessionMetrics::record_notification_failure();
            }
        }
    }

    async fn handle_removed(&self, session_id: &str, deleted: bool) {
        let session = match self.repository.load(session_id, true).await {
            Ok(Some(state)) => state.session,
            Ok(None) => {
                tracing::warn!(
                    session_id = %session_id,
                    "Session record already gone, cannot publish event"
                );
                SessionMetrics::record_notification_failure();
                return;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to load removed session");
                SessionMetrics::record_notification_failure();
                return;
            }
        };

        if let Err(e) = self.repository.cleanup_principal_index(&session).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to clean principal index");
        }

        let event = if deleted {
            SessionEvent::Deleted { session }
        } else {
            SessionEvent::Expired { session }
        };
        self.publish(event);
    }

    fn publish(&self, event: SessionEvent) {
        let kind = event.kind();
        let session_id = event.session_id().to_string();
        match self.publisher.publish(event) {
            Ok(()) => {
                SessionMetrics::record_event_published(kind);
                tracing::debug!(session_id = %session_id, kind, "Session event published");
            }
            Err(e) => {
                SessionMetrics::record_notification_failure();
                tracing::error!(session_id = %session_id, kind, error = %e, "Session event listener failed");
            }
        }
    }

    async fn subscribe(&self) -> Result<MessageStream, StoreError> {
        let (channels, patterns) = self.subscriptions();
        self.repository
            .store()
            .subscribe(&channels, &patterns)
            .await
    }

    async fn run(self: Arc<Self>, mut stream: MessageStream, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                next = stream.next() => match next {
                    Some(Ok(message)) => self.handle_message(&message).await,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Subscription delivered an error");
                        SessionMetrics::record_notification_failure();
                    }
                    None => {
                        tracing::warn!("Subscription closed, resubscribing");
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            resubscribed = retry_with_backoff(&self.retry, || self.subscribe()) => {
                                match resubscribed {
                                    Ok(fresh) => stream = fresh,
                                    Err(e) => {
                                        tracing::error!(error = %e, "Could not resubscribe, notifier stopping");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                },
            }
        }
        tracing::debug!("Session event notifier loop exited");
    }
}
