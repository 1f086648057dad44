//! Session lifecycle events.
//!
//! Three events describe a session's lifecycle as observed through the store's
//! notification channels:
//!
//! - **Created**: a new session's first write was announced on its created channel
//! - **Deleted**: the session's expiration-tracking key was deleted
//! - **Expired**: the session's expiration-tracking key expired
//!
//! Events carry a snapshot of the session. Delivery is at-least-once:
//! every notifier attached to the same store reports the same notification,
//! so listeners must tolerate duplicate events, Expired in particular. A
//! listener may also observe an event without a matching earlier one (for
//! example a Deleted for a session created before it subscribed).

use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

/// Typed session lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A new session was persisted for the first time.
    Created {
        /// Session as reconstructed from the created payload
        session: Session,
    },
    /// A session was deleted explicitly.
    Deleted {
        /// Last persisted state of the session
        session: Session,
    },
    /// A session reached its max-inactive-interval.
    Expired {
        /// Last persisted state of the session
        session: Session,
    },
}

impl SessionEvent {
    /// Session carried by the event.
    #[must_use]
    pub const fn session(&self) -> &Session {
        match self {
            Self::Created { session } | Self::Deleted { session } | Self::Expired { session } => {
                session
            }
        }
    }

    /// Id of the session carried by the event.
    #[must_use]
    pub fn session_id(&self) -> &str {
        self.session().id()
    }

    /// Short name of the event kind, used as a metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Deleted { .. } => "deleted",
            Self::Expired { .. } => "expired",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} {}", self.session_id(), self.kind())
    }
}

/// Errors raised by a [`SessionEventPublisher`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The publisher is shut down
    #[error("Publisher closed")]
    Closed,

    /// A listener rejected the event
    #[error("Listener failed: {0}")]
    ListenerFailed(String),
}

/// Application-facing sink for session events.
///
/// The notifier catches and logs publisher errors; a failing publisher never
/// stops notification processing.
pub trait SessionEventPublisher: Send + Sync {
    /// Deliver an event.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] if the event could not be delivered.
    fn publish(&self, event: SessionEvent) -> Result<(), PublishError>;
}

/// Fan-out publisher over a tokio broadcast channel.
///
/// Publishing with no live receivers is not an error. Lagging receivers lose
/// the oldest events.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use session_store_core::{BroadcastEventPublisher, Session, SessionEvent, SessionEventPublisher};
///
/// let publisher = BroadcastEventPublisher::new(16);
/// let mut events = publisher.subscribe();
///
/// let session = Session::new("abc", Utc::now());
/// publisher.publish(SessionEvent::Deleted { session }).unwrap();
/// assert_eq!(events.try_recv().unwrap().session_id(), "abc");
/// ```
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventPublisher {
    /// Publisher buffering up to `capacity` events per receiver.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Open a new receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl SessionEventPublisher for BroadcastEventPublisher {
    fn publish(&self, event: SessionEvent) -> Result<(), PublishError> {
        if self.sender.send(event).is_err() {
            tracing::debug!("No receivers for session event");
        }
        Ok(())
    }
}
