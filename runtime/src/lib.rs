//! # Session Store Runtime
//!
//! Orchestration over a [`KeyValueStore`](session_store_core::KeyValueStore).
//!
//! ## Core Components
//!
//! - **SessionRepository**: create, load, save and delete sessions; keeps the
//!   principal index and expiration buckets; announces new sessions
//! - **SimpleSessionRepository**: record-only variant without index or events
//! - **ExpirationPolicy**: per-minute buckets and TTLs for deterministic expiry
//! - **EventNotifier**: turns store notifications into [`SessionEvent`]s
//! - **ExpirationSweeper**: runs the bucket sweep on a cron schedule
//!
//! ## Example
//!
//! ```ignore
//! use session_store_core::{BroadcastEventPublisher, SessionConfig};
//! use session_store_runtime::{EventNotifier, ExpirationSweeper, SessionRepository};
//! use std::sync::Arc;
//!
//! let repository = Arc::new(
//!     SessionRepository::builder(store)
//!         .config(SessionConfig::from_env())
//!         .build()?,
//! );
//!
//! let publisher = Arc::new(BroadcastEventPublisher::default());
//! let mut events = publisher.subscribe();
//! let notifier = EventNotifier::new(Arc::clone(&repository), publisher)
//!     .start()
//!     .await?;
//! let sweeper = ExpirationSweeper::new(Arc::clone(&repository))?.start();
//!
//! let mut session = repository.create_session().await?;
//! session.save().await?;
//! assert!(events.recv().await?.session_id() == session.id());
//!
//! sweeper.shutdown().await;
//! notifier.shutdown().await;
//! ```
//!
//! [`SessionEvent`]: session_store_core::SessionEvent

/// Time-bucketed expiration bookkeeping
pub mod expiration;

/// Session handles and the backend trait they call into
pub mod handle;

/// Prometheus metrics for observability
pub mod metrics;

/// Store notifications to lifecycle events
pub mod notifier;

/// Indexed session repository
pub mod repository;

/// Exponential backoff for resubscription
pub mod retry;

/// Record-only session repository
pub mod simple;

/// Scheduled expiration sweep
pub mod sweeper;

/// Background task handles
pub mod task;

pub use expiration::ExpirationPolicy;
pub use handle::{SessionBackend, SessionHandle, SessionState};
pub use notifier::EventNotifier;
pub use repository::{SessionRepository, SessionRepositoryBuilder};
pub use simple::SimpleSessionRepository;
pub use sweeper::ExpirationSweeper;
pub use task::TaskHandle;
