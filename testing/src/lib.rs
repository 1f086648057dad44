//! # Session Store Testing
//!
//! Testing utilities for the session store.
//!
//! This crate provides:
//! - [`InMemoryKeyValueStore`]: a deterministic store with TTLs and key-event
//!   notifications
//! - Clocks: [`FixedClock`] and the steppable [`ManualClock`]
//! - [`RecordingEventPublisher`]: captures published session events
//! - [`SequentialIdGenerator`]: predictable session ids
//!
//! ## Example
//!
//! ```ignore
//! use session_store_testing::{InMemoryKeyValueStore, ManualClock};
//! use session_store_runtime::SessionRepository;
//!
//! #[tokio::test]
//! async fn test_session_expires() {
//!     let clock = ManualClock::default();
//!     let store = InMemoryKeyValueStore::new(clock.shared());
//!     let repository = SessionRepository::builder(store)
//!         .clock(clock.shared())
//!         .build()
//!         .unwrap();
//!
//!     let mut session = repository.create_session().await.unwrap();
//!     session.save().await.unwrap();
//!     let id = session.id().to_string();
//!
//!     clock.advance(chrono::Duration::minutes(31));
//!     assert!(repository.find_by_id(&id).await.unwrap().is_none());
//! }
//! ```

pub mod memory_store;

use chrono::{DateTime, Utc};
use session_store_core::environment::Clock;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use session_store_core::event::{PublishError, SessionEvent, SessionEventPublisher};
    use session_store_core::id::SessionIdGenerator;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use session_store_testing::mocks::FixedClock;
    /// use session_store_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// 2025-01-01 00:00:00 UTC, a minute boundary.
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the store
    /// and repository and step another.
    ///
    /// # Example
    ///
    /// ```
    /// use chrono::Duration;
    /// use session_store_core::environment::Clock;
    /// use session_store_testing::ManualClock;
    ///
    /// let clock = ManualClock::default();
    /// let start = clock.now();
    /// clock.advance(Duration::seconds(90));
    /// assert_eq!(clock.now() - start, Duration::seconds(90));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move time forward.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an instant.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }

        /// This clock as a shared trait object.
        #[must_use]
        pub fn shared(&self) -> Arc<dyn Clock> {
            Arc::new(self.clone())
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_epoch())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Publisher that records every event it is handed.
    ///
    /// Clones share the same log. Can be switched into a failing mode to
    /// exercise listener-failure handling.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingEventPublisher {
        events: Arc<Mutex<Vec<SessionEvent>>>,
        failing: Arc<AtomicBool>,
    }

    impl RecordingEventPublisher {
        /// Empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make subsequent publishes fail (after recording the attempt).
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Snapshot of recorded events.
        #[must_use]
        pub fn events(&self) -> Vec<SessionEvent> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Number of recorded events.
        #[must_use]
        pub fn len(&self) -> usize {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        /// Returns `true` if nothing was recorded.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Forget recorded events.
        pub fn clear(&self) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        /// Wait until at least `count` events are recorded or `timeout` elapses,
        /// then return the snapshot.
        pub async fn wait_for(&self, count: usize, timeout: std::time::Duration) -> Vec<SessionEvent> {
            let deadline = tokio::time::Instant::now() + timeout;
            while self.len() < count && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            self.events()
        }
    }

    impl SessionEventPublisher for RecordingEventPublisher {
        fn publish(&self, event: SessionEvent) -> Result<(), PublishError> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
            if self.failing.load(Ordering::SeqCst) {
                return Err(PublishError::ListenerFailed("recorder set to fail".to_string()));
            }
            Ok(())
        }
    }

    /// Generates `session-1`, `session-2`, ...
    #[derive(Debug, Default)]
    pub struct SequentialIdGenerator {
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Generator starting at 1.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl SessionIdGenerator for SequentialIdGenerator {
        fn generate(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            format!("session-{n}")
        }
    }
}

/// Install a `tracing` subscriber writing to the test harness output.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use memory_store::InMemoryKeyValueStore;
pub use mocks::{
    FixedClock, ManualClock, RecordingEventPublisher, SequentialIdGenerator, test_clock,
    test_epoch,
};

#[cfg(test)]
mod tests {
    use super::*;
    use session_store_core::SessionIdGenerator;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let other = clock.clone();
        clock.advance(chrono::Duration::minutes(1));

        assert_eq!(other.now(), test_epoch() + chrono::Duration::minutes(1));
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new();
        assert_eq!(ids.generate(), "session-1");
        assert_eq!(ids.generate(), "session-2");
    }
}
