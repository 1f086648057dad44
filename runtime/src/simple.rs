//! Non-indexed session repository.
//!
//! Stores only the session record: no principal index, no expiration
//! buckets, no notifications. The record's TTL is an absolute expiry at
//! last-access + interval, so the store's own reaper is the only eviction.

use crate::handle::{SessionBackend, SessionHandle, SessionState};
use crate::metrics::SessionMetrics;
use chrono::{DateTime, Duration, Utc};
use session_store_core::record::{self, put_all_attributes};
use session_store_core::{
    Clock, FlushMode, KeyValueStore, Result, SaveMode, Session, SessionConfig, SessionError,
    SessionIdGenerator, SessionKeys, SystemClock,
};
use std::sync::Arc;

/// Session repository that keeps nothing but the session records.
///
/// Use it when principal lookups and lifecycle events are not needed; it
/// issues fewer commands per save than [`SessionRepository`](crate::SessionRepository).
pub struct SimpleSessionRepository<S> {
    store: Arc<S>,
    config: SessionConfig,
    keys: SessionKeys,
    id_generator: Arc<dyn SessionIdGenerator>,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for SimpleSessionRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleSessionRepository")
            .field("config", &self.config)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> SimpleSessionRepository<S> {
    /// Repository over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if `config` is invalid.
    pub fn new(store: S, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let keys = SessionKeys::new(&config.namespace, config.database)?;
        let id_generator = config.id_strategy.build();
        Ok(Self {
            store: Arc::new(store),
            config,
            keys,
            id_generator,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the id generator.
    #[must_use]
    pub fn with_id_generator(mut self, id_generator: Arc<dyn SessionIdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Key layout.
    #[must_use]
    pub const fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Create a new, unsaved session.
    ///
    /// # Errors
    ///
    /// Returns a store error from an immediate flush.
    pub async fn create_session(&self) -> Result<SessionHandle<'_, Self>> {
        let mut session = Session::new(self.id_generator.generate(), self.clock.now());
        session.set_max_inactive_interval(Duration::seconds(
            self.config.max_inactive_interval_seconds,
        ));
        let mut handle = SessionHandle::new(self, SessionState::created(session));
        if self.config.flush_mode == FlushMode::Immediate {
            handle.save().await?;
        }
        Ok(handle)
    }

    /// Load a live session. An elapsed record is deleted and reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CorruptRecord`] for a malformed record, or a
    /// store error.
    pub async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionHandle<'_, Self>>> {
        let key = self.keys.session_key(session_id);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let session = record::decode(session_id, &fields)?;
        if session.is_expired_at(self.clock.now()) {
            self.store.delete(&key).await?;
            tracing::debug!(session_id = %session_id, "Expired session removed on read");
            return Ok(None);
        }
        Ok(Some(SessionHandle::new(
            self,
            SessionState::loaded(session, None, None),
        )))
    }

    /// Persist a session's pending changes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidatedSession`] if the stored session
    /// vanished, or a store error.
    pub async fn save(&self, session: &mut SessionHandle<'_, Self>) -> Result<()> {
        self.persist(session.state_mut()).await
    }

    /// Delete a session record.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn delete_by_id(&self, session_id: &str) -> Result<()> {
        self.store
            .delete(&self.keys.session_key(session_id))
            .await?;
        Ok(())
    }
}

impl<S: KeyValueStore> SessionBackend for SimpleSessionRepository<S> {
    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn generate_id(&self) -> String {
        self.id_generator.generate()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn persist(&self, state: &mut SessionState) -> Result<()> {
        if self.config.save_mode == SaveMode::Always {
            put_all_attributes(&mut state.delta, &state.session);
        }
        if state.delta.is_empty() && !state.has_changed_id() {
            return Ok(());
        }

        if !state.is_new
            && !self
                .store
                .exists(&self.keys.session_key(&state.original_id))
                .await?
        {
            return Err(SessionError::InvalidatedSession {
                session_id: state.original_id.clone(),
            });
        }

        if state.has_changed_id() {
            if !state.is_new {
                self.store
                    .rename(
                        &self.keys.session_key(&state.original_id),
                        &self.keys.session_key(state.session.id()),
                    )
                    .await?;
            }
            state.original_id = state.session.id().to_string();
        }

        let key = self.keys.session_key(state.session.id());
        let removals = state.delta.removals();
        if !removals.is_empty() {
            self.store.hash_delete(&key, &removals).await?;
        }
        let writes = state.delta.writes();
        if !writes.is_empty() {
            self.store.hash_put_all(&key, &writes).await?;
        }
        SessionMetrics::record_save(state.delta.len());
        state.delta.clear();

        match state.session.expires_at() {
            Some(at) => {
                self.store.expire_at(&key, at).await?;
            }
            None => {
                self.store.persist(&key).await?;
            }
        }
        state.is_new = false;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use session_store_testing::{InMemoryKeyValueStore, ManualClock, SequentialIdGenerator};

    fn repository(
        clock: &ManualClock,
    ) -> (
        InMemoryKeyValueStore,
        SimpleSessionRepository<InMemoryKeyValueStore>,
    ) {
        let store = InMemoryKeyValueStore::new(clock.shared());
        let repository = SimpleSessionRepository::new(store.clone(), SessionConfig::default())
            .unwrap()
            .with_clock(clock.shared())
            .with_id_generator(Arc::new(SequentialIdGenerator::new()));
        (store, repository)
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let clock = ManualClock::default();
        let (store, repository) = repository(&clock);

        let mut session = repository.create_session().await.unwrap();
        session.set_attribute("cart", json!(["book"])).await.unwrap();
        session.save().await.unwrap();

        let key = repository.keys().session_key(session.id());
        assert_eq!(store.ttl(&key), Some(Duration::seconds(1800)));

        let mut found = repository.find_by_id(session.id()).await.unwrap().unwrap();
        assert_eq!(found.attribute("cart"), Some(&json!(["book"])));
        assert!(!found.is_new());
    }

    #[tokio::test]
    async fn test_keeps_no_tracking_keys() {
        let clock = ManualClock::default();
        let (store, repository) = repository(&clock);

        let mut session = repository.create_session().await.unwrap();
        session.save().await.unwrap();

        assert_eq!(store.keys(), vec![repository.keys().session_key(session.id())]);
    }

    #[tokio::test]
    async fn test_expired_record_is_deleted_on_read() {
        let clock = ManualClock::default();
        let (store, repository) = repository(&clock);

        let mut session = repository.create_session().await.unwrap();
        session.save().await.unwrap();
        let id = session.id().to_string();

        // Elapsed client-side while the store still holds the record.
        let key = repository.keys().session_key(&id);
        store.persist(&key).await.unwrap();
        clock.advance(Duration::seconds(1801));

        assert!(repository.find_by_id(&id).await.unwrap().is_none());
        assert!(!store.contains_key(&key));
    }

    #[tokio::test]
    async fn test_never_expiring_session_has_no_ttl() {
        let clock = ManualClock::default();
        let (store, repository) = repository(&clock);

        let mut session = repository.create_session().await.unwrap();
        session
            .set_max_inactive_interval(Duration::seconds(-1))
            .await
            .unwrap();
        session.save().await.unwrap();

        let key = repository.keys().session_key(session.id());
        assert!(store.contains_key(&key));
        assert_eq!(store.ttl(&key), None);
    }

    #[tokio::test]
    async fn test_change_id_renames_record() {
        let clock = ManualClock::default();
        let (store, repository) = repository(&clock);

        let mut session = repository.create_session().await.unwrap();
        session.save().await.unwrap();
        let old = session.id().to_string();

        let new = session.change_session_id();
        session.save().await.unwrap();

        assert!(!store.contains_key(&repository.keys().session_key(&old)));
        assert!(store.contains_key(&repository.keys().session_key(&new)));
    }

    #[tokio::test]
    async fn test_save_after_delete_is_invalidated() {
        let clock = ManualClock::default();
        let (_store, repository) = repository(&clock);

        let mut session = repository.create_session().await.unwrap();
        session.save().await.unwrap();
        repository.delete_by_id(session.id()).await.unwrap();

        session.set_attribute("a", 1).await.unwrap();
        let err = session.save().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidatedSession { .. }));
    }
}
