//! Indexed session repository.
//!
//! Persists sessions as field maps, maintains the per-principal index and the
//! expiration buckets, and announces new sessions on their created channel.
//! No store transactions are used: every step is a single-key command, and
//! the only failure recovered in place is a rename whose source already
//! expired.

use crate::expiration::{ExpirationPolicy, expires_in_millis};
use crate::handle::{SessionBackend, SessionHandle, SessionState};
use crate::metrics::SessionMetrics;
use chrono::{DateTime, Duration, Utc};
use session_store_core::keys::KeyResolver;
use session_store_core::record::{self, ATTRIBUTE_PREFIX, put_all_attributes};
use session_store_core::{
    Clock, DefaultPrincipalNameResolver, JsonPayloadSerializer, KeyValueStore, PayloadSerializer,
    PrincipalNameResolver, Result, SaveMode, Session, SessionConfig, SessionError,
    SessionIdGenerator, SessionKeys, SystemClock,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Session repository with principal index, expiration buckets and
/// lifecycle notifications.
///
/// # Example
///
/// ```rust,ignore
/// use session_store_runtime::SessionRepository;
///
/// let repository = SessionRepository::builder(store)
///     .config(SessionConfig::from_env())
///     .build()?;
///
/// let mut session = repository.create_session().await?;
/// session.set_attribute("principal_name", "alice").await?;
/// repository.save(&mut session).await?;
///
/// let sessions = repository.find_by_principal_name("alice").await?;
/// assert!(sessions.contains_key(session.id()));
/// ```
pub struct SessionRepository<S> {
    store: Arc<S>,
    config: SessionConfig,
    keys: Arc<SessionKeys>,
    policy: ExpirationPolicy<S>,
    id_generator: Arc<dyn SessionIdGenerator>,
    principal_resolver: Arc<dyn PrincipalNameResolver>,
    serializer: Arc<dyn PayloadSerializer>,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for SessionRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRepository")
            .field("config", &self.config)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> SessionRepository<S> {
    /// Start building a repository over `store`.
    #[must_use]
    pub fn builder(store: S) -> SessionRepositoryBuilder<S> {
        SessionRepositoryBuilder::new(Arc::new(store))
    }

    /// Shared store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Key and channel layout.
    #[must_use]
    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Created-channel payload serializer.
    #[must_use]
    pub fn serializer(&self) -> &dyn PayloadSerializer {
        self.serializer.as_ref()
    }

    /// Principal resolver.
    #[must_use]
    pub fn principal_resolver(&self) -> &dyn PrincipalNameResolver {
        self.principal_resolver.as_ref()
    }

    /// Expiration policy.
    #[must_use]
    pub const fn policy(&self) -> &ExpirationPolicy<S> {
        &self.policy
    }

    /// Create a new session with a fresh id and the default interval.
    ///
    /// Nothing is stored until the first save, unless the flush mode is
    /// [`Immediate`](session_store_core::FlushMode::Immediate).
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
        if self.config.flush_mode == session_store_core::FlushMode::Immediate {
            handle.save().await?;
        }
        Ok(handle)
    }

    /// Load a live session.
    ///
    /// A missing record, or one whose interval has elapsed, is `Ok(None)`.
    /// Elapsed records are left for the store to evict.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CorruptRecord`] for a malformed record, or a
    /// store error.
    pub async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionHandle<'_, Self>>> {
        Ok(self
            .load(session_id, false)
            .await?
            .map(|state| SessionHandle::new(self, state)))
    }

    /// Every live session indexed under `principal_name`, keyed by id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CorruptRecord`] for a malformed record, or a
    /// store error.
    pub async fn find_by_principal_name(
        &self,
        principal_name: &str,
    ) -> Result<HashMap<String, SessionHandle<'_, Self>>> {
        let ids = self
            .store
            .set_members(&self.keys.principal_key(principal_name))
            .await?;
        let mut sessions = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.find_by_id(&id).await? {
                sessions.insert(id, session);
            }
        }
        Ok(sessions)
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

    /// Delete a session, expired or not.
    ///
    /// The expiration-tracking key is removed first, which is what the
    /// deleted notification reports. The record itself is kept for the
    /// expiration grace period so the notifier can still read it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CorruptRecord`] for a malformed record, or a
    /// store error.
    pub async fn delete_by_id(&self, session_id: &str) -> Result<()> {
        let Some(mut state) = self.load(session_id, true).await? else {
            tracing::debug!(session_id = %session_id, "Nothing to delete");
            return Ok(());
        };

        self.cleanup_principal_index(&state.session).await?;
        self.policy.on_delete(&state.session).await?;
        self.store
            .delete(&self.keys.expired_key(state.session.id()))
            .await?;

        state.session.set_max_inactive_interval(Duration::zero());
        state.delta.put(record::MAX_INACTIVE_INTERVAL_FIELD, "0");
        self.write_changes(&mut state).await?;

        tracing::info!(session_id = %session_id, "Session deleted");
        Ok(())
    }

    /// Probe the sessions due in the current minute so the store evicts them.
    ///
    /// Returns the number of tracking keys probed.
    ///
    /// # Errors
    ///
    /// Returns a store error; probes already made are not undone.
    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        let started = Instant::now();
        let touched = self.policy.clean_expired_sessions(self.clock.now()).await?;
        SessionMetrics::record_sweep(touched, started.elapsed());
        tracing::debug!(touched, "Expiration sweep finished");
        Ok(touched)
    }

    /// Read and decode a record.
    ///
    /// With `allow_expired` an elapsed record is still returned.
    pub(crate) async fn load(
        &self,
        session_id: &str,
        allow_expired: bool,
    ) -> Result<Option<SessionState>> {
        let fields = self
            .store
            .hash_get_all(&self.keys.session_key(session_id))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let session = record::decode(session_id, &fields)?;
        if !allow_expired && session.is_expired_at(self.clock.now()) {
            tracing::debug!(session_id = %session_id, "Session found but expired");
            return Ok(None);
        }
        let principal = self.principal_resolver.resolve(&session);
        let expiry = expires_in_millis(&session);
        Ok(Some(SessionState::loaded(session, principal, Some(expiry))))
    }

    /// Drop `session` from the index of its current principal.
    pub(crate) async fn cleanup_principal_index(&self, session: &Session) -> Result<()> {
        if let Some(principal) = self.principal_resolver.resolve(session) {
            self.store
                .set_remove(&self.keys.principal_key(&principal), session.id())
                .await?;
        }
        Ok(())
    }

    /// Rename a key, treating a vanished source as a no-op.
    ///
    /// Returns `false` if the source was already gone.
    async fn rename_tolerating_race(&self, from: &str, to: &str) -> Result<bool> {
        match self.store.rename(from, to).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_no_such_key() => {
                tracing::debug!(from = %from, to = %to, "Rename source already gone");
                SessionMetrics::record_rename_race();
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move the stored record, tracking key and index membership to the
    /// session's new id.
    ///
    /// Returns `false` if the record had already expired away.
    async fn save_changed_session_id(&self, state: &mut SessionState) -> Result<bool> {
        let new_id = state.session.id().to_string();
        let old_id = std::mem::replace(&mut state.original_id, new_id.clone());
        if state.is_new {
            return Ok(true);
        }

        let record_moved = self
            .rename_tolerating_race(
                &self.keys.session_key(&old_id),
                &self.keys.session_key(&new_id),
            )
            .await?;
        if !record_moved {
            if let Some(principal) = &state.original_principal {
                self.store
                    .set_remove(&self.keys.principal_key(principal), &old_id)
                    .await?;
            }
            return Ok(false);
        }

        self.rename_tolerating_race(
            &self.keys.expired_key(&old_id),
            &self.keys.expired_key(&new_id),
        )
        .await?;

        if let Some(principal) = &state.original_principal {
            let index = self.keys.principal_key(principal);
            self.store.set_remove(&index, &old_id).await?;
            self.store.set_add(&index, &new_id).await?;
        }

        // The marker names the old id; the session is re-filed under the new
        // one after the delta is written.
        if let Some(expiry) = state.original_expiry_millis.take() {
            self.policy.remove_marker(&old_id, expiry).await?;
        }

        tracing::debug!(from = %old_id, to = %new_id, "Session id changed");
        Ok(true)
    }

    fn touches_principal(&self, state: &SessionState) -> bool {
        state.delta.fields().any(|field| {
            field
                .strip_prefix(ATTRIBUTE_PREFIX)
                .is_some_and(|name| self.principal_resolver.is_principal_attribute(name))
        })
    }

    async fn update_principal_index(&self, state: &mut SessionState) -> Result<()> {
        let id = state.session.id();
        if let Some(original) = &state.original_principal {
            self.store
                .set_remove(&self.keys.principal_key(original), id)
                .await?;
        }
        let principal = self.principal_resolver.resolve(&state.session);
        if let Some(principal) = &principal {
            self.store
                .set_add(&self.keys.principal_key(principal), id)
                .await?;
        }
        state.original_principal = principal;
        Ok(())
    }
}

impl<S: KeyValueStore> SessionBackend for SessionRepository<S> {
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

        // A stored session is live exactly while its tracking key exists; the
        // record itself lingers for the grace period after a delete.
        if !state.is_new
            && !self
                .store
                .exists(&self.keys.expired_key(&state.original_id))
                .await?
        {
            return Err(SessionError::InvalidatedSession {
                session_id: state.original_id.clone(),
            });
        }

        self.write_changes(state).await
    }
}

impl<S: KeyValueStore> SessionRepository<S> {
    /// Write a session's pending changes without checking it is still live.
    async fn write_changes(&self, state: &mut SessionState) -> Result<()> {
        let changed_id = state.has_changed_id();
        if changed_id && !self.save_changed_session_id(state).await? {
            // The record expired between the existence check and the rename;
            // writing the delta now would leave a partial record behind.
            state.delta.clear();
            return Ok(());
        }

        if state.delta.is_empty() && !changed_id {
            return Ok(());
        }

        let touches_principal = self.touches_principal(state);
        let written = state.delta.clone();
        let session_id = state.session.id().to_string();
        let session_key = self.keys.session_key(&session_id);

        let removals = written.removals();
        if !removals.is_empty() {
            self.store.hash_delete(&session_key, &removals).await?;
        }
        let writes = written.writes();
        if !writes.is_empty() {
            self.store.hash_put_all(&session_key, &writes).await?;
        }

        if touches_principal {
            self.update_principal_index(state).await?;
        }
        state.delta.clear();

        self.policy
            .on_expiration_updated(state.original_expiry_millis, &state.session)
            .await?;
        state.original_expiry_millis = Some(expires_in_millis(&state.session));

        SessionMetrics::record_save(written.len());
        tracing::debug!(session_id = %session_id, fields = written.len(), "Session delta saved");

        if state.is_new {
            let payload = self.serializer.serialize(&written.to_payload())?;
            self.store
                .publish(&self.keys.created_channel(&session_id), &payload)
                .await?;
            state.is_new = false;
            tracing::debug!(session_id = %session_id, "Session creation announced");
        }
        Ok(())
    }
}

/// Builder for [`SessionRepository`].
pub struct SessionRepositoryBuilder<S> {
    store: Arc<S>,
    config: SessionConfig,
    id_generator: Option<Arc<dyn SessionIdGenerator>>,
    principal_resolver: Arc<dyn PrincipalNameResolver>,
    serializer: Arc<dyn PayloadSerializer>,
    clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore> SessionRepositoryBuilder<S> {
    fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: SessionConfig::default(),
            id_generator: None,
            principal_resolver: Arc::new(DefaultPrincipalNameResolver),
            serializer: Arc::new(JsonPayloadSerializer),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `config` (defaults otherwise).
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the id generator chosen by the configured strategy.
    #[must_use]
    pub fn id_generator(mut self, id_generator: Arc<dyn SessionIdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    /// Override the principal resolver.
    #[must_use]
    pub fn principal_resolver(mut self, resolver: Arc<dyn PrincipalNameResolver>) -> Self {
        self.principal_resolver = resolver;
        self
    }

    /// Override the created-channel payload serializer.
    #[must_use]
    pub fn serializer(mut self, serializer: Arc<dyn PayloadSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Override the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the repository.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if the configuration is invalid.
    pub fn build(self) -> Result<SessionRepository<S>> {
        self.config.validate()?;
        let keys = Arc::new(SessionKeys::new(
            &self.config.namespace,
            self.config.database,
        )?);
        let resolver: Arc<dyn KeyResolver> = keys.clone();
        let policy = ExpirationPolicy::new(Arc::clone(&self.store), resolver);
        let id_generator = self
            .id_generator
            .unwrap_or_else(|| self.config.id_strategy.build());

        Ok(SessionRepository {
            store: self.store,
            config: self.config,
            keys,
            policy,
            id_generator,
            principal_resolver: self.principal_resolver,
            serializer: self.serializer,
            clock: self.clock,
        })
    }
}
