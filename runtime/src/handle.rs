//! Session handles: a session plus its pending delta, bound to the
//! repository that loaded it.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use session_store_core::record::{
    LAST_ACCESSED_TIME_FIELD, MAX_INACTIVE_INTERVAL_FIELD, attribute_field, encode_attribute,
    encode_instant, put_all_attributes, put_structural_fields,
};
use session_store_core::{Delta, FlushMode, Result, SaveMode, Session, SessionConfig};
use std::future::Future;

/// Repository operations a [`SessionHandle`] calls back into.
///
/// Implemented by [`SessionRepository`](crate::SessionRepository) and
/// [`SimpleSessionRepository`](crate::SimpleSessionRepository).
pub trait SessionBackend: Send + Sync {
    /// Repository configuration (flush and save modes).
    fn config(&self) -> &SessionConfig;

    /// Fresh session id.
    fn generate_id(&self) -> String;

    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Write the pending state of a session.
    ///
    /// On success the delta is empty and the state reflects what is stored.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidatedSession`](session_store_core::SessionError::InvalidatedSession)
    /// if a previously stored session vanished, or a store error.
    fn persist(&self, state: &mut SessionState) -> impl Future<Output = Result<()>> + Send;
}

/// Bookkeeping for one loaded or created session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub(crate) session: Session,
    pub(crate) delta: Delta,
    pub(crate) is_new: bool,
    pub(crate) original_id: String,
    pub(crate) original_principal: Option<String>,
    pub(crate) original_expiry_millis: Option<i64>,
}

impl SessionState {
    /// State for a session that has never been stored.
    ///
    /// Every structural field and attribute is pending.
    pub(crate) fn created(session: Session) -> Self {
        let mut delta = Delta::new();
        put_structural_fields(&mut delta, &session);
        put_all_attributes(&mut delta, &session);
        Self {
            original_id: session.id().to_string(),
            session,
            delta,
            is_new: true,
            original_principal: None,
            original_expiry_millis: None,
        }
    }

    /// State for a session read back from the store.
    pub(crate) fn loaded(
        session: Session,
        original_principal: Option<String>,
        original_expiry_millis: Option<i64>,
    ) -> Self {
        Self {
            original_id: session.id().to_string(),
            session,
            delta: Delta::new(),
            is_new: false,
            original_principal,
            original_expiry_millis,
        }
    }

    /// The session value.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Pending field writes.
    #[must_use]
    pub const fn delta(&self) -> &Delta {
        &self.delta
    }

    /// Returns `true` until the session is first stored.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.is_new
    }

    /// Id the session is stored under.
    #[must_use]
    pub fn original_id(&self) -> &str {
        &self.original_id
    }

    /// Returns `true` if the id was rotated since the last persist.
    #[must_use]
    pub fn has_changed_id(&self) -> bool {
        self.session.id() != self.original_id
    }
}

/// A session checked out from a repository.
///
/// Mutations are recorded in the handle's delta and reach the store on
/// [`save`](Self::save), or immediately under [`FlushMode::Immediate`].
///
/// # Example
///
/// ```rust,ignore
/// let mut session = repository.create_session().await?;
/// session.set_attribute("cart", json!(["book"])).await?;
/// session.save().await?;
///
/// let mut found = repository.find_by_id(session.id()).await?.unwrap();
/// assert_eq!(found.attribute("cart"), Some(&json!(["book"])));
/// ```
pub struct SessionHandle<'r, B: SessionBackend> {
    backend: &'r B,
    state: SessionState,
}

impl<B: SessionBackend> std::fmt::Debug for SessionHandle<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'r, B: SessionBackend> SessionHandle<'r, B> {
    pub(crate) const fn new(backend: &'r B, state: SessionState) -> Self {
        Self { backend, state }
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.state.session.id()
    }

    /// The session value.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.state.session
    }

    /// Persistence bookkeeping.
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) const fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// Returns `true` until the session is first stored.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.state.is_new
    }

    /// Returns `true` if the max-inactive-interval has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.state.session.is_expired_at(self.backend.now())
    }

    /// When the session was created.
    #[must_use]
    pub const fn creation_time(&self) -> DateTime<Utc> {
        self.state.session.creation_time()
    }

    /// When the session was last accessed.
    #[must_use]
    pub const fn last_accessed_time(&self) -> DateTime<Utc> {
        self.state.session.last_accessed_time()
    }

    /// Max-inactive-interval (negative: never expires).
    #[must_use]
    pub fn max_inactive_interval(&self) -> Duration {
        self.state.session.max_inactive_interval()
    }

    /// Read an attribute.
    ///
    /// Under [`SaveMode::OnGetAttribute`] a present attribute is marked dirty
    /// and rewritten on the next save.
    pub fn attribute(&mut self, name: &str) -> Option<&Value> {
        if self.backend.config().save_mode == SaveMode::OnGetAttribute {
            if let Some(value) = self.state.session.attribute(name) {
                let encoded = encode_attribute(value);
                self.state.delta.put(attribute_field(name), encoded);
            }
        }
        self.state.session.attribute(name)
    }

    /// Names of all attributes.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.state.session.attribute_names()
    }

    /// Set an attribute.
    ///
    /// # Errors
    ///
    /// Under [`FlushMode::Immediate`], returns any error from the flush.
    pub async fn set_attribute(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.state
            .delta
            .put(attribute_field(name), encode_attribute(&value));
        self.state.session.set_attribute(name, value);
        self.flush_if_immediate().await
    }

    /// Remove an attribute, returning its previous value.
    ///
    /// # Errors
    ///
    /// Under [`FlushMode::Immediate`], returns any error from the flush.
    pub async fn remove_attribute(&mut self, name: &str) -> Result<Option<Value>> {
        let previous = self.state.session.remove_attribute(name);
        self.state.delta.remove(attribute_field(name));
        self.flush_if_immediate().await?;
        Ok(previous)
    }

    /// Set the last-accessed time.
    ///
    /// # Errors
    ///
    /// Under [`FlushMode::Immediate`], returns any error from the flush.
    pub async fn set_last_accessed_time(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.state.session.set_last_accessed_time(at);
        self.state
            .delta
            .put(LAST_ACCESSED_TIME_FIELD, encode_instant(at));
        self.flush_if_immediate().await
    }

    /// Mark the session accessed now.
    ///
    /// # Errors
    ///
    /// Under [`FlushMode::Immediate`], returns any error from the flush.
    pub async fn touch(&mut self) -> Result<()> {
        let now = self.backend.now();
        self.set_last_accessed_time(now).await
    }

    /// Set the max-inactive-interval. Sub-second precision is dropped.
    ///
    /// # Errors
    ///
    /// Under [`FlushMode::Immediate`], returns any error from the flush.
    pub async fn set_max_inactive_interval(&mut self, interval: Duration) -> Result<()> {
        self.state.session.set_max_inactive_interval(interval);
        self.state.delta.put(
            MAX_INACTIVE_INTERVAL_FIELD,
            self.state.session.max_inactive_interval_seconds().to_string(),
        );
        self.flush_if_immediate().await
    }

    /// Rotate to a freshly generated id and return it.
    ///
    /// The stored record, its tracking key and its principal index membership
    /// move to the new id on the next save.
    pub fn change_session_id(&mut self) -> String {
        let id = self.backend.generate_id();
        self.state.session.set_id(id.clone());
        id
    }

    /// Persist pending changes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidatedSession`](session_store_core::SessionError::InvalidatedSession)
    /// if the stored session vanished, or a store error.
    pub async fn save(&mut self) -> Result<()> {
        self.backend.persist(&mut self.state).await
    }

    /// Release the session value.
    #[must_use]
    pub fn into_session(self) -> Session {
        self.state.session
    }

    async fn flush_if_immediate(&mut self) -> Result<()> {
        if self.backend.config().flush_mode == FlushMode::Immediate {
            self.save().await?;
        }
        Ok(())
    }
}
