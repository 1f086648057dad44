//! Error types for session repository operations.

use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error taxonomy surfaced to repository callers.
///
/// A missing or client-side expired session is not an error: lookups return
/// `Ok(None)`. Rename races and notification failures are recovered where
/// they happen and never reach this type.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    // ═══════════════════════════════════════════════════════════
    // Session Errors
    // ═══════════════════════════════════════════════════════════

    /// A non-new session was saved after its record vanished.
    #[error("Session was invalidated: {session_id}")]
    InvalidatedSession {
        /// Id the session was loaded under
        session_id: String,
    },

    /// A persisted record is missing or has a malformed structural field.
    #[error("Corrupt session record {session_id}: {reason}")]
    CorruptRecord {
        /// Id of the offending record
        session_id: String,
        /// What was wrong with it
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════
    // System Errors
    // ═══════════════════════════════════════════════════════════

    /// The underlying store rejected an operation.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// An attribute value or notification payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl SessionError {
    /// Returns `true` if the caller's session is unusable and must be discarded.
    ///
    /// # Examples
    ///
    /// ```
    /// # use session_store_core::SessionError;
    /// let err = SessionError::InvalidatedSession { session_id: "abc".into() };
    /// assert!(err.is_session_lost());
    /// assert!(!SessionError::Configuration("x".into()).is_session_lost());
    /// ```
    #[must_use]
    pub const fn is_session_lost(&self) -> bool {
        matches!(
            self,
            Self::InvalidatedSession { .. } | Self::CorruptRecord { .. }
        )
    }
}
