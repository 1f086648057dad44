//! Namespaced key and channel layout.

use crate::error::{Result, SessionError};

/// Name of the principal index.
pub const PRINCIPAL_NAME_INDEX_NAME: &str = "principal_name";

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "spring:session";

/// Prefix of an expiration-bucket member.
pub const EXPIRES_MARKER_PREFIX: &str = "expires:";

/// Key lookups the expiration policy needs from its owner.
///
/// Keeps the policy independent of the full key layout so it can be exercised
/// with a fake.
pub trait KeyResolver: Send + Sync {
    /// Key of the expiration bucket for an epoch-millis minute boundary.
    fn expirations_key(&self, bucket_millis: i64) -> String;

    /// Key derived from a session id (or an `expires:<id>` marker).
    fn session_key(&self, session_id: &str) -> String;
}

/// Key and channel layout for one namespace and database.
///
/// # Example
///
/// ```
/// use session_store_core::SessionKeys;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let keys = SessionKeys::new("spring:session", 0)?;
/// assert_eq!(keys.session_key("abc"), "spring:session:sessions:abc");
/// assert_eq!(keys.expired_key("abc"), "spring:session:sessions:expires:abc");
/// assert_eq!(keys.deleted_channel(), "__keyevent@0__:del");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    namespace: String,
    database: i64,
}

impl SessionKeys {
    /// Build the layout for `namespace` (a `:` separator is appended).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if `namespace` is blank.
    pub fn new(namespace: &str, database: i64) -> Result<Self> {
        let namespace = namespace.trim();
        if namespace.is_empty() {
            return Err(SessionError::Configuration(
                "namespace must not be empty".to_string(),
            ));
        }
        Ok(Self {
            namespace: format!("{namespace}:"),
            database,
        })
    }

    /// The namespace prefix, including its trailing separator.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Database index used in channel names.
    #[must_use]
    pub const fn database(&self) -> i64 {
        self.database
    }

    /// Record key for a session id.
    #[must_use]
    pub fn session_key(&self, session_id: &str) -> String {
        format!("{}sessions:{session_id}", self.namespace)
    }

    /// Principal index key for a principal name.
    #[must_use]
    pub fn principal_key(&self, principal_name: &str) -> String {
        format!(
            "{}index:{PRINCIPAL_NAME_INDEX_NAME}:{principal_name}",
            self.namespace
        )
    }

    /// Expiration bucket key.
    #[must_use]
    pub fn expirations_key(&self, bucket_millis: i64) -> String {
        format!("{}expirations:{bucket_millis}", self.namespace)
    }

    /// Prefix shared by all expiration-tracking keys.
    #[must_use]
    pub fn expired_key_prefix(&self) -> String {
        format!("{}sessions:{EXPIRES_MARKER_PREFIX}", self.namespace)
    }

    /// Expiration-tracking key for a session id.
    #[must_use]
    pub fn expired_key(&self, session_id: &str) -> String {
        format!("{}{session_id}", self.expired_key_prefix())
    }

    /// Prefix shared by all created-event channels.
    #[must_use]
    pub fn created_channel_prefix(&self) -> String {
        format!("{}event:{}:created:", self.namespace, self.database)
    }

    /// Created-event channel for a session id.
    #[must_use]
    pub fn created_channel(&self, session_id: &str) -> String {
        format!("{}{session_id}", self.created_channel_prefix())
    }

    /// Pattern matching every created-event channel of this namespace.
    #[must_use]
    pub fn created_channel_pattern(&self) -> String {
        format!("{}*", self.created_channel_prefix())
    }

    /// Native key-deleted event channel.
    #[must_use]
    pub fn deleted_channel(&self) -> String {
        format!("__keyevent@{}__:del", self.database)
    }

    /// Native key-expired event channel.
    #[must_use]
    pub fn expired_channel(&self) -> String {
        format!("__keyevent@{}__:expired", self.database)
    }
}

impl KeyResolver for SessionKeys {
    fn expirations_key(&self, bucket_millis: i64) -> String {
        Self::expirations_key(self, bucket_millis)
    }

    fn session_key(&self, session_id: &str) -> String {
        Self::session_key(self, session_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layout() {
        let keys = SessionKeys::new("  app ", 3).unwrap();

        assert_eq!(keys.namespace(), "app:");
        assert_eq!(keys.session_key("s1"), "app:sessions:s1");
        assert_eq!(keys.principal_key("alice"), "app:index:principal_name:alice");
        assert_eq!(keys.expirations_key(60_000), "app:expirations:60000");
        assert_eq!(keys.expired_key("s1"), "app:sessions:expires:s1");
        assert_eq!(keys.created_channel("s1"), "app:event:3:created:s1");
        assert_eq!(keys.created_channel_pattern(), "app:event:3:created:*");
        assert_eq!(keys.expired_channel(), "__keyevent@3__:expired");
    }

    #[test]
    fn test_marker_resolves_to_tracking_key() {
        let keys = SessionKeys::new(DEFAULT_NAMESPACE, 0).unwrap();
        let marker = format!("{EXPIRES_MARKER_PREFIX}s1");

        assert_eq!(KeyResolver::session_key(&keys, &marker), keys.expired_key("s1"));
    }

    #[test]
    fn test_blank_namespace_rejected() {
        assert!(matches!(
            SessionKeys::new("   ", 0),
            Err(SessionError::Configuration(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_session_id_recoverable_from_names(id in "[A-Za-z0-9+/=:_-]{1,40}") {
            let keys = SessionKeys::new(DEFAULT_NAMESPACE, 0).unwrap();

            let tracking = keys.expired_key(&id);
            prop_assert_eq!(tracking.strip_prefix(&keys.expired_key_prefix()), Some(id.as_str()));

            let channel = keys.created_channel(&id);
            prop_assert_eq!(channel.strip_prefix(&keys.created_channel_prefix()), Some(id.as_str()));
        }
    }
}
