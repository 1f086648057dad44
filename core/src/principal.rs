//! Principal name resolution for the per-principal session index.

use crate::session::Session;
use serde_json::Value;

/// Attribute holding the principal name directly.
pub const PRINCIPAL_NAME_ATTRIBUTE: &str = "principal_name";

/// Attribute holding a security context document.
///
/// Its principal is read from `authentication.name`.
pub const SECURITY_CONTEXT_ATTRIBUTE: &str = "security_context";

/// Resolves the principal a session belongs to.
pub trait PrincipalNameResolver: Send + Sync {
    /// Principal name of `session`, if any.
    fn resolve(&self, session: &Session) -> Option<String>;

    /// Returns `true` if writing attribute `name` can change the principal.
    fn is_principal_attribute(&self, name: &str) -> bool;
}

/// Reads [`PRINCIPAL_NAME_ATTRIBUTE`], falling back to the authentication
/// name inside [`SECURITY_CONTEXT_ATTRIBUTE`].
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use serde_json::json;
/// use session_store_core::{DefaultPrincipalNameResolver, PrincipalNameResolver, Session};
///
/// let mut session = Session::new("abc", Utc::now());
/// session.set_attribute("security_context", json!({"authentication": {"name": "alice"}}));
///
/// let resolver = DefaultPrincipalNameResolver;
/// assert_eq!(resolver.resolve(&session), Some("alice".to_string()));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPrincipalNameResolver;

impl PrincipalNameResolver for DefaultPrincipalNameResolver {
    fn resolve(&self, session: &Session) -> Option<String> {
        if let Some(name) = session.attribute(PRINCIPAL_NAME_ATTRIBUTE).and_then(Value::as_str) {
            return Some(name.to_string());
        }
        session
            .attribute(SECURITY_CONTEXT_ATTRIBUTE)
            .and_then(|context| context.pointer("/authentication/name"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn is_principal_attribute(&self, name: &str) -> bool {
        name == PRINCIPAL_NAME_ATTRIBUTE || name == SECURITY_CONTEXT_ATTRIBUTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_direct_attribute_wins() {
        let mut session = Session::new("s1", Utc::now());
        session.set_attribute(PRINCIPAL_NAME_ATTRIBUTE, json!("bob"));
        session.set_attribute(
            SECURITY_CONTEXT_ATTRIBUTE,
            json!({"authentication": {"name": "alice"}}),
        );

        assert_eq!(DefaultPrincipalNameResolver.resolve(&session), Some("bob".into()));
    }

    #[test]
    fn test_no_principal() {
        let mut session = Session::new("s1", Utc::now());
        assert_eq!(DefaultPrincipalNameResolver.resolve(&session), None);

        session.set_attribute(PRINCIPAL_NAME_ATTRIBUTE, json!(42));
        assert_eq!(DefaultPrincipalNameResolver.resolve(&session), None);
    }

    #[test]
    fn test_principal_attributes() {
        assert!(DefaultPrincipalNameResolver.is_principal_attribute("principal_name"));
        assert!(DefaultPrincipalNameResolver.is_principal_attribute("security_context"));
        assert!(!DefaultPrincipalNameResolver.is_principal_attribute("cart"));
    }
}
