//! The materialized session value.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Default max-inactive-interval applied when no configuration overrides it.
pub const DEFAULT_MAX_INACTIVE_INTERVAL_SECONDS: i64 = 1800;

/// Largest max-inactive-interval a session can hold (about 31,700 years).
///
/// Keeps expiry instants and their epoch-millisecond form representable.
pub const MAX_INACTIVE_INTERVAL_SECONDS: i64 = 1_000_000_000_000;

/// Server-side record of per-user state addressed by an opaque id.
///
/// The max-inactive-interval is held in whole seconds:
///
/// - negative: never expires
/// - zero: expires immediately
/// - positive: expires that many seconds after the last access
///
/// Attribute values are opaque JSON documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: String,
    creation_time: DateTime<Utc>,
    last_accessed_time: DateTime<Utc>,
    max_inactive_interval_seconds: i64,
    attributes: HashMap<String, Value>,
}

impl Session {
    /// Create a session created and last accessed at `now`, with the default interval.
    #[must_use]
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            creation_time: now,
            last_accessed_time: now,
            max_inactive_interval_seconds: DEFAULT_MAX_INACTIVE_INTERVAL_SECONDS,
            attributes: HashMap::new(),
        }
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the session id (rotation).
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// When the session was created.
    #[must_use]
    pub const fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    /// When the session was last accessed.
    #[must_use]
    pub const fn last_accessed_time(&self) -> DateTime<Utc> {
        self.last_accessed_time
    }

    /// Set the last-accessed time.
    pub const fn set_last_accessed_time(&mut self, last_accessed_time: DateTime<Utc>) {
        self.last_accessed_time = last_accessed_time;
    }

    /// Max-inactive-interval as a duration (may be negative).
    #[must_use]
    pub fn max_inactive_interval(&self) -> Duration {
        Duration::try_seconds(self.max_inactive_interval_seconds).unwrap_or(
            if self.max_inactive_interval_seconds < 0 {
                Duration::MIN
            } else {
                Duration::MAX
            },
        )
    }

    /// Max-inactive-interval in whole seconds.
    #[must_use]
    pub const fn max_inactive_interval_seconds(&self) -> i64 {
        self.max_inactive_interval_seconds
    }

    /// Set the max-inactive-interval. Sub-second precision is dropped and
    /// positive intervals are capped at [`MAX_INACTIVE_INTERVAL_SECONDS`].
    pub fn set_max_inactive_interval(&mut self, interval: Duration) {
        self.max_inactive_interval_seconds =
            interval.num_seconds().min(MAX_INACTIVE_INTERVAL_SECONDS);
    }

    /// Returns `true` if the session never expires.
    #[must_use]
    pub const fn never_expires(&self) -> bool {
        self.max_inactive_interval_seconds < 0
    }

    /// Instant at which the session becomes expired, `None` if it never expires.
    ///
    /// An expiry past the representable range is clamped to
    /// [`DateTime::<Utc>::MAX_UTC`].
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.never_expires() {
            return None;
        }
        Some(
            self.last_accessed_time
                .checked_add_signed(self.max_inactive_interval())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// Returns `true` if the interval has elapsed since the last access at `now`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{Duration, Utc};
    /// use session_store_core::Session;
    ///
    /// let now = Utc::now();
    /// let mut session = Session::new("abc", now);
    /// session.set_max_inactive_interval(Duration::seconds(60));
    /// assert!(!session.is_expired_at(now + Duration::seconds(59)));
    /// assert!(session.is_expired_at(now + Duration::seconds(60)));
    /// ```
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires_at| now >= expires_at)
    }

    /// Attribute value by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Names of all attributes.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// All attributes.
    #[must_use]
    pub const fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(name.into(), value)
    }

    /// Remove an attribute, returning the previous value.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600 + seconds, 0).unwrap_or_default()
    }

    #[test]
    fn test_negative_interval_never_expires() {
        let mut session = Session::new("s1", at(0));
        session.set_max_inactive_interval(Duration::seconds(-1));

        assert!(session.never_expires());
        assert_eq!(session.expires_at(), None);
        assert!(!session.is_expired_at(at(1_000_000)));
    }

    #[test]
    fn test_zero_interval_is_expired_immediately() {
        let mut session = Session::new("s1", at(0));
        session.set_max_inactive_interval(Duration::zero());

        assert!(session.is_expired_at(at(0)));
    }

    #[test]
    fn test_interval_is_capped() {
        let mut session = Session::new("s1", at(0));
        session.set_max_inactive_interval(Duration::MAX);

        assert_eq!(
            session.max_inactive_interval_seconds(),
            MAX_INACTIVE_INTERVAL_SECONDS
        );
        assert!(!session.is_expired_at(at(1_000_000)));
    }

    #[test]
    fn test_expiry_past_representable_range_is_clamped() {
        let mut session = Session::new("s1", DateTime::<Utc>::MAX_UTC - Duration::days(1));
        session.set_max_inactive_interval(Duration::days(365));

        assert_eq!(session.expires_at(), Some(DateTime::<Utc>::MAX_UTC));
        assert!(!session.is_expired_at(at(0)));
    }

    #[test]
    fn test_attributes() {
        let mut session = Session::new("s1", at(0));
        assert_eq!(session.set_attribute("x", json!(1)), None);
        assert_eq!(session.set_attribute("x", json!(2)), Some(json!(1)));
        assert_eq!(session.attribute("x"), Some(&json!(2)));
        assert_eq!(session.remove_attribute("x"), Some(json!(2)));
        assert_eq!(session.attribute_names().count(), 0);
    }
}
