//! Persisted session record layout.
//!
//! A session is stored as a field map:
//!
//! | Field | Value |
//! |---|---|
//! | `creationTime` | epoch millis |
//! | `lastAccessedTime` | epoch millis |
//! | `maxInactiveInterval` | seconds (may be negative) |
//! | `sessionAttr:<name>` | JSON-encoded attribute value |
//!
//! Writes are never full rewrites: a [`Delta`] collects the fields touched
//! since the last flush and only those are written.

use crate::error::{Result, SessionError};
use crate::session::{MAX_INACTIVE_INTERVAL_SECONDS, Session};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Creation time field (epoch millis).
pub const CREATION_TIME_FIELD: &str = "creationTime";

/// Last-accessed time field (epoch millis).
pub const LAST_ACCESSED_TIME_FIELD: &str = "lastAccessedTime";

/// Max-inactive-interval field (seconds).
pub const MAX_INACTIVE_INTERVAL_FIELD: &str = "maxInactiveInterval";

/// Prefix for attribute fields.
pub const ATTRIBUTE_PREFIX: &str = "sessionAttr:";

/// Record field holding the attribute `name`.
#[must_use]
pub fn attribute_field(name: &str) -> String {
    format!("{ATTRIBUTE_PREFIX}{name}")
}

/// Pending field writes for one session since its last flush.
///
/// A `None` value is a pending removal of that field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    fields: BTreeMap<String, Option<String>>,
}

impl Delta {
    /// Create an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending write, replacing any earlier pending value.
    pub fn put(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), Some(value.into()));
    }

    /// Record a pending removal.
    pub fn remove(&mut self, field: impl Into<String>) {
        self.fields.insert(field.into(), None);
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of pending fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if `field` is pending (write or removal).
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Pending value of `field`: `Some(None)` for a pending removal.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<Option<&str>> {
        self.fields.get(field).map(Option::as_deref)
    }

    /// Names of all pending fields.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Pending writes as field/value pairs.
    #[must_use]
    pub fn writes(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .filter_map(|(field, value)| value.as_ref().map(|v| (field.clone(), v.clone())))
            .collect()
    }

    /// Fields pending removal.
    #[must_use]
    pub fn removals(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(field, _)| field.clone())
            .collect()
    }

    /// Pending writes as an ordered map (the created-channel payload).
    #[must_use]
    pub fn to_payload(&self) -> BTreeMap<String, String> {
        self.writes().into_iter().collect()
    }

    /// Drop everything pending.
    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

/// Encode an instant as epoch millis.
#[must_use]
pub fn encode_instant(instant: DateTime<Utc>) -> String {
    instant.timestamp_millis().to_string()
}

/// Encode an attribute value as compact JSON.
#[must_use]
pub fn encode_attribute(value: &Value) -> String {
    value.to_string()
}

/// Seed `delta` with every structural field of `session`.
pub fn put_structural_fields(delta: &mut Delta, session: &Session) {
    delta.put(CREATION_TIME_FIELD, encode_instant(session.creation_time()));
    delta.put(
        MAX_INACTIVE_INTERVAL_FIELD,
        session.max_inactive_interval_seconds().to_string(),
    );
    delta.put(
        LAST_ACCESSED_TIME_FIELD,
        encode_instant(session.last_accessed_time()),
    );
}

/// Seed `delta` with every attribute of `session`.
pub fn put_all_attributes(delta: &mut Delta, session: &Session) {
    for (name, value) in session.attributes() {
        delta.put(attribute_field(name), encode_attribute(value));
    }
}

/// Materialize a session from its persisted field map.
///
/// Every structural field is mandatory; unknown non-attribute fields are
/// ignored.
///
/// # Errors
///
/// Returns [`SessionError::CorruptRecord`] if a structural field is missing or
/// malformed, or an attribute value is not valid JSON.
pub fn decode(session_id: &str, fields: &HashMap<String, String>) -> Result<Session> {
    let creation_time = decode_instant(session_id, fields, CREATION_TIME_FIELD)?;
    let last_accessed_time = decode_instant(session_id, fields, LAST_ACCESSED_TIME_FIELD)?;
    let raw_interval: i64 = parse_field(session_id, fields, MAX_INACTIVE_INTERVAL_FIELD)?;
    let interval = chrono::Duration::try_seconds(raw_interval)
        .filter(|_| raw_interval <= MAX_INACTIVE_INTERVAL_SECONDS)
        .ok_or_else(|| {
            corrupt(
                session_id,
                format!("{MAX_INACTIVE_INTERVAL_FIELD} out of range: {raw_interval}"),
            )
        })?;

    let mut session = Session::new(session_id, creation_time);
    session.set_last_accessed_time(last_accessed_time);
    session.set_max_inactive_interval(interval);

    for (field, raw) in fields {
        let Some(name) = field.strip_prefix(ATTRIBUTE_PREFIX) else {
            continue;
        };
        let value: Value = serde_json::from_str(raw).map_err(|e| corrupt(
            session_id,
            format!("attribute '{name}' is not valid JSON: {e}"),
        ))?;
        session.set_attribute(name, value);
    }

    Ok(session)
}

fn decode_instant(
    session_id: &str,
    fields: &HashMap<String, String>,
    field: &str,
) -> Result<DateTime<Utc>> {
    let millis: i64 = parse_field(session_id, fields, field)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| corrupt(session_id, format!("{field} out of range: {millis}")))
}

fn parse_field(session_id: &str, fields: &HashMap<String, String>, field: &str) -> Result<i64> {
    let raw = fields
        .get(field)
        .ok_or_else(|| corrupt(session_id, format!("{field} key must not be null")))?;
    raw.trim()
        .parse()
        .map_err(|_| corrupt(session_id, format!("{field} is not an integer: {raw:?}")))
}

fn corrupt(session_id: &str, reason: String) -> SessionError {
    SessionError::CorruptRecord {
        session_id: session_id.to_string(),
        reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record() -> HashMap<String, String> {
        HashMap::from([
            (CREATION_TIME_FIELD.to_string(), "1735689600000".to_string()),
            (LAST_ACCESSED_TIME_FIELD.to_string(), "1735689660000".to_string()),
            (MAX_INACTIVE_INTERVAL_FIELD.to_string(), "120".to_string()),
            (attribute_field("x"), "1".to_string()),
            (attribute_field("user"), r#"{"name":"alice"}"#.to_string()),
        ])
    }

    #[test]
    fn test_decode_full_record() {
        let session = decode("abc", &record()).unwrap();

        assert_eq!(session.id(), "abc");
        assert_eq!(session.creation_time().timestamp_millis(), 1_735_689_600_000);
        assert_eq!(session.last_accessed_time().timestamp_millis(), 1_735_689_660_000);
        assert_eq!(session.max_inactive_interval(), Duration::seconds(120));
        assert_eq!(session.attribute("x"), Some(&json!(1)));
        assert_eq!(session.attribute("user"), Some(&json!({"name": "alice"})));
    }

    #[test]
    fn test_decode_missing_structural_field_is_corrupt() {
        for field in [CREATION_TIME_FIELD, LAST_ACCESSED_TIME_FIELD, MAX_INACTIVE_INTERVAL_FIELD] {
            let mut fields = record();
            fields.remove(field);

            let err = decode("abc", &fields).unwrap_err();
            assert!(
                matches!(&err, SessionError::CorruptRecord { session_id, reason }
                    if session_id == "abc" && reason.contains(field)),
                "unexpected error for {field}: {err:?}"
            );
        }
    }

    #[test]
    fn test_decode_malformed_interval_is_corrupt() {
        let mut fields = record();
        fields.insert(MAX_INACTIVE_INTERVAL_FIELD.to_string(), "soon".to_string());

        assert!(matches!(
            decode("abc", &fields),
            Err(SessionError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_decode_out_of_range_interval_is_corrupt() {
        for raw in ["10000000000000", "9300000000000000", "-9300000000000000"] {
            let mut fields = record();
            fields.insert(MAX_INACTIVE_INTERVAL_FIELD.to_string(), raw.to_string());

            let err = decode("abc", &fields).unwrap_err();
            assert!(
                matches!(&err, SessionError::CorruptRecord { reason, .. }
                    if reason.contains(MAX_INACTIVE_INTERVAL_FIELD)),
                "unexpected error for {raw}: {err:?}"
            );
        }
    }

    #[test]
    fn test_decode_largest_interval() {
        let mut fields = record();
        fields.insert(
            MAX_INACTIVE_INTERVAL_FIELD.to_string(),
            MAX_INACTIVE_INTERVAL_SECONDS.to_string(),
        );

        let session = decode("abc", &fields).unwrap();
        assert_eq!(
            session.max_inactive_interval_seconds(),
            MAX_INACTIVE_INTERVAL_SECONDS
        );
        assert!(session.expires_at().is_some());
    }

    #[test]
    fn test_delta_tracks_writes_and_removals() {
        let mut delta = Delta::new();
        assert!(delta.is_empty());

        delta.put(attribute_field("a"), "1");
        delta.remove(attribute_field("b"));
        delta.put(attribute_field("b"), "2");
        delta.remove(attribute_field("c"));

        assert_eq!(delta.len(), 3);
        assert_eq!(delta.get("sessionAttr:b"), Some(Some("2")));
        assert_eq!(delta.get("sessionAttr:c"), Some(None));
        assert_eq!(delta.removals(), vec!["sessionAttr:c".to_string()]);
        assert_eq!(delta.writes().len(), 2);

        delta.clear();
        assert!(delta.is_empty());
    }

    #[test]
    fn test_structural_fields_decode_back() {
        let now = DateTime::from_timestamp_millis(1_735_689_600_123).unwrap();
        let mut session = Session::new("abc", now);
        session.set_max_inactive_interval(Duration::seconds(-1));
        session.set_attribute("x", json!([1, 2]));

        let mut delta = Delta::new();
        put_structural_fields(&mut delta, &session);
        put_all_attributes(&mut delta, &session);

        let fields: HashMap<String, String> = delta.writes().into_iter().collect();
        assert_eq!(decode("abc", &fields).unwrap(), session);
    }
}
