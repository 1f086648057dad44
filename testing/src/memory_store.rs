//! In-memory key-value store for fast, deterministic tests.
//!
//! [`InMemoryKeyValueStore`] models the parts of the remote engine the session
//! store depends on:
//!
//! - strings, field maps and sets, with `WRONGTYPE` errors on type mismatches
//! - per-key TTLs read against an injected [`Clock`], reaped lazily on access
//!   (or eagerly via [`InMemoryKeyValueStore::expire_due_keys`])
//! - native key-event notifications on `__keyevent@<db>__:del` and
//!   `__keyevent@<db>__:expired`, published with the key name as payload
//! - pub/sub with exact channels and glob patterns
//!
//! Aggregates left empty by a removal are deleted, as the real engine does.

use async_stream::stream;
use chrono::{DateTime, Duration, Utc};
use session_store_core::environment::Clock;
use session_store_core::store::{ChannelMessage, KeyValueStore, MessageStream, StoreError};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

impl Value {
    const fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Hash(_) => "hash",
            Self::Set(_) => "set",
        }
    }

    fn is_empty_aggregate(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::Hash(fields) => fields.is_empty(),
            Self::Set(members) => members.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

struct Subscriber {
    channels: Vec<String>,
    patterns: Vec<String>,
    sender: mpsc::UnboundedSender<Result<ChannelMessage, StoreError>>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    subscribers: Vec<Subscriber>,
    refuse_subscriptions: bool,
}

impl Inner {
    fn deliver(&mut self, channel: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|subscriber| {
            let mut alive = true;
            let mut send = |pattern: Option<&String>| {
                let message = ChannelMessage {
                    channel: channel.to_string(),
                    pattern: pattern.cloned(),
                    payload: payload.to_vec(),
                };
                if subscriber.sender.send(Ok(message)).is_ok() {
                    delivered += 1;
                } else {
                    alive = false;
                }
            };
            if subscriber.channels.iter().any(|c| c == channel) {
                send(None);
            }
            for pattern in &subscriber.patterns {
                if glob_match(pattern, channel) {
                    send(Some(pattern));
                }
            }
            alive
        });
        delivered
    }
}

/// In-memory [`KeyValueStore`] with deterministic expiry.
///
/// Clones share the same data.
///
/// # Example
///
/// ```
/// use chrono::Duration;
/// use session_store_core::KeyValueStore;
/// use session_store_testing::{InMemoryKeyValueStore, ManualClock};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let clock = ManualClock::default();
/// let store = InMemoryKeyValueStore::new(clock.shared());
///
/// store.set("k", "v").await?;
/// store.expire("k", Duration::seconds(10)).await?;
///
/// clock.advance(Duration::seconds(10));
/// assert!(!store.exists("k").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryKeyValueStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
    database: i64,
    notifications: bool,
}

impl std::fmt::Debug for InMemoryKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKeyValueStore")
            .field("database", &self.database)
            .field("notifications", &self.notifications)
            .field("keys", &self.lock().entries.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryKeyValueStore {
    /// Empty store on database 0 with key-event notifications enabled.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
            database: 0,
            notifications: true,
        }
    }

    /// Use `database` in key-event channel names.
    #[must_use]
    pub const fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }

    /// Toggle key-event notifications (a server without `Egx` configured).
    #[must_use]
    pub const fn with_notifications(mut self, enabled: bool) -> Self {
        self.notifications = enabled;
        self
    }

    /// Reap every key whose TTL has elapsed, as the engine's active expiry
    /// cycle would. Returns the number of keys reaped.
    pub fn expire_due_keys(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let mut due: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        due.sort();
        for key in &due {
            inner.entries.remove(key);
            self.notify(&mut inner, "expired", key);
        }
        due.len()
    }

    /// Returns `true` if a live key exists. Does not reap.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Remaining TTL of a live key, `None` if missing or persistent.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.peek(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now)
    }

    /// Sorted names of all live keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| !is_due(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Fields of a live field map (empty if missing).
    #[must_use]
    pub fn hash(&self, key: &str) -> HashMap<String, String> {
        match self.peek(key).map(|entry| entry.value) {
            Some(Value::Hash(fields)) => fields,
            _ => HashMap::new(),
        }
    }

    /// Members of a live set (empty if missing).
    #[must_use]
    pub fn members(&self, key: &str) -> BTreeSet<String> {
        match self.peek(key).map(|entry| entry.value) {
            Some(Value::Set(members)) => members,
            _ => BTreeSet::new(),
        }
    }

    /// End every open subscription stream, as a dropped connection would.
    /// Returns the number of subscriptions closed.
    pub fn close_subscriptions(&self) -> usize {
        let mut inner = self.lock();
        let closed = inner.subscribers.len();
        inner.subscribers.clear();
        closed
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Make subsequent `subscribe` calls fail (an unreachable server).
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.lock().refuse_subscriptions = refuse;
    }

    /// Drop every key without notifications.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peek(&self, key: &str) -> Option<Entry> {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .filter(|entry| !is_due(entry, now))
            .cloned()
    }

    fn notify(&self, inner: &mut Inner, event: &str, key: &str) {
        if self.notifications {
            let channel = format!("__keyevent@{}__:{event}", self.database);
            inner.deliver(&channel, key.as_bytes());
        }
    }

    /// Lock the store after reaping `key` if its TTL has elapsed.
    fn live(&self, key: &str) -> MutexGuard<'_, Inner> {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.entries.get(key).is_some_and(|entry| is_due(entry, now)) {
            inner.entries.remove(key);
            self.notify(&mut inner, "expired", key);
        }
        inner
    }

    fn remove_key(&self, inner: &mut Inner, key: &str) -> bool {
        let existed = inner.entries.remove(key).is_some();
        if existed {
            self.notify(inner, "del", key);
        }
        existed
    }

    fn drop_if_empty(&self, inner: &mut Inner, key: &str) {
        if inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.value.is_empty_aggregate())
        {
            self.remove_key(inner, key);
        }
    }

    fn set_expiry(&self, key: &str, at: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        let mut inner = self.live(key);
        if !inner.entries.contains_key(key) {
            return false;
        }
        if at <= now {
            self.remove_key(&mut inner, key);
        } else if let Some(entry) = inner.entries.get_mut(key) {
            entry.expires_at = Some(at);
        }
        true
    }
}

fn is_due(entry: &Entry, now: DateTime<Utc>) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

fn wrong_type(command: &str, key: &str, found: &Value) -> StoreError {
    StoreError::command(
        command,
        format!(
            "WRONGTYPE Operation against a key holding the wrong kind of value ({key} is a {})",
            found.type_name()
        ),
    )
}

/// Glob match supporting `*`, `?` and `\` escapes.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(pattern: &[char], text: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('*', rest)) => (0..=text.len()).any(|skip| matches(rest, &text[skip..])),
            Some(('?', rest)) => !text.is_empty() && matches(rest, &text[1..]),
            Some(('\\', rest)) if !rest.is_empty() => {
                text.first() == rest.first() && matches(&rest[1..], &text[1..])
            }
            Some((c, rest)) => text.first() == Some(c) && matches(rest, &text[1..]),
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches(&pattern, &text)
}

impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.live(key);
        match inner.entries.get(key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(other) => Err(wrong_type("GET", key, other)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.live(key);
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.live(key);
        Ok(self.remove_key(&mut inner, key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live(key).entries.contains_key(key))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.live(key);
        match inner.entries.get(key).map(|entry| &entry.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(other) => Err(wrong_type("HGETALL", key, other)),
        }
    }

    async fn hash_put_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut inner = self.live(key);
        let entry = inner.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(existing) => {
                existing.extend(fields.iter().cloned());
                Ok(())
            }
            other => Err(wrong_type("HSET", key, other)),
        }
    }

    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        let mut inner = self.live(key);
        match inner.entries.get_mut(key).map(|entry| &mut entry.value) {
            None => return Ok(()),
            Some(Value::Hash(existing)) => {
                for field in fields {
                    existing.remove(field);
                }
            }
            Some(other) => return Err(wrong_type("HDEL", key, other)),
        }
        self.drop_if_empty(&mut inner, key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.live(key);
        let entry = inner.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            other => Err(wrong_type("SADD", key, other)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.live(key);
        match inner.entries.get_mut(key).map(|entry| &mut entry.value) {
            None => return Ok(()),
            Some(Value::Set(members)) => {
                members.remove(member);
            }
            Some(other) => return Err(wrong_type("SREM", key, other)),
        }
        self.drop_if_empty(&mut inner, key);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.live(key);
        match inner.entries.get(key).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(other) => Err(wrong_type("SMEMBERS", key, other)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        // Reap both ends first so an elapsed destination is not resurrected.
        drop(self.live(to));
        let mut inner = self.live(from);
        let entry = inner.entries.remove(from).ok_or_else(|| StoreError::NoSuchKey {
            key: from.to_string(),
        })?;
        inner.entries.insert(to.to_string(), entry);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(self.set_expiry(key, at))
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.set_expiry(key, at))
    }

    async fn persist(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.live(key);
        Ok(inner
            .entries
            .get_mut(key)
            .and_then(|entry| entry.expires_at.take())
            .is_some())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.lock().deliver(channel, payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
        patterns: &[String],
    ) -> Result<MessageStream, StoreError> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if inner.refuse_subscriptions {
            return Err(StoreError::SubscriptionFailed {
                channels: channels.iter().chain(patterns).cloned().collect(),
                reason: "connection refused".to_string(),
            });
        }
        inner.subscribers.push(Subscriber {
            channels: channels.to_vec(),
            patterns: patterns.to_vec(),
            sender,
        });
        drop(inner);

        Ok(Box::pin(stream! {
            while let Some(message) = receiver.recv().await {
                yield message;
            }
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mocks::ManualClock;
    use futures::StreamExt;

    fn store() -> (InMemoryKeyValueStore, ManualClock) {
        let clock = ManualClock::default();
        (InMemoryKeyValueStore::new(clock.shared()), clock)
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("app:event:0:created:*", "app:event:0:created:abc"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("a\\*", "a*"));
        assert!(!glob_match("a\\*", "ab"));
        assert!(!glob_match("app:*", "other:x"));
    }

    #[tokio::test]
    async fn test_set_clears_ttl() {
        let (store, _clock) = store();
        store.set("k", "v").await.unwrap();
        store.expire("k", Duration::seconds(5)).await.unwrap();
        assert_eq!(store.ttl("k"), Some(Duration::seconds(5)));

        store.set("k", "w").await.unwrap();
        assert_eq!(store.ttl("k"), None);
        assert!(store.contains_key("k"));
    }

    #[tokio::test]
    async fn test_lazy_expiry_emits_expired_event() {
        let (store, clock) = store();
        let mut events = store
            .subscribe(&["__keyevent@0__:expired".to_string()], &[])
            .await
            .unwrap();

        store.set("k", "").await.unwrap();
        store.expire("k", Duration::seconds(1)).await.unwrap();
        clock.advance(Duration::seconds(1));

        assert!(!store.exists("k").await.unwrap());
        let message = events.next().await.unwrap().unwrap();
        assert_eq!(message.payload, b"k");
    }

    #[tokio::test]
    async fn test_delete_emits_del_only_for_existing_keys() {
        let (store, _clock) = store();
        let mut events = store
            .subscribe(&[], &["__keyevent@0__:*".to_string()])
            .await
            .unwrap();

        assert!(!store.delete("missing").await.unwrap());
        store.set("k", "").await.unwrap();
        assert!(store.delete("k").await.unwrap());

        let message = events.next().await.unwrap().unwrap();
        assert_eq!(message.channel, "__keyevent@0__:del");
        assert_eq!(message.pattern.as_deref(), Some("__keyevent@0__:*"));
        assert_eq!(message.payload_text(), "k");
    }

    #[tokio::test]
    async fn test_rename_carries_ttl_and_reports_missing_source() {
        let (store, _clock) = store();
        store
            .hash_put_all("a", &[("f".to_string(), "1".to_string())])
            .await
            .unwrap();
        store.expire("a", Duration::seconds(30)).await.unwrap();

        store.rename("a", "b").await.unwrap();
        assert_eq!(store.hash("b").get("f").map(String::as_str), Some("1"));
        assert_eq!(store.ttl("b"), Some(Duration::seconds(30)));

        let err = store.rename("a", "c").await.unwrap_err();
        assert!(err.is_no_such_key());
    }

    #[tokio::test]
    async fn test_empty_aggregates_are_removed() {
        let (store, _clock) = store();
        store.set_add("s", "m").await.unwrap();
        store.set_remove("s", "m").await.unwrap();
        assert!(!store.contains_key("s"));

        store
            .hash_put_all("h", &[("f".to_string(), "1".to_string())])
            .await
            .unwrap();
        store.hash_delete("h", &["f".to_string()]).await.unwrap();
        assert!(!store.contains_key("h"));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let (store, _clock) = store();
        store.set("k", "v").await.unwrap();

        assert!(matches!(
            store.hash_get_all("k").await,
            Err(StoreError::CommandFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_expire_due_keys() {
        let (store, clock) = store();
        store.set("a", "").await.unwrap();
        store.set("b", "").await.unwrap();
        store.expire("a", Duration::seconds(1)).await.unwrap();

        clock.advance(Duration::seconds(2));
        assert_eq!(store.expire_due_keys(), 1);
        assert_eq!(store.keys(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_persist() {
        let (store, _clock) = store();
        store.set("k", "").await.unwrap();
        assert!(!store.persist("k").await.unwrap());

        store.expire("k", Duration::seconds(1)).await.unwrap();
        assert!(store.persist("k").await.unwrap());
        assert_eq!(store.ttl("k"), None);
    }

    #[tokio::test]
    async fn test_close_subscriptions_ends_streams() {
        let (store, _clock) = store();
        let mut messages = store.subscribe(&["c".to_string()], &[]).await.unwrap();
        assert_eq!(store.subscription_count(), 1);

        assert_eq!(store.close_subscriptions(), 1);
        assert!(messages.next().await.is_none());
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_subscription() {
        let (store, _clock) = store();
        store.refuse_subscriptions(true);

        let result = store.subscribe(&["c".to_string()], &[]).await;
        assert!(matches!(result, Err(StoreError::SubscriptionFailed { .. })));

        store.refuse_subscriptions(false);
        assert!(store.subscribe(&["c".to_string()], &[]).await.is_ok());
    }
}
