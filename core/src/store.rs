//! Key-value store abstraction.
//!
//! [`KeyValueStore`] is the narrow capability surface the session repository,
//! expiration policy and event notifier need from the remote engine: plain
//! values, field maps, unordered sets, per-key TTLs, rename, and pub/sub with
//! channel and pattern subscriptions.
//!
//! # Implementations
//!
//! - `RedisKeyValueStore` (session-store-redis) - production store
//! - `InMemoryKeyValueStore` (session-store-testing) - lazy-expiring fake with
//!   key-event notifications
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//!
//! store.set("greeting", "hello").await?;
//! store.expire("greeting", chrono::Duration::seconds(30)).await?;
//!
//! let mut messages = store
//!     .subscribe(&["__keyevent@0__:expired".to_string()], &[])
//!     .await?;
//! while let Some(message) = messages.next().await {
//!     let message = message?;
//!     tracing::info!(channel = %message.channel, "key expired");
//! }
//! ```

use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a [`KeyValueStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Failed to connect to the store
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A command was rejected or failed
    #[error("Command {command} failed: {reason}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// The reason for failure
        reason: String,
    },

    /// A rename source key did not exist
    #[error("No such key: {key}")]
    NoSuchKey {
        /// The missing key
        key: String,
    },

    /// Failed to subscribe to channels or patterns
    #[error("Subscription failed for {channels:?}: {reason}")]
    SubscriptionFailed {
        /// The channels and patterns requested
        channels: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl StoreError {
    /// Returns `true` for the "source key missing" outcome of a rename.
    #[must_use]
    pub const fn is_no_such_key(&self) -> bool {
        matches!(self, Self::NoSuchKey { .. })
    }

    /// Shorthand for [`StoreError::CommandFailed`].
    pub fn command(command: &str, reason: impl std::fmt::Display) -> Self {
        Self::CommandFailed {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    /// Payload as UTF-8 text, lossily decoded.
    #[must_use]
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Stream of messages from a subscription.
pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<ChannelMessage, StoreError>> + Send>>;

/// Capability surface over the remote key-value engine.
///
/// Every method is a single remote command; there is no multi-key atomicity.
/// Implementations must be `Send + Sync` so one store can be shared by the
/// repository, the notifier and the sweeper.
pub trait KeyValueStore: Send + Sync {
    /// Read a plain value.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Write a plain value, clearing any TTL.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete a key. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Returns `true` if the key exists.
    ///
    /// An existence probe on a key whose TTL has elapsed forces the engine to
    /// reap it, which in turn emits its expired key-event.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Read every field of a field map. Missing keys read as empty.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn hash_get_all(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<HashMap<String, String>, StoreError>> + Send;

    /// Write fields of a field map, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn hash_put_all(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove fields from a field map.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn hash_delete(
        &self,
        key: &str,
        fields: &[String],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Add a member to a set.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn set_add(&self, key: &str, member: &str)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove a member from a set.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn set_remove(
        &self,
        key: &str,
        member: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// All members of a set. Missing keys read as empty.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn set_members(&self, key: &str) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Rename a key, carrying its TTL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoSuchKey`] if `from` does not exist, or another
    /// [`StoreError`] if the command fails.
    fn rename(&self, from: &str, to: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Set a relative TTL. Returns `true` if the key exists.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn expire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Set an absolute expiry. Returns `true` if the key exists.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn expire_at(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Clear any TTL. Returns `true` if a TTL was removed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn persist(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Publish a payload on a channel.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the command fails.
    fn publish(
        &self,
        channel: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Subscribe to exact channels and glob patterns.
    ///
    /// The subscription is live once this resolves; the stream ends when the
    /// connection drops.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SubscriptionFailed`] if the subscription cannot be
    /// established.
    fn subscribe(
        &self,
        channels: &[String],
        patterns: &[String],
    ) -> impl Future<Output = Result<MessageStream, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_such_key_detection() {
        let err = StoreError::NoSuchKey { key: "k".into() };
        assert!(err.is_no_such_key());
        assert!(!StoreError::command("RENAME", "boom").is_no_such_key());
    }

    #[test]
    fn test_payload_text() {
        let message = ChannelMessage {
            channel: "__keyevent@0__:del".into(),
            pattern: None,
            payload: b"spring:session:sessions:expires:abc".to_vec(),
        };
        assert_eq!(message.payload_text(), "spring:session:sessions:expires:abc");
    }
}
