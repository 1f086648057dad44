//! # Session Store Redis
//!
//! Production [`KeyValueStore`] over Redis.
//!
//! Commands go through a [`ConnectionManager`], which reconnects on its own;
//! every [`subscribe`](KeyValueStore::subscribe) call opens a dedicated
//! pub/sub connection that lives as long as the returned stream.
//!
//! # Example
//!
//! ```no_run
//! use session_store_redis::RedisKeyValueStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisKeyValueStore::new("redis://127.0.0.1:6379").await?;
//! store.enable_keyspace_notifications().await?;
//! # Ok(())
//! # }
//! ```

use async_stream::stream;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError};
use session_store_core::{ChannelMessage, KeyValueStore, MessageStream, StoreError};
use std::collections::HashMap;

/// Server setting holding the keyspace notification flags.
pub const NOTIFY_KEYSPACE_EVENTS: &str = "notify-keyspace-events";

/// Redis-backed [`KeyValueStore`].
#[derive(Clone)]
pub struct RedisKeyValueStore {
    /// Client used to open pub/sub connections.
    client: Client,
    /// Connection manager for commands.
    conn_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyValueStore")
            .field("connection", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisKeyValueStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379/0")
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionFailed`] if the URL is invalid or the
    /// server is unreachable.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            StoreError::ConnectionFailed(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            StoreError::ConnectionFailed(format!(
                "Failed to create Redis connection manager: {e}"
            ))
        })?;

        tracing::info!(
            addr = ?client.get_connection_info().addr,
            "Connected to Redis"
        );
        Ok(Self {
            client,
            conn_manager,
        })
    }

    /// Logical database selected by the connection URL.
    #[must_use]
    pub fn database(&self) -> i64 {
        self.client.get_connection_info().redis.db
    }

    /// Make sure the server emits generic and expired key-event notifications.
    ///
    /// Existing flags are kept; only missing ones are added. Managed Redis
    /// offerings often disable `CONFIG`, in which case the flags have to be
    /// set out of band.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CommandFailed`] if `CONFIG GET`/`CONFIG SET` is
    /// rejected.
    pub async fn enable_keyspace_notifications(&self) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();

        let reply: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg(NOTIFY_KEYSPACE_EVENTS)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("CONFIG GET", &e))?;
        let current = reply.get(1).cloned().unwrap_or_default();
        let merged = merge_notify_flags(&current);

        if merged == current {
            tracing::debug!(flags = %current, "Keyspace notifications already enabled");
            return Ok(());
        }

        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg(NOTIFY_KEYSPACE_EVENTS)
            .arg(&merged)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_error("CONFIG SET", &e))?;

        tracing::info!(from = %current, to = %merged, "Enabled keyspace notifications");
        Ok(())
    }
}

/// Add the key-event (`E`), generic (`g`) and expired (`x`) classes to
/// `flags`, keeping whatever is already set. `A` covers both classes.
///
/// ```
/// use session_store_redis::merge_notify_flags;
///
/// assert_eq!(merge_notify_flags(""), "Egx");
/// assert_eq!(merge_notify_flags("KA"), "KAE");
/// assert_eq!(merge_notify_flags("Egx"), "Egx");
/// ```
#[must_use]
pub fn merge_notify_flags(flags: &str) -> String {
    let mut merged = flags.to_string();
    if !merged.contains('E') {
        merged.push('E');
    }
    if !merged.contains('A') {
        if !merged.contains('g') {
            merged.push('g');
        }
        if !merged.contains('x') {
            merged.push('x');
        }
    }
    merged
}

fn map_error(command: &str, e: &RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::TransportError(format!("{command}: {e}"))
    } else {
        StoreError::command(command, e)
    }
}

fn is_no_such_key(e: &RedisError) -> bool {
    e.kind() == ErrorKind::ResponseError && e.to_string().contains("no such key")
}

impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.get(key).await.map_err(|e| map_error("GET", &e))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.set(key, value).await.map_err(|e| map_error("SET", &e))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn.del(key).await.map_err(|e| map_error("DEL", &e))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.exists(key).await.map_err(|e| map_error("EXISTS", &e))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.hgetall(key).await.map_err(|e| map_error("HGETALL", &e))
    }

    async fn hash_put_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn_manager.clone();
        conn.hset_multiple(key, fields)
            .await
            .map_err(|e| map_error("HSET", &e))
    }

    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn_manager.clone();
        conn.hdel(key, fields)
            .await
            .map_err(|e| map_error("HDEL", &e))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.sadd(key, member)
            .await
            .map_err(|e| map_error("SADD", &e))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.srem(key, member)
            .await
            .map_err(|e| map_error("SREM", &e))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.smembers(key)
            .await
            .map_err(|e| map_error("SMEMBERS", &e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.rename(from, to).await.map_err(|e| {
            if is_no_such_key(&e) {
                StoreError::NoSuchKey {
                    key: from.to_string(),
                }
            } else {
                map_error("RENAME", &e)
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.pexpire(key, ttl.num_milliseconds())
            .await
            .map_err(|e| map_error("PEXPIRE", &e))
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.pexpire_at(key, at.timestamp_millis())
            .await
            .map_err(|e| map_error("PEXPIREAT", &e))
    }

    async fn persist(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.persist(key)
            .await
            .map_err(|e| map_error("PERSIST", &e))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| map_error("PUBLISH", &e))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
        patterns: &[String],
    ) -> Result<MessageStream, StoreError> {
        let requested: Vec<String> = channels.iter().chain(patterns).cloned().collect();
        let failed = |e: RedisError| StoreError::SubscriptionFailed {
            channels: requested.clone(),
            reason: e.to_string(),
        };

        let mut pubsub = self.client.get_async_pubsub().await.map_err(&failed)?;
        for channel in channels {
            pubsub.subscribe(channel).await.map_err(&failed)?;
        }
        for pattern in patterns {
            pubsub.psubscribe(pattern).await.map_err(&failed)?;
        }
        tracing::debug!(?requested, "Redis subscription established");

        let messages = stream! {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let pattern = if msg.from_pattern() {
                    msg.get_pattern::<String>().ok()
                } else {
                    None
                };
                yield Ok(ChannelMessage {
                    channel: msg.get_channel_name().to_string(),
                    pattern,
                    payload: msg.get_payload_bytes().to_vec(),
                });
            }
            tracing::debug!("Redis subscription closed");
        };
        Ok(Box::pin(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_adds_missing_flags() {
        assert_eq!(merge_notify_flags(""), "Egx");
        assert_eq!(merge_notify_flags("Kx"), "KxEg");
    }

    #[test]
    fn test_merge_keeps_all_classes_alias() {
        assert_eq!(merge_notify_flags("AE"), "AE");
        assert_eq!(merge_notify_flags("AK"), "AKE");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let once = merge_notify_flags("Kl");
        assert_eq!(merge_notify_flags(&once), once);
    }

    #[test]
    fn test_transport_errors_are_classified() {
        let io: RedisError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(map_error("GET", &io), StoreError::TransportError(_)));

        let response: RedisError = (ErrorKind::ResponseError, "ERR", "no such key".to_string()).into();
        assert!(is_no_such_key(&response));
        assert!(matches!(
            map_error("RENAME", &response),
            StoreError::CommandFailed { .. }
        ));
    }
}
