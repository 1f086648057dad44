//! Time-bucketed expiration bookkeeping.
//!
//! The store's own TTL reaper is probabilistic: a key whose TTL has elapsed
//! but that nobody reads may linger, and its expired notification with it.
//! To make eviction deterministic every session with a positive TTL is also
//! tracked in a per-minute bucket:
//!
//! ```text
//! SADD   <ns>:expirations:1439245080000 expires:<id>
//! EXPIRE <ns>:expirations:1439245080000 <interval + 300>
//! ```
//!
//! Once a minute the sweep reads the bucket for the minute that just started
//! and probes each member's expiration-tracking key. Probing (rather than
//! deleting) makes the store reap the key only if its TTL is really due, which
//! fires the expired notification the [`EventNotifier`](crate::EventNotifier)
//! turns into a domain event.
//!
//! Each session owns three keys with different lifetimes:
//!
//! | Key | TTL |
//! |---|---|
//! | expiration-tracking key | interval |
//! | session record | interval + 5 minutes |
//! | bucket | interval + 5 minutes |
//!
//! The record outlives the tracking key so the notifier can still load it
//! when the tracking key's expiry is reported.

use chrono::{DateTime, Duration, Utc};
use session_store_core::keys::{EXPIRES_MARKER_PREFIX, KeyResolver};
use session_store_core::{KeyValueStore, Session, StoreError};
use std::sync::Arc;

/// Grace added to the record and bucket TTLs.
pub const EXPIRATION_GRACE_SECONDS: i64 = 5 * 60;

const MINUTE_MILLIS: i64 = 60_000;

/// Effective expiry of `session` in epoch millis (last access + interval).
#[must_use]
pub fn expires_in_millis(session: &Session) -> i64 {
    session
        .last_accessed_time()
        .timestamp_millis()
        .saturating_add(session.max_inactive_interval_seconds().saturating_mul(1000))
}

/// The next whole minute strictly after the minute containing `millis`.
///
/// An instant already on a minute boundary still moves to the next minute.
///
/// ```
/// use session_store_runtime::expiration::round_up_to_next_minute;
///
/// assert_eq!(round_up_to_next_minute(60_000), 120_000);
/// assert_eq!(round_up_to_next_minute(60_001), 120_000);
/// ```
#[must_use]
pub const fn round_up_to_next_minute(millis: i64) -> i64 {
    round_down_minute(millis).saturating_add(MINUTE_MILLIS)
}

/// The whole minute containing `millis`.
#[must_use]
pub const fn round_down_minute(millis: i64) -> i64 {
    millis - millis.rem_euclid(MINUTE_MILLIS)
}

/// Bucket member naming a session.
#[must_use]
pub fn marker(session_id: &str) -> String {
    format!("{EXPIRES_MARKER_PREFIX}{session_id}")
}

/// Maintains expiration buckets and per-session TTLs.
pub struct ExpirationPolicy<S> {
    store: Arc<S>,
    keys: Arc<dyn KeyResolver>,
}

impl<S> Clone for ExpirationPolicy<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: Arc::clone(&self.keys),
        }
    }
}

impl<S: KeyValueStore> ExpirationPolicy<S> {
    /// Policy over `store`, naming keys through `keys`.
    #[must_use]
    pub fn new(store: Arc<S>, keys: Arc<dyn KeyResolver>) -> Self {
        Self { store, keys }
    }

    /// Remove the session's marker from the bucket of its current expiry.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store rejects the removal.
    pub async fn on_delete(&self, session: &Session) -> Result<(), StoreError> {
        self.remove_marker(session.id(), expires_in_millis(session))
            .await
    }

    /// Remove `session_id`'s marker from the bucket `expiry_millis` falls in.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store rejects the removal.
    pub async fn remove_marker(
        &self,
        session_id: &str,
        expiry_millis: i64,
    ) -> Result<(), StoreError> {
        let bucket = round_up_to_next_minute(expiry_millis);
        self.store
            .set_remove(&self.keys.expirations_key(bucket), &marker(session_id))
            .await
    }

    /// Re-file the session after a persist.
    ///
    /// `original_expiry_millis` is the effective expiry the session was last
    /// filed under, if any; its bucket is vacated when it differs from the new
    /// one.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if any store command fails. Earlier commands
    /// are not rolled back.
    pub async fn on_expiration_updated(
        &self,
        original_expiry_millis: Option<i64>,
        session: &Session,
    ) -> Result<(), StoreError> {
        let member = marker(session.id());
        let bucket = round_up_to_next_minute(expires_in_millis(session));

        if let Some(original) = original_expiry_millis {
            let original_bucket = round_up_to_next_minute(original);
            if original_bucket != bucket {
                self.store
                    .set_remove(&self.keys.expirations_key(original_bucket), &member)
                    .await?;
            }
        }

        let interval = session.max_inactive_interval_seconds();
        let tracking_key = self.keys.session_key(&member);
        let record_key = self.keys.session_key(session.id());

        if interval < 0 {
            self.store.set(&tracking_key, "").await?;
            self.store.persist(&record_key).await?;
            tracing::debug!(session_id = %session.id(), "Session never expires");
            return Ok(());
        }

        let ttl = session.max_inactive_interval();
        let grace = ttl
            .checked_add(&Duration::seconds(EXPIRATION_GRACE_SECONDS))
            .unwrap_or(Duration::MAX);

        if interval == 0 {
            self.store.delete(&tracking_key).await?;
            self.store.expire(&record_key, grace).await?;
            tracing::debug!(session_id = %session.id(), "Session expired immediately");
            return Ok(());
        }

        let bucket_key = self.keys.expirations_key(bucket);
        self.store.set_add(&bucket_key, &member).await?;
        self.store.expire(&bucket_key, grace).await?;

        self.store.set(&tracking_key, "").await?;
        self.store
            .expire(&tracking_key, ttl)
            .await?;
        self.store.expire(&record_key, grace).await?;

        tracing::debug!(
            session_id = %session.id(),
            bucket = %bucket_key,
            ttl_seconds = interval,
            "Session expiration updated"
        );
        Ok(())
    }

    /// Probe every tracking key filed in the bucket for the minute containing
    /// `now`, then drop the bucket. Returns the number of keys probed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the bucket cannot be read or dropped, or a
    /// probe fails. Probes already made are not undone.
    pub async fn clean_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let minute = round_down_minute(now.timestamp_millis());
        let bucket_key = self.keys.expirations_key(minute);

        tracing::debug!(bucket = %bucket_key, "Cleaning up sessions expiring this minute");

        let members = self.store.set_members(&bucket_key).await?;
        self.store.delete(&bucket_key).await?;

        for member in &members {
            self.store.exists(&self.keys.session_key(member)).await?;
        }
        Ok(members.len())
    }
}
