//! Repository configuration.
//!
//! Loads configuration from `SESSION_*` environment variables with sensible
//! defaults. Unparsable values fall back to the default; [`SessionConfig::validate`]
//! catches the values that cannot be defaulted.

use crate::error::{Result, SessionError};
use crate::id::{DEFAULT_ID_PREFIX, DEFAULT_RANDOM_LENGTH, IdStrategy};
use crate::keys::DEFAULT_NAMESPACE;
use crate::session::{DEFAULT_MAX_INACTIVE_INTERVAL_SECONDS, MAX_INACTIVE_INTERVAL_SECONDS};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Default sweep schedule: second zero of every minute.
pub const DEFAULT_CLEANUP_CRON: &str = "0 * * * * *";

/// Default store URL.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// When pending changes reach the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushMode {
    /// Only on an explicit save (buffered).
    #[default]
    OnSave,
    /// After every mutation (write-through).
    Immediate,
}

impl FromStr for FlushMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on-save" | "on_save" | "buffered" => Ok(Self::OnSave),
            "immediate" | "write-through" | "write_through" => Ok(Self::Immediate),
            other => Err(SessionError::Configuration(format!(
                "unknown flush mode: {other}"
            ))),
        }
    }
}

/// Which attributes are written on save beyond those explicitly set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveMode {
    /// Only attributes set or removed since the last flush.
    #[default]
    OnSetAttribute,
    /// Also attributes read since the last flush.
    OnGetAttribute,
    /// Every attribute on every save.
    Always,
}

impl FromStr for SaveMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on-set-attribute" | "on_set_attribute" | "never" => Ok(Self::OnSetAttribute),
            "on-get-attribute" | "on_get_attribute" | "on-read" => Ok(Self::OnGetAttribute),
            "always" => Ok(Self::Always),
            other => Err(SessionError::Configuration(format!(
                "unknown save mode: {other}"
            ))),
        }
    }
}

/// Session repository configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Max-inactive-interval of new sessions, in seconds (negative: never expire)
    pub max_inactive_interval_seconds: i64,
    /// Key namespace (a `:` separator is appended)
    pub namespace: String,
    /// Database index, used in notification channel names
    pub database: i64,
    /// When pending changes reach the store
    pub flush_mode: FlushMode,
    /// Which attributes are written on save
    pub save_mode: SaveMode,
    /// Sweep schedule (six-field cron expression, seconds first)
    pub cleanup_cron: String,
    /// Session id generation
    pub id_strategy: IdStrategy,
    /// Merge the required flags into the server's keyspace-notification config on startup
    pub configure_keyspace_notifications: bool,
    /// Store connection URL
    pub redis_url: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_inactive_interval_seconds: DEFAULT_MAX_INACTIVE_INTERVAL_SECONDS,
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: 0,
            flush_mode: FlushMode::default(),
            save_mode: SaveMode::default(),
            cleanup_cron: DEFAULT_CLEANUP_CRON.to_string(),
            id_strategy: IdStrategy::default(),
            configure_keyspace_notifications: true,
            redis_url: DEFAULT_REDIS_URL.to_string(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let id_strategy = match env::var("SESSION_ID_STRATEGY")
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            Ok("prefixed-random" | "prefixed_random" | "tgc") => IdStrategy::PrefixedRandom {
                prefix: env::var("SESSION_ID_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_ID_PREFIX.to_string()),
                random_length: env::var("SESSION_ID_RANDOM_LENGTH")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_RANDOM_LENGTH),
            },
            _ => IdStrategy::Uuid,
        };

        Self {
            max_inactive_interval_seconds: env::var("SESSION_MAX_INACTIVE_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_inactive_interval_seconds),
            namespace: env::var("SESSION_NAMESPACE").unwrap_or(defaults.namespace),
            database: env::var("SESSION_DATABASE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.database),
            flush_mode: env::var("SESSION_FLUSH_MODE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.flush_mode),
            save_mode: env::var("SESSION_SAVE_MODE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.save_mode),
            cleanup_cron: env::var("SESSION_CLEANUP_CRON").unwrap_or(defaults.cleanup_cron),
            id_strategy,
            configure_keyspace_notifications: env::var("SESSION_CONFIGURE_KEYSPACE_NOTIFICATIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.configure_keyspace_notifications),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
        }
    }

    /// Check the values that cannot be defaulted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] for a blank namespace, a
    /// namespace or id prefix containing whitespace, an interval above
    /// [`MAX_INACTIVE_INTERVAL_SECONDS`], or an unparsable cron expression.
    pub fn validate(&self) -> Result<()> {
        if self.max_inactive_interval_seconds > MAX_INACTIVE_INTERVAL_SECONDS {
            return Err(SessionError::Configuration(format!(
                "max inactive interval must be at most {MAX_INACTIVE_INTERVAL_SECONDS} seconds: {}",
                self.max_inactive_interval_seconds
            )));
        }
        if self.namespace.trim().is_empty() {
            return Err(SessionError::Configuration(
                "namespace must not be empty".to_string(),
            ));
        }
        if self.namespace.trim().contains(char::is_whitespace) {
            return Err(SessionError::Configuration(format!(
                "namespace must not contain whitespace: {:?}",
                self.namespace
            )));
        }
        if let IdStrategy::PrefixedRandom { prefix, .. } = &self.id_strategy {
            if prefix.contains(':') {
                return Err(SessionError::Configuration(format!(
                    "id prefix must not contain ':': {prefix:?}"
                )));
            }
        }
        self.cleanup_schedule()?;
        Ok(())
    }

    /// Align `database` with the database the store connection selected.
    ///
    /// Key-event channels are named after the connection's database, so it
    /// always wins. A configured database of 0 (the default) defers to it;
    /// any other value must match.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if a non-default database was
    /// configured and the connection selected a different one.
    pub fn for_connected_database(mut self, connected: i64) -> Result<Self> {
        if self.database != 0 && self.database != connected {
            return Err(SessionError::Configuration(format!(
                "configured database {} does not match the connection's database {connected}",
                self.database
            )));
        }
        self.database = connected;
        Ok(self)
    }

    /// Parsed sweep schedule.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if the cron expression is invalid.
    pub fn cleanup_schedule(&self) -> Result<cron::Schedule> {
        cron::Schedule::from_str(&self.cleanup_cron).map_err(|e| {
            SessionError::Configuration(format!(
                "invalid cleanup cron {:?}: {e}",
                self.cleanup_cron
            ))
        })
    }

    /// Set the default max-inactive-interval (seconds).
    #[must_use]
    pub const fn with_max_inactive_interval_seconds(mut self, seconds: i64) -> Self {
        self.max_inactive_interval_seconds = seconds;
        self
    }

    /// Set the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database index.
    #[must_use]
    pub const fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }

    /// Set the flush mode.
    #[must_use]
    pub const fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    /// Set the save mode.
    #[must_use]
    pub const fn with_save_mode(mut self, save_mode: SaveMode) -> Self {
        self.save_mode = save_mode;
        self
    }

    /// Set the sweep schedule.
    #[must_use]
    pub fn with_cleanup_cron(mut self, cron: impl Into<String>) -> Self {
        self.cleanup_cron = cron.into();
        self
    }

    /// Set the id strategy.
    #[must_use]
    pub fn with_id_strategy(mut self, id_strategy: IdStrategy) -> Self {
        self.id_strategy = id_strategy;
        self
    }

    /// Toggle keyspace-notification bootstrap.
    #[must_use]
    pub const fn with_configure_keyspace_notifications(mut self, enabled: bool) -> Self {
        self.configure_keyspace_notifications = enabled;
        self
    }

    /// Set the store URL.
    #[must_use]
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.max_inactive_interval_seconds, 1800);
        assert_eq!(config.namespace, "spring:session");
        assert_eq!(config.flush_mode, FlushMode::OnSave);
        assert_eq!(config.save_mode, SaveMode::OnSetAttribute);
        assert_eq!(config.id_strategy, IdStrategy::Uuid);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_aliases() {
        assert_eq!("write-through".parse::<FlushMode>().unwrap(), FlushMode::Immediate);
        assert_eq!("Buffered".parse::<FlushMode>().unwrap(), FlushMode::OnSave);
        assert_eq!("never".parse::<SaveMode>().unwrap(), SaveMode::OnSetAttribute);
        assert_eq!("on-read".parse::<SaveMode>().unwrap(), SaveMode::OnGetAttribute);
        assert_eq!("always".parse::<SaveMode>().unwrap(), SaveMode::Always);
        assert!("sometimes".parse::<SaveMode>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let blank = SessionConfig::default().with_namespace("  ");
        assert!(matches!(blank.validate(), Err(SessionError::Configuration(_))));

        let cron = SessionConfig::default().with_cleanup_cron("every minute");
        assert!(matches!(cron.validate(), Err(SessionError::Configuration(_))));

        let prefix = SessionConfig::default().with_id_strategy(IdStrategy::PrefixedRandom {
            prefix: "a:b".into(),
            random_length: 8,
        });
        assert!(matches!(prefix.validate(), Err(SessionError::Configuration(_))));

        let interval = SessionConfig::default()
            .with_max_inactive_interval_seconds(MAX_INACTIVE_INTERVAL_SECONDS + 1);
        assert!(matches!(interval.validate(), Err(SessionError::Configuration(_))));

        let never = SessionConfig::default().with_max_inactive_interval_seconds(i64::MIN);
        assert!(never.validate().is_ok());
    }

    #[test]
    fn test_connected_database_wins() {
        let config = SessionConfig::default().for_connected_database(3).unwrap();
        assert_eq!(config.database, 3);

        let matching = SessionConfig::default()
            .with_database(3)
            .for_connected_database(3)
            .unwrap();
        assert_eq!(matching.database, 3);

        let mismatched = SessionConfig::default()
            .with_database(2)
            .for_connected_database(3);
        assert!(matches!(mismatched, Err(SessionError::Configuration(_))));
    }

    #[test]
    fn test_default_schedule_fires_each_minute() {
        use chrono::{Timelike, Utc};

        let schedule = SessionConfig::default().cleanup_schedule().unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();

        assert_eq!(next.second(), 0);
    }
}
