//! Session id generation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default prefix of [`PrefixedRandomIdGenerator`] ids.
pub const DEFAULT_ID_PREFIX: &str = "TGC-";

/// Default number of random bytes in a [`PrefixedRandomIdGenerator`] id.
pub const DEFAULT_RANDOM_LENGTH: usize = 64;

/// Produces new session ids.
///
/// Ids must be unique with overwhelming probability and must not contain the
/// `:` separator, since the session id is recovered as the last
/// `:`-separated segment of key and channel names.
pub trait SessionIdGenerator: Send + Sync {
    /// Generate a fresh id.
    fn generate(&self) -> String;
}

/// Random UUID v4 ids in canonical hyphenated form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidSessionIdGenerator;

impl SessionIdGenerator for UuidSessionIdGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// `<prefix><base64(random bytes)>` ids drawn from the OS CSPRNG.
///
/// # Examples
///
/// ```
/// use session_store_core::{PrefixedRandomIdGenerator, SessionIdGenerator};
///
/// let generator = PrefixedRandomIdGenerator::default().with_random_length(16);
/// let id = generator.generate();
/// assert!(id.starts_with("TGC-"));
/// assert_eq!(id.len(), "TGC-".len() + 24);
/// ```
#[derive(Debug, Clone)]
pub struct PrefixedRandomIdGenerator {
    prefix: String,
    random_length: usize,
}

impl PrefixedRandomIdGenerator {
    /// Generator with a custom prefix and the default random length.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            random_length: DEFAULT_RANDOM_LENGTH,
        }
    }

    /// Set the number of random bytes. Zero is ignored.
    #[must_use]
    pub const fn with_random_length(mut self, random_length: usize) -> Self {
        if random_length > 0 {
            self.random_length = random_length;
        }
        self
    }

    /// Configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Configured number of random bytes.
    #[must_use]
    pub const fn random_length(&self) -> usize {
        self.random_length
    }
}

impl Default for PrefixedRandomIdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_PREFIX)
    }
}

impl SessionIdGenerator for PrefixedRandomIdGenerator {
    fn generate(&self) -> String {
        let mut bytes = vec![0u8; self.random_length];
        OsRng.fill_bytes(&mut bytes);
        format!("{}{}", self.prefix, STANDARD.encode(bytes))
    }
}

/// Configurable choice of id generator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum IdStrategy {
    /// [`UuidSessionIdGenerator`]
    #[default]
    Uuid,
    /// [`PrefixedRandomIdGenerator`]
    PrefixedRandom {
        /// Id prefix
        prefix: String,
        /// Number of random bytes
        random_length: usize,
    },
}

impl IdStrategy {
    /// Instantiate the generator.
    #[must_use]
    pub fn build(&self) -> Arc<dyn SessionIdGenerator> {
        match self {
            Self::Uuid => Arc::new(UuidSessionIdGenerator),
            Self::PrefixedRandom {
                prefix,
                random_length,
            } => Arc::new(
                PrefixedRandomIdGenerator::new(prefix.clone()).with_random_length(*random_length),
            ),
        }
    }
}
