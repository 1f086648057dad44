//! # Session Store Core
//!
//! Core traits and types for a distributed, TTL-aware session store built on a
//! remote key-value engine.
//!
//! This crate holds everything that does not depend on a concrete store:
//!
//! - **Session**: the materialized session value ([`Session`])
//! - **Record**: the field-map layout of a persisted session and the pending
//!   [`Delta`] of field writes ([`record`])
//! - **Keys**: the namespaced key and channel layout ([`SessionKeys`])
//! - **Store**: the capability surface over the remote engine ([`KeyValueStore`])
//! - **Identifiers**: pluggable session id generation ([`SessionIdGenerator`])
//! - **Principal**: resolution of the authenticated principal of a session
//! - **Events**: typed lifecycle events and their publishers ([`SessionEvent`])
//! - **Configuration**: repository, expiry and sweep settings ([`SessionConfig`])
//!
//! ## Key Layout
//!
//! ```text
//! <ns>:sessions:<id>                  field map (the session record)
//! <ns>:sessions:expires:<id>          empty value carrying the session TTL
//! <ns>:expirations:<epoch-millis>     set of `expires:<id>` markers (per minute)
//! <ns>:index:principal_name:<name>    set of session ids for a principal
//! <ns>:event:<db>:created:<id>        channel announcing a new session
//! ```
//!
//! The runtime crate orchestrates these pieces; the redis crate provides the
//! production [`KeyValueStore`].

pub mod config;
pub mod environment;
pub mod error;
pub mod event;
pub mod id;
pub mod keys;
pub mod principal;
pub mod record;
pub mod serializer;
pub mod session;
pub mod store;

// Re-export main types for convenience
pub use config::{FlushMode, SaveMode, SessionConfig};
pub use environment::{Clock, SystemClock};
pub use error::{Result, SessionError};
pub use event::{BroadcastEventPublisher, PublishError, SessionEvent, SessionEventPublisher};
pub use id::{IdStrategy, PrefixedRandomIdGenerator, SessionIdGenerator, UuidSessionIdGenerator};
pub use keys::{KeyResolver, SessionKeys};
pub use principal::{DefaultPrincipalNameResolver, PrincipalNameResolver};
pub use record::Delta;
pub use serializer::{BincodePayloadSerializer, JsonPayloadSerializer, PayloadSerializer};
pub use session::Session;
pub use store::{ChannelMessage, KeyValueStore, MessageStream, StoreError};
