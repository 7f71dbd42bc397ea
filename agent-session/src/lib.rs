//! # agent-session
//!
//! Durable session and state storage for LLM-agent runtimes.
//!
//! ## Overview
//!
//! This crate records the turn-by-turn history of conversations and the
//! auxiliary state around them:
//!
//! - [`InMemorySessionService`] - In-process session storage with TTLs and
//!   a background janitor
//! - [`RedisSessionService`] - Remote storage on hashes and sorted sets
//!   (feature `redis`)
//! - [`Session`] - Conversation session with events, state, and summaries
//! - [`SessionService`] - Trait both backends implement
//! - [`Summarizer`] - Seam for the model driver used by summarization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_session::{InMemorySessionService, SessionKey, SessionOptions, SessionService};
//!
//! # async fn demo() -> agent_session::Result<()> {
//! let service = InMemorySessionService::new();
//! let session = service
//!     .create_session(
//!         SessionKey::new("assistant", "u-1", ""),
//!         Default::default(),
//!         &SessionOptions::new(),
//!     )
//!     .await?;
//! # let _ = session;
//! # Ok(())
//! # }
//! ```
//!
//! ## State Prefixes
//!
//! State keys are partitioned into scopes by prefix:
//!
//! | Prefix | Constant | Scope |
//! |--------|----------|-------|
//! | `app:` | [`KEY_PREFIX_APP`] | Shared across an app |
//! | `user:` | [`KEY_PREFIX_USER`] | Shared across a user's sessions |
//! | `temp:` | [`KEY_PREFIX_TEMP`] | Runtime-only, never persisted |
//!
//! Unprefixed keys belong to the session itself. Reads return the three
//! scopes merged into one map with the prefixes reapplied.

pub mod error;
pub mod event;
pub mod inmemory;
pub mod key;
pub mod service;
pub mod session;
pub mod state;
pub mod summary;
mod worker;

#[cfg(feature = "redis")]
pub mod redis;

pub use error::{Result, SessionError};
pub use event::{Choice, Event, Message, Response, Role, Usage};
pub use inmemory::{InMemorySessionService, InMemorySessionServiceBuilder};
pub use key::{SessionKey, UserKey};
pub use service::{SessionOptions, SessionService};
pub use session::{Session, Summary};
pub use state::{KEY_PREFIX_APP, KEY_PREFIX_TEMP, KEY_PREFIX_USER, StateMap};
pub use summary::Summarizer;

#[cfg(feature = "redis")]
pub use redis::{RedisSessionService, RedisSessionServiceBuilder, register_redis_instance};
