use crate::error::Result;
use crate::event::Event;
use crate::key::{SessionKey, UserKey};
use crate::session::Session;
use crate::state::StateMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Read-window options recognized by every read path, and by
/// `append_event` when re-trimming the caller's local aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionOptions {
    /// Retain only the last N events. Zero (or unset) means no limit.
    pub event_num: Option<usize>,
    /// Retain only events whose timestamp is >= this instant. Applied
    /// after the count limit.
    pub event_time: Option<DateTime<Utc>>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_num(mut self, n: usize) -> Self {
        self.event_num = Some(n);
        self
    }

    pub fn with_event_time(mut self, t: DateTime<Utc>) -> Self {
        self.event_time = Some(t);
        self
    }
}

/// The session storage contract.
///
/// Both backends implement the same invariants: returned event windows
/// begin with a user-role event or are empty, only durable events reach
/// the stored list, state scopes stay disjoint, and summary publication
/// is monotonic in `updated_at`.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Create a session. An empty `session_id` in the key gets a freshly
    /// generated id. The returned view carries the merged three-scope
    /// state.
    async fn create_session(
        &self,
        key: SessionKey,
        state: StateMap,
        options: &SessionOptions,
    ) -> Result<Arc<Session>>;

    /// Fetch one session. Absent (or expired) sessions are `Ok(None)`.
    async fn get_session(
        &self,
        key: &SessionKey,
        options: &SessionOptions,
    ) -> Result<Option<Arc<Session>>>;

    /// All live sessions belonging to a user, each shaped by `options`.
    async fn list_sessions(
        &self,
        key: &UserKey,
        options: &SessionOptions,
    ) -> Result<Vec<Arc<Session>>>;

    /// Remove a session. Deleting an absent session is a silent no-op.
    async fn delete_session(&self, key: &SessionKey) -> Result<()>;

    async fn update_app_state(&self, app_name: &str, delta: StateMap) -> Result<()>;

    async fn delete_app_state(&self, app_name: &str, key: &str) -> Result<()>;

    async fn list_app_states(&self, app_name: &str) -> Result<StateMap>;

    /// Merge a delta into user-scope state. Keys carrying the `app:` or
    /// `temp:` prefix are rejected.
    async fn update_user_state(&self, key: &UserKey, delta: StateMap) -> Result<()>;

    async fn delete_user_state(&self, key: &UserKey, state_key: &str) -> Result<()>;

    async fn list_user_states(&self, key: &UserKey) -> Result<StateMap>;

    /// Record one turn: updates the caller's aggregate in place, then
    /// persists the event (inline, or via the sharded persister pool when
    /// the backend runs in async-persist mode).
    async fn append_event(
        &self,
        session: &Session,
        event: Event,
        options: &SessionOptions,
    ) -> Result<()>;

    /// Synchronously (re)generate the summary for one filter key.
    async fn create_session_summary(
        &self,
        session: &Session,
        filter_key: &str,
        force: bool,
    ) -> Result<()>;

    /// Hand a summary job to the worker pool. Falls back to synchronous
    /// generation when the queue is full or closed; a no-op when no
    /// summarizer is configured.
    async fn enqueue_summary_job(
        &self,
        session: &Arc<Session>,
        filter_key: &str,
        force: bool,
    ) -> Result<()>;

    /// Stored summary text for a session: the full-session summary when
    /// present, otherwise the most recently updated branch summary.
    async fn get_session_summary_text(&self, session: &Session) -> Option<String>;

    /// Stop background workers and the janitor. Queued jobs drain first.
    async fn close(&self) -> Result<()>;
}
