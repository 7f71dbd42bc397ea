use crate::event::{self, Event};
use crate::key::SessionKey;
use crate::service::SessionOptions;
use crate::state::StateMap;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// A compressed textual rendition of part of a session's history.
///
/// `updated_at` is the latest event timestamp incorporated into the text;
/// publication never moves it backward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(with = "rfc3339_micros")]
    pub updated_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(summary: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self { summary: summary.into(), topics: Vec::new(), updated_at }
    }
}

/// RFC3339 with fixed microsecond precision and a trailing `Z`, so that
/// equal instants always share one encoding and string comparison agrees
/// with timestamp comparison.
pub mod rfc3339_micros {
    use super::*;
    use serde::{Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw: String = serde::Deserialize::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

struct Live {
    events: Vec<Event>,
    state: StateMap,
    updated_at: DateTime<Utc>,
}

/// The session aggregate: identity, ordered events, merged state view,
/// and per-filter summaries.
///
/// Two internal locks partition access: the event list (with state and
/// `updated_at`) rides one, the summaries map the other, so summary
/// publication never contends with appends. All accessors copy out under
/// a brief lock hold; returned values are owned by the caller.
pub struct Session {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
    live: RwLock<Live>,
    summaries: RwLock<HashMap<String, Summary>>,
}

impl Session {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        id: impl Into<String>,
        state: StateMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            id: id.into(),
            created_at: now,
            live: RwLock::new(Live { events: Vec::new(), state, updated_at: now }),
            summaries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn from_parts(
        key: &SessionKey,
        state: StateMap,
        events: Vec<Event>,
        summaries: HashMap<String, Summary>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            app_name: key.app_name.clone(),
            user_id: key.user_id.clone(),
            id: key.session_id.clone(),
            created_at,
            live: RwLock::new(Live { events, state, updated_at }),
            summaries: RwLock::new(summaries),
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, &self.id)
    }

    pub fn events(&self) -> Vec<Event> {
        self.live.read().expect("event lock poisoned").events.clone()
    }

    pub fn event_count(&self) -> usize {
        self.live.read().expect("event lock poisoned").events.len()
    }

    pub fn state(&self) -> StateMap {
        self.live.read().expect("event lock poisoned").state.clone()
    }

    pub fn state_value(&self, key: &str) -> Option<Vec<u8>> {
        self.live.read().expect("event lock poisoned").state.get(key).cloned()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.live.read().expect("event lock poisoned").updated_at
    }

    pub fn summaries(&self) -> HashMap<String, Summary> {
        self.summaries.read().expect("summary lock poisoned").clone()
    }

    pub fn summary(&self, filter_key: &str) -> Option<Summary> {
        self.summaries.read().expect("summary lock poisoned").get(filter_key).cloned()
    }

    /// Local half of `AppendEvent`: append when durable, re-trim, keep the
    /// user anchor, touch `updated_at`, and merge the full delta into the
    /// view state (including `temp:` keys, which stay runtime-visible but
    /// are never persisted).
    pub(crate) fn update_with_event(&self, ev: &Event, options: &SessionOptions) {
        let mut live = self.live.write().expect("event lock poisoned");
        if ev.is_valid_for_persistence() {
            live.events.push(ev.clone());
        }
        event::apply_window(&mut live.events, options);
        event::sanitize_user_anchor(&mut live.events);
        live.updated_at = Utc::now();
        for (k, v) in &ev.state_delta {
            live.state.insert(k.clone(), v.clone());
        }
    }

    /// Stored-side append: push the durable event (when present), evict
    /// oldest past the cap, merge the session-scope delta, touch
    /// `updated_at`.
    pub(crate) fn apply_persisted_event(
        &self,
        ev: Option<&Event>,
        session_delta: &StateMap,
        event_limit: Option<usize>,
    ) {
        let mut live = self.live.write().expect("event lock poisoned");
        if let Some(ev) = ev {
            live.events.push(ev.clone());
            if let Some(limit) = event_limit {
                if limit > 0 && live.events.len() > limit {
                    let excess = live.events.len() - limit;
                    live.events.drain(..excess);
                }
            }
        }
        for (k, v) in session_delta {
            live.state.insert(k.clone(), v.clone());
        }
        live.updated_at = Utc::now();
    }

    /// Overlay app- and user-scope state into this session's view with
    /// prefixes reapplied. Used by the read paths after copying.
    pub(crate) fn overlay_scopes(&self, app_state: &StateMap, user_state: &StateMap) {
        let mut live = self.live.write().expect("event lock poisoned");
        for (k, v) in app_state {
            live.state.insert(format!("{}{}", crate::state::KEY_PREFIX_APP, k), v.clone());
        }
        for (k, v) in user_state {
            live.state.insert(format!("{}{}", crate::state::KEY_PREFIX_USER, k), v.clone());
        }
    }

    /// Deep copy with the read window applied: count, time, then the
    /// user-anchor rule — in that order, so honoring the count limit never
    /// drops the anchor from the visible window.
    pub(crate) fn snapshot_with(&self, options: &SessionOptions) -> Session {
        let (mut events, state, updated_at) = {
            let live = self.live.read().expect("event lock poisoned");
            (live.events.clone(), live.state.clone(), live.updated_at)
        };
        event::apply_window(&mut events, options);
        event::sanitize_user_anchor(&mut events);

        Session {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            id: self.id.clone(),
            created_at: self.created_at,
            live: RwLock::new(Live { events, state, updated_at }),
            summaries: RwLock::new(self.summaries()),
        }
    }

    /// Set-if-newer upsert: the incoming summary wins unless the stored
    /// one carries a strictly later `updated_at`. Returns whether the
    /// entry was written.
    pub fn apply_summary_if_newer(&self, filter_key: &str, summary: Summary) -> bool {
        let mut summaries = self.summaries.write().expect("summary lock poisoned");
        if let Some(existing) = summaries.get(filter_key) {
            if existing.updated_at > summary.updated_at {
                return false;
            }
        }
        summaries.insert(filter_key.to_string(), summary);
        true
    }
}

impl Clone for Session {
    fn clone(&self) -> Self {
        let (events, state, updated_at) = {
            let live = self.live.read().expect("event lock poisoned");
            (live.events.clone(), live.state.clone(), live.updated_at)
        };
        Session {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            id: self.id.clone(),
            created_at: self.created_at,
            live: RwLock::new(Live { events, state, updated_at }),
            summaries: RwLock::new(self.summaries()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("app_name", &self.app_name)
            .field("user_id", &self.user_id)
            .field("id", &self.id)
            .field("events", &self.event_count())
            .field("updated_at", &self.updated_at())
            .finish()
    }
}
