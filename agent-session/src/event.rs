use crate::service::SessionOptions;
use crate::state::StateMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event represents a single immutable turn within a session.
///
/// Events are append-once: once persisted they are never rewritten. Every
/// event may carry a state delta, which is merged into session state even
/// when the event itself is not durable (partial or empty turns).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    #[serde(default)]
    pub invocation_id: String,
    /// Branch tag partitioning the event stream; empty means the trunk.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter_key: String,
    /// Set on streaming chunks that precede the final turn.
    #[serde(default)]
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub state_delta: StateMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Structured model output attached to an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Message,
    /// Incremental content for streaming chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Token counters reported by the model driver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl Event {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            author: author.into(),
            invocation_id: String::new(),
            filter_key: String::new(),
            partial: false,
            response: None,
            state_delta: StateMap::new(),
            usage: None,
        }
    }

    pub fn with_invocation_id(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = invocation_id.into();
        self
    }

    pub fn with_filter_key(mut self, filter_key: impl Into<String>) -> Self {
        self.filter_key = filter_key.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn with_state_delta(mut self, delta: StateMap) -> Self {
        self.state_delta = delta;
        self
    }

    /// Whether this event belongs on the durable event list: it must carry
    /// a response, must not be a streaming chunk, and at least one choice
    /// must have non-empty message content.
    pub fn is_valid_for_persistence(&self) -> bool {
        if self.partial {
            return false;
        }
        match &self.response {
            Some(response) => response.choices.iter().any(|c| !c.message.content.is_empty()),
            None => false,
        }
    }

    /// Hierarchical branch test: an empty key matches every event; a
    /// non-empty key matches events whose branch equals the key or extends
    /// it with a `/`-separated suffix.
    pub fn matches_filter(&self, filter_key: &str) -> bool {
        if filter_key.is_empty() {
            return true;
        }
        match self.filter_key.strip_prefix(filter_key) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }

    /// Role carried by the first choice, when the event has one.
    pub fn first_choice_role(&self) -> Option<Role> {
        self.response.as_ref()?.choices.first().map(|c| c.message.role)
    }

    /// Content of the first choice, for prompt shaping.
    pub fn content_text(&self) -> Option<&str> {
        self.response.as_ref()?.choices.first().map(|c| c.message.content.as_str())
    }
}

impl Response {
    /// Single-choice response carrying one message.
    pub fn with_message(role: Role, content: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                index: 0,
                message: Message { role, content: content.into() },
                delta: None,
            }],
        }
    }
}

/// Apply the read-window options in order: count limit first, then the
/// time filter on the already-trimmed window. A count of zero means no
/// limit.
pub fn apply_window(events: &mut Vec<Event>, options: &SessionOptions) {
    if let Some(n) = options.event_num {
        if n > 0 && events.len() > n {
            let excess = events.len() - n;
            events.drain(..excess);
        }
    }
    if let Some(t) = options.event_time {
        events.retain(|e| e.timestamp >= t);
    }
}

/// Truncate the window so it begins with a user-role event. Events lacking
/// a response or choices are skipped, not kept as prefixes. No user event
/// means an empty window.
pub fn sanitize_user_anchor(events: &mut Vec<Event>) {
    match events.iter().position(|e| e.first_choice_role() == Some(Role::User)) {
        Some(0) => {}
        Some(idx) => {
            events.drain(..idx);
        }
        None => events.clear(),
    }
}
