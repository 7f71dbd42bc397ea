use std::collections::HashMap;

// State scope prefixes
pub const KEY_PREFIX_APP: &str = "app:";
pub const KEY_PREFIX_USER: &str = "user:";
pub const KEY_PREFIX_TEMP: &str = "temp:";

/// State values are opaque byte blobs; interpretation is left to callers.
pub type StateMap = HashMap<String, Vec<u8>>;

/// Split a raw delta into the three storage scopes.
///
/// `app:`/`user:` keys are routed to their scope with the prefix stripped;
/// `temp:` keys never cross into durable state and are dropped; everything
/// else belongs to the session scope.
pub fn split_state_delta(delta: &StateMap) -> (StateMap, StateMap, StateMap) {
    let mut app_delta = StateMap::new();
    let mut user_delta = StateMap::new();
    let mut session_delta = StateMap::new();

    for (key, value) in delta {
        if let Some(clean_key) = key.strip_prefix(KEY_PREFIX_APP) {
            app_delta.insert(clean_key.to_string(), value.clone());
        } else if let Some(clean_key) = key.strip_prefix(KEY_PREFIX_USER) {
            user_delta.insert(clean_key.to_string(), value.clone());
        } else if !key.starts_with(KEY_PREFIX_TEMP) {
            session_delta.insert(key.clone(), value.clone());
        }
    }

    (app_delta, user_delta, session_delta)
}

/// Union the three scopes into a single read view, reapplying prefixes.
/// Session-scope keys win only where a prefixed key would collide, which
/// the disjoint namespaces rule out.
pub fn merge_scoped_states(app: &StateMap, user: &StateMap, session: &StateMap) -> StateMap {
    let mut merged = session.clone();
    for (k, v) in app {
        merged.insert(format!("{}{}", KEY_PREFIX_APP, k), v.clone());
    }
    for (k, v) in user {
        merged.insert(format!("{}{}", KEY_PREFIX_USER, k), v.clone());
    }
    merged
}

/// Reapply a scope prefix to every key, for the list read paths.
pub fn with_prefix(state: &StateMap, prefix: &str) -> StateMap {
    state.iter().map(|(k, v)| (format!("{prefix}{k}"), v.clone())).collect()
}
