use crate::error::Result;
use crate::event::{Event, Response, Role};
use crate::session::{Session, Summary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The seam in front of the LLM model driver. Given a transient session
/// envelope holding the delta (and the previous summary as a leading
/// system-role event), it yields the new summary text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, session: &Session) -> Result<String>;

    /// Gate consulted before generation when `force` is off.
    fn should_summarize(&self, _session: &Session) -> bool {
        true
    }
}

/// Compute and generate — but do not publish — the summary for one
/// `(session, filter_key)` pair.
///
/// Returns `Ok(None)` when generation was skipped (nothing new and not
/// forced, gate said no, or the model produced empty text). Errors from
/// the model driver propagate; nothing partial is ever written.
pub(crate) async fn summarize_session(
    summarizer: &dyn Summarizer,
    session: &Session,
    filter_key: &str,
    force: bool,
) -> Result<Option<Summary>> {
    let prev = session.summary(filter_key);
    let t_prev = prev.as_ref().map(|s| s.updated_at);

    let mut delta: Vec<Event> = session
        .events()
        .into_iter()
        .filter(|e| t_prev.is_none_or(|t| e.timestamp > t))
        .filter(|e| e.matches_filter(filter_key))
        .collect();
    let t_latest = delta.iter().map(|e| e.timestamp).max();

    if !force && delta.is_empty() {
        return Ok(None);
    }

    // The previous summary text leads the envelope so the model continues
    // rather than restarts.
    let mut shaped = Vec::with_capacity(delta.len() + 1);
    if let Some(prev) = &prev {
        if !prev.summary.is_empty() {
            shaped.push(
                Event::new("system")
                    .with_response(Response::with_message(Role::System, prev.summary.clone())),
            );
        }
    }
    shaped.append(&mut delta);

    let envelope = envelope_for(session, filter_key, shaped);
    if !force && !summarizer.should_summarize(&envelope) {
        return Ok(None);
    }

    let text = summarizer.summarize(&envelope).await?;
    if text.is_empty() {
        return Ok(None);
    }

    let updated_at = resolved_updated_at(t_latest, t_prev);
    Ok(Some(Summary::new(text, updated_at)))
}

/// `updated_at` tracks the newest event the text incorporates; with no
/// fresh delta it stays at the previous watermark.
fn resolved_updated_at(
    t_latest: Option<DateTime<Utc>>,
    t_prev: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    t_latest.or(t_prev).unwrap_or(DateTime::UNIX_EPOCH)
}

/// The full-session summary wins; otherwise the freshest branch summary.
pub(crate) fn pick_summary_text(
    summaries: &std::collections::HashMap<String, Summary>,
) -> Option<String> {
    if let Some(full) = summaries.get("") {
        return Some(full.summary.clone());
    }
    summaries.values().max_by_key(|s| s.updated_at).map(|s| s.summary.clone())
}

/// Transient single-use session handed to the summarizer.
fn envelope_for(base: &Session, filter_key: &str, events: Vec<Event>) -> Session {
    let key = crate::key::SessionKey::new(
        &base.app_name,
        &base.user_id,
        format!("{}:{}", base.id, filter_key),
    );
    Session::from_parts(
        &key,
        base.state(),
        events,
        std::collections::HashMap::new(),
        base.created_at,
        Utc::now(),
    )
}
