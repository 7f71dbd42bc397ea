use agent_session::{
    Event, InMemorySessionService, Response, Result, Role, Session, SessionKey, SessionOptions,
    SessionService, StateMap, Summarizer,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Returns a fixed text and counts invocations.
struct FixedSummarizer {
    text: std::sync::Mutex<String>,
    calls: AtomicUsize,
}

impl FixedSummarizer {
    fn new(text: &str) -> Arc<Self> {
        Arc::new(Self { text: std::sync::Mutex::new(text.to_string()), calls: AtomicUsize::new(0) })
    }

    fn set_text(&self, text: &str) {
        *self.text.lock().unwrap() = text.to_string();
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(&self, _session: &Session) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.lock().unwrap().clone())
    }
}

/// Never returns within any reasonable deadline.
struct BlockedSummarizer;

#[async_trait]
impl Summarizer for BlockedSummarizer {
    async fn summarize(&self, _session: &Session) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok("never".to_string())
    }
}

fn turn(content: &str, ts: DateTime<Utc>, filter_key: &str) -> Event {
    Event::new("user")
        .with_response(Response::with_message(Role::User, content))
        .with_timestamp(ts)
        .with_filter_key(filter_key)
}

async fn seeded_service(
    summarizer: Arc<dyn Summarizer>,
) -> (InMemorySessionService, Arc<Session>, DateTime<Utc>) {
    let service = InMemorySessionService::builder().with_summarizer(summarizer).build();
    let session = service
        .create_session(SessionKey::new("app", "u1", "s1"), StateMap::new(), &SessionOptions::new())
        .await
        .unwrap();
    let base = Utc::now();
    service
        .append_event(&session, turn("one", base + ChronoDuration::seconds(1), "b1"), &SessionOptions::new())
        .await
        .unwrap();
    service
        .append_event(&session, turn("two", base + ChronoDuration::seconds(2), "b1"), &SessionOptions::new())
        .await
        .unwrap();
    (service, session, base)
}

#[tokio::test]
async fn test_create_summary_stores_per_filter_key() {
    let summarizer = FixedSummarizer::new("S1");
    let (service, session, base) = seeded_service(summarizer.clone()).await;

    service.create_session_summary(&session, "b1", false).await.unwrap();

    let stored = session.summary("b1").unwrap();
    assert_eq!(stored.summary, "S1");
    assert_eq!(stored.updated_at, base + ChronoDuration::seconds(2));

    // The stored record carries it too: a fresh read sees the summary.
    let fetched =
        service.get_session(&session.key(), &SessionOptions::new()).await.unwrap().unwrap();
    assert_eq!(fetched.summary("b1").unwrap().summary, "S1");

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_second_call_without_new_events_is_a_noop() {
    let summarizer = FixedSummarizer::new("S1");
    let (service, session, base) = seeded_service(summarizer.clone()).await;

    service.create_session_summary(&session, "b1", false).await.unwrap();
    assert_eq!(summarizer.calls(), 1);

    summarizer.set_text("S2");
    service.create_session_summary(&session, "b1", false).await.unwrap();
    // Nothing new: the summarizer was not consulted and the text stands.
    assert_eq!(summarizer.calls(), 1);
    assert_eq!(session.summary("b1").unwrap().summary, "S1");

    // Force regenerates the text but keeps the watermark.
    service.create_session_summary(&session, "b1", true).await.unwrap();
    let stored = session.summary("b1").unwrap();
    assert_eq!(stored.summary, "S2");
    assert_eq!(stored.updated_at, base + ChronoDuration::seconds(2));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_new_events_advance_the_watermark() {
    let summarizer = FixedSummarizer::new("S1");
    let (service, session, base) = seeded_service(summarizer.clone()).await;
    service.create_session_summary(&session, "b1", false).await.unwrap();

    summarizer.set_text("S2");
    service
        .append_event(&session, turn("three", base + ChronoDuration::seconds(3), "b1"), &SessionOptions::new())
        .await
        .unwrap();
    service.create_session_summary(&session, "b1", false).await.unwrap();

    let stored = session.summary("b1").unwrap();
    assert_eq!(stored.summary, "S2");
    assert_eq!(stored.updated_at, base + ChronoDuration::seconds(3));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_summary_text_lookup_prefers_full_session() {
    let summarizer = FixedSummarizer::new("branch text");
    let (service, session, _) = seeded_service(summarizer.clone()).await;

    assert!(service.get_session_summary_text(&session).await.is_none());

    service.create_session_summary(&session, "b1", false).await.unwrap();
    assert_eq!(service.get_session_summary_text(&session).await.unwrap(), "branch text");

    summarizer.set_text("full text");
    service.create_session_summary(&session, "", true).await.unwrap();
    assert_eq!(service.get_session_summary_text(&session).await.unwrap(), "full text");

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_enqueue_without_summarizer_is_a_noop() {
    let service = InMemorySessionService::new();
    let session = service
        .create_session(SessionKey::new("app", "u1", "s1"), StateMap::new(), &SessionOptions::new())
        .await
        .unwrap();

    service.enqueue_summary_job(&session, "", false).await.unwrap();
    assert!(service.get_session_summary_text(&session).await.is_none());
}

#[tokio::test]
async fn test_enqueue_generates_asynchronously() {
    let summarizer = FixedSummarizer::new("async summary");
    let (service, session, _) = seeded_service(summarizer.clone()).await;

    service.enqueue_summary_job(&session, "", false).await.unwrap();

    let mut text = None;
    for _ in 0..100 {
        if let Some(found) = service.get_session_summary_text(&session).await {
            text = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(text.unwrap(), "async summary");

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_branch_job_cascades_into_full_session_summary() {
    let summarizer = FixedSummarizer::new("S");
    let (service, session, _) = seeded_service(summarizer.clone()).await;

    service.enqueue_summary_job(&session, "b1", false).await.unwrap();

    let mut done = false;
    for _ in 0..100 {
        let fetched =
            service.get_session(&session.key(), &SessionOptions::new()).await.unwrap().unwrap();
        if fetched.summary("b1").is_some() && fetched.summary("").is_some() {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(done, "branch and full-session summaries should both appear");
    assert!(summarizer.calls() >= 2);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_blocked_summarizer_is_cancelled_and_publishes_nothing() {
    let service = InMemorySessionService::builder()
        .with_summarizer(Arc::new(BlockedSummarizer))
        .with_summary_job_timeout(Duration::from_millis(100))
        .build();
    let session = service
        .create_session(SessionKey::new("app", "u1", "s1"), StateMap::new(), &SessionOptions::new())
        .await
        .unwrap();
    service
        .append_event(&session, turn("one", Utc::now(), ""), &SessionOptions::new())
        .await
        .unwrap();

    service.enqueue_summary_job(&session, "", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(service.get_session_summary_text(&session).await.is_none());
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_queue_overflow_falls_back_to_synchronous() {
    // One worker, queue of one: jam both with blocked jobs, then verify an
    // extra enqueue still completes by running in the caller.
    struct GatedSummarizer {
        blocked: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for GatedSummarizer {
        async fn summarize(&self, session: &Session) -> Result<String> {
            if session.events().iter().any(|e| e.content_text() == Some("block")) {
                self.blocked.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok("fallback".to_string())
        }
    }

    let service = InMemorySessionService::builder()
        .with_summarizer(Arc::new(GatedSummarizer { blocked: AtomicUsize::new(0) }))
        .with_async_summary_num(1)
        .with_summary_queue_size(1)
        .with_summary_job_timeout(Duration::from_secs(120))
        .build();

    let blocker = service
        .create_session(SessionKey::new("app", "u1", "jam"), StateMap::new(), &SessionOptions::new())
        .await
        .unwrap();
    service
        .append_event(&blocker, turn("block", Utc::now(), ""), &SessionOptions::new())
        .await
        .unwrap();

    let target = service
        .create_session(SessionKey::new("app", "u1", "work"), StateMap::new(), &SessionOptions::new())
        .await
        .unwrap();
    service
        .append_event(&target, turn("summarize me", Utc::now(), ""), &SessionOptions::new())
        .await
        .unwrap();

    // First job occupies the single worker, second fills the queue.
    service.enqueue_summary_job(&blocker, "", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.enqueue_summary_job(&blocker, "", true).await.unwrap();

    // Third job cannot be queued; it must run synchronously and publish.
    service.enqueue_summary_job(&target, "", false).await.unwrap();
    assert_eq!(service.get_session_summary_text(&target).await.unwrap(), "fallback");
}

#[tokio::test]
async fn test_monotonic_updated_at_across_writers() {
    // Scenario: two writers race on the "" summary; the later timestamp
    // wins no matter the arrival order.
    let session = Session::new("app", "u1", "s1", StateMap::new());
    let now = Utc::now();

    let early = agent_session::Summary::new("early", now - ChronoDuration::hours(1));
    let late = agent_session::Summary::new("late", now + ChronoDuration::hours(1));

    assert!(session.apply_summary_if_newer("", late.clone()));
    assert!(!session.apply_summary_if_newer("", early));
    assert_eq!(session.summary("").unwrap().summary, "late");
    assert_eq!(session.summary("").unwrap().updated_at, late.updated_at);
}
