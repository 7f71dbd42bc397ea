//! Remote realization of the session service on a Redis-compatible store.
//!
//! Layout (`{…}` tags co-locate one app's keys in a cluster):
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `appstate:{app}` | hash | state key -> value bytes |
//! | `userstate:{app}:user` | hash | state key -> value bytes |
//! | `sess:{app}:user` | hash | session id -> JSON session record |
//! | `event:{app}:user:session` | zset | score = timestamp nanos, member = JSON event |
//! | `sesssum:{app}:user` | hash | session id -> JSON filter-key -> summary map |

use crate::error::{Result, SessionError};
use crate::event::{self, Event};
use crate::key::{SessionKey, UserKey};
use crate::service::{SessionOptions, SessionService};
use crate::session::{Session, Summary};
use crate::state::{self, KEY_PREFIX_APP, KEY_PREFIX_TEMP, KEY_PREFIX_USER, StateMap};
use crate::summary::{Summarizer, pick_summary_text, summarize_session};
use crate::worker::{
    DEFAULT_PERSIST_QUEUE_SIZE, DEFAULT_PERSIST_TIMEOUT, DEFAULT_PERSISTER_NUM,
    DEFAULT_SUMMARY_NUM, DEFAULT_SUMMARY_QUEUE_SIZE, DEFAULT_SUMMARY_TIMEOUT, Dispatch,
    PersistJob, SummaryJob, WorkerPool, clamp_pool_size,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

/// Atomic set-if-newer merge on the summaries hash. Loads the current
/// filter-key map, compares `updated_at` strings (fixed-precision RFC3339,
/// so lexical order is timestamp order) and overwrites iff old <= new.
/// Returns 1 when written, 0 when kept.
const SET_IF_NEWER_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local map = {}
if current then
  map = cjson.decode(current)
end
local incoming = cjson.decode(ARGV[3])
local existing = map[ARGV[2]]
if existing and existing['updated_at'] and incoming['updated_at']
    and existing['updated_at'] > incoming['updated_at'] then
  return 0
end
map[ARGV[2]] = incoming
redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(map))
return 1
"#;

// ---- process-wide instance registry -------------------------------------

static INSTANCES: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();

fn instances() -> &'static RwLock<HashMap<String, String>> {
    INSTANCES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Preconfigure a named endpoint so services can be built with
/// [`RedisSessionServiceBuilder::with_instance_name`] instead of a URL.
pub fn register_redis_instance(name: impl Into<String>, url: impl Into<String>) {
    instances().write().expect("registry lock poisoned").insert(name.into(), url.into());
}

fn lookup_instance(name: &str) -> Option<String> {
    instances().read().expect("registry lock poisoned").get(name).cloned()
}

// ---- key layout ----------------------------------------------------------

fn app_state_key(app: &str) -> String {
    format!("appstate:{{{app}}}")
}

fn user_state_key(app: &str, user: &str) -> String {
    format!("userstate:{{{app}}}:{user}")
}

fn sessions_key(app: &str, user: &str) -> String {
    format!("sess:{{{app}}}:{user}")
}

fn events_key(app: &str, user: &str, session: &str) -> String {
    format!("event:{{{app}}}:{user}:{session}")
}

fn summaries_key(app: &str, user: &str) -> String {
    format!("sesssum:{{{app}}}:{user}")
}

fn event_score(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX) as f64
}

fn ttl_seconds(ttl: Duration) -> Option<i64> {
    (!ttl.is_zero()).then(|| ttl.as_secs().max(1) as i64)
}

/// The per-session record stored in the `sess:` hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    id: String,
    #[serde(default)]
    state: StateMap,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

// ---- service -------------------------------------------------------------

struct RedisCore {
    conn: ConnectionManager,
    script: Script,
    event_limit: Option<usize>,
    session_ttl: Duration,
    app_state_ttl: Duration,
    user_state_ttl: Duration,
    persist_timeout: Duration,
    summary_timeout: Duration,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl RedisCore {
    /// Durable half of `append_event`: read-modify-write of the session
    /// record plus the event zset, as one transaction.
    async fn persist_event(&self, key: &SessionKey, ev: &Event) -> Result<()> {
        let mut conn = self.conn.clone();
        let sess_key = sessions_key(&key.app_name, &key.user_id);
        let ev_key = events_key(&key.app_name, &key.user_id, &key.session_id);
        let sum_key = summaries_key(&key.app_name, &key.user_id);

        let stored: Option<String> = conn
            .hget(&sess_key, &key.session_id)
            .await
            .map_err(|e| SessionError::backend("append_event", e))?;
        let Some(stored) = stored else {
            return Err(SessionError::SessionNotFound(key.session_id.clone()));
        };
        let mut record: SessionState = serde_json::from_str(&stored)
            .map_err(|e| SessionError::InvalidPayload(format!("session record: {e}")))?;

        let (app_delta, user_delta, session_delta) = state::split_state_delta(&ev.state_delta);
        record.state.extend(session_delta);
        record.updated_at = Utc::now();
        let payload = serde_json::to_string(&record)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if ev.is_valid_for_persistence() {
            pipe.zadd(&ev_key, serde_json::to_string(ev)?, event_score(ev.timestamp)).ignore();
            if let Some(limit) = self.event_limit {
                pipe.zremrangebyrank(&ev_key, 0, -(limit as isize) - 1).ignore();
            }
        }
        pipe.hset(&sess_key, &key.session_id, payload).ignore();
        if !app_delta.is_empty() {
            let items: Vec<(String, Vec<u8>)> = app_delta.into_iter().collect();
            pipe.hset_multiple(app_state_key(&key.app_name), &items).ignore();
            if let Some(secs) = ttl_seconds(self.app_state_ttl) {
                pipe.expire(app_state_key(&key.app_name), secs).ignore();
            }
        }
        if !user_delta.is_empty() {
            let items: Vec<(String, Vec<u8>)> = user_delta.into_iter().collect();
            pipe.hset_multiple(user_state_key(&key.app_name, &key.user_id), &items).ignore();
            if let Some(secs) = ttl_seconds(self.user_state_ttl) {
                pipe.expire(user_state_key(&key.app_name, &key.user_id), secs).ignore();
            }
        }
        if let Some(secs) = ttl_seconds(self.session_ttl) {
            pipe.expire(&sess_key, secs).ignore();
            pipe.expire(&ev_key, secs).ignore();
            pipe.expire(&sum_key, secs).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("append_event", e))?;
        Ok(())
    }

    async fn fetch_events(
        &self,
        key: &SessionKey,
        options: &SessionOptions,
    ) -> Result<Vec<Event>> {
        let mut conn = self.conn.clone();
        let ev_key = events_key(&key.app_name, &key.user_id, &key.session_id);
        let raw: Vec<String> = match options.event_num {
            Some(n) if n > 0 => {
                let mut newest_first: Vec<String> = conn
                    .zrevrangebyscore_limit(&ev_key, "+inf", "-inf", 0, n as isize)
                    .await
                    .map_err(|e| SessionError::backend("get_session", e))?;
                newest_first.reverse();
                newest_first
            }
            _ => conn
                .zrange(&ev_key, 0, -1)
                .await
                .map_err(|e| SessionError::backend("get_session", e))?,
        };
        raw.iter()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| SessionError::InvalidPayload(format!("event record: {e}")))
            })
            .collect()
    }

    async fn summarize_and_publish(
        &self,
        session: &Session,
        filter_key: &str,
        force: bool,
    ) -> Result<()> {
        let Some(summarizer) = &self.summarizer else {
            return Ok(());
        };
        let Some(summary) =
            summarize_session(summarizer.as_ref(), session, filter_key, force).await?
        else {
            return Ok(());
        };
        session.apply_summary_if_newer(filter_key, summary.clone());
        self.publish_summary(&session.key(), filter_key, &summary).await
    }

    /// Scripted set-if-newer merge into the summaries hash, with TTL
    /// refresh after.
    async fn publish_summary(
        &self,
        key: &SessionKey,
        filter_key: &str,
        summary: &Summary,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let sum_key = summaries_key(&key.app_name, &key.user_id);
        let payload = serde_json::to_string(summary)?;

        let written: i64 = self
            .script
            .key(&sum_key)
            .arg(&key.session_id)
            .arg(filter_key)
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("publish_summary", e))?;
        if let Some(secs) = ttl_seconds(self.session_ttl) {
            let _: bool = conn
                .expire(&sum_key, secs)
                .await
                .map_err(|e| SessionError::backend("publish_summary", e))?;
        }
        debug!(session = %key, filter_key, written, "summary published");
        Ok(())
    }

    async fn run_summary_job(&self, job: SummaryJob) {
        let SummaryJob { key, filter_key, force, session } = job;
        self.run_summary_once(&key, &session, &filter_key, force).await;
        if !filter_key.is_empty() {
            self.run_summary_once(&key, &session, "", force).await;
        }
    }

    async fn run_summary_once(
        &self,
        key: &SessionKey,
        session: &Session,
        filter_key: &str,
        force: bool,
    ) {
        match tokio::time::timeout(
            self.summary_timeout,
            self.summarize_and_publish(session, filter_key, force),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(session = %key, filter_key, error = %err, "summary job failed"),
            Err(_) => warn!(session = %key, filter_key, "summary job timed out"),
        }
    }
}

/// Session service backed by Redis hashes and sorted sets, with optional
/// sharded worker pools for event persistence and summary generation.
pub struct RedisSessionService {
    core: Arc<RedisCore>,
    persist_pool: Option<WorkerPool<PersistJob>>,
    summary_pool: Option<WorkerPool<SummaryJob>>,
}

impl RedisSessionService {
    pub fn builder() -> RedisSessionServiceBuilder {
        RedisSessionServiceBuilder::new()
    }
}

pub struct RedisSessionServiceBuilder {
    url: Option<String>,
    instance_name: Option<String>,
    manager_config: Option<ConnectionManagerConfig>,
    event_limit: Option<usize>,
    session_ttl: Duration,
    app_state_ttl: Duration,
    user_state_ttl: Duration,
    async_persist: bool,
    persister_num: usize,
    persist_queue_size: usize,
    persist_timeout: Duration,
    summarizer: Option<Arc<dyn Summarizer>>,
    summary_num: usize,
    summary_queue_size: usize,
    summary_job_timeout: Duration,
}

impl RedisSessionServiceBuilder {
    pub fn new() -> Self {
        Self {
            url: None,
            instance_name: None,
            manager_config: None,
            event_limit: None,
            session_ttl: Duration::ZERO,
            app_state_ttl: Duration::ZERO,
            user_state_ttl: Duration::ZERO,
            async_persist: false,
            persister_num: DEFAULT_PERSISTER_NUM,
            persist_queue_size: DEFAULT_PERSIST_QUEUE_SIZE,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
            summarizer: None,
            summary_num: DEFAULT_SUMMARY_NUM,
            summary_queue_size: DEFAULT_SUMMARY_QUEUE_SIZE,
            summary_job_timeout: DEFAULT_SUMMARY_TIMEOUT,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Resolve the endpoint through the process-wide registry instead of
    /// a literal URL. An explicit URL wins when both are set.
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    /// Pass-through configuration for the underlying connection manager.
    pub fn with_manager_config(mut self, config: ConnectionManagerConfig) -> Self {
        self.manager_config = Some(config);
        self
    }

    pub fn with_event_limit(mut self, limit: usize) -> Self {
        self.event_limit = (limit > 0).then_some(limit);
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_app_state_ttl(mut self, ttl: Duration) -> Self {
        self.app_state_ttl = ttl;
        self
    }

    pub fn with_user_state_ttl(mut self, ttl: Duration) -> Self {
        self.user_state_ttl = ttl;
        self
    }

    /// Hand event persistence to the sharded worker pool instead of
    /// writing inline.
    pub fn with_async_persist(mut self, enabled: bool) -> Self {
        self.async_persist = enabled;
        self
    }

    /// Persister pool size; zero falls back to the default of ten.
    pub fn with_persister_num(mut self, num: usize) -> Self {
        self.persister_num = num;
        self
    }

    pub fn with_persist_queue_size(mut self, size: usize) -> Self {
        self.persist_queue_size = size;
        self
    }

    pub fn with_persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_async_summary_num(mut self, num: usize) -> Self {
        self.summary_num = num;
        self
    }

    pub fn with_summary_queue_size(mut self, size: usize) -> Self {
        self.summary_queue_size = size;
        self
    }

    pub fn with_summary_job_timeout(mut self, timeout: Duration) -> Self {
        self.summary_job_timeout = timeout;
        self
    }

    pub async fn build(self) -> Result<RedisSessionService> {
        let url = self
            .url
            .or_else(|| self.instance_name.as_deref().and_then(lookup_instance))
            .unwrap_or_else(|| DEFAULT_URL.to_string());

        let client =
            redis::Client::open(url.as_str()).map_err(|e| SessionError::backend("connect", e))?;
        let conn = match self.manager_config {
            Some(config) => ConnectionManager::new_with_config(client, config).await,
            None => ConnectionManager::new(client).await,
        }
        .map_err(|e| SessionError::backend("connect", e))?;

        let core = Arc::new(RedisCore {
            conn,
            script: Script::new(SET_IF_NEWER_SCRIPT),
            event_limit: self.event_limit,
            session_ttl: self.session_ttl,
            app_state_ttl: self.app_state_ttl,
            user_state_ttl: self.user_state_ttl,
            persist_timeout: self.persist_timeout,
            summary_timeout: self.summary_job_timeout,
            summarizer: self.summarizer,
        });

        let persist_pool = self.async_persist.then(|| {
            let pool_core = core.clone();
            WorkerPool::spawn(
                clamp_pool_size(self.persister_num, DEFAULT_PERSISTER_NUM),
                self.persist_queue_size.max(1),
                move |job: PersistJob| {
                    let core = pool_core.clone();
                    async move {
                        match tokio::time::timeout(
                            core.persist_timeout,
                            core.persist_event(&job.key, &job.event),
                        )
                        .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                warn!(session = %job.key, error = %err, "async persistence failed")
                            }
                            Err(_) => {
                                warn!(session = %job.key, "async persistence timed out")
                            }
                        }
                    }
                },
            )
        });

        let summary_pool = core.summarizer.is_some().then(|| {
            let pool_core = core.clone();
            WorkerPool::spawn(
                clamp_pool_size(self.summary_num, DEFAULT_SUMMARY_NUM),
                self.summary_queue_size.max(1),
                move |job: SummaryJob| {
                    let core = pool_core.clone();
                    async move { core.run_summary_job(job).await }
                },
            )
        });

        Ok(RedisSessionService { core, persist_pool, summary_pool })
    }
}

impl Default for RedisSessionServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionService for RedisSessionService {
    async fn create_session(
        &self,
        key: SessionKey,
        state_map: StateMap,
        _options: &SessionOptions,
    ) -> Result<Arc<Session>> {
        key.validate_for_create()?;
        let session_id = if key.session_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            key.session_id.clone()
        };
        let key = SessionKey::new(&key.app_name, &key.user_id, session_id);

        let now = Utc::now();
        let (app_delta, user_delta, session_delta) = state::split_state_delta(&state_map);

        let mut conn = self.core.conn.clone();
        let app_key = app_state_key(&key.app_name);
        let user_key = user_state_key(&key.app_name, &key.user_id);
        let sess_key = sessions_key(&key.app_name, &key.user_id);

        let (mut app_state, mut user_state): (StateMap, StateMap) = redis::pipe()
            .hgetall(&app_key)
            .hgetall(&user_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("create_session", e))?;
        app_state.extend(app_delta.clone());
        user_state.extend(user_delta.clone());

        let record = SessionState {
            id: key.session_id.clone(),
            state: session_delta.clone(),
            created_at: now,
            updated_at: now,
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(&sess_key, &key.session_id, serde_json::to_string(&record)?).ignore();
        if !app_delta.is_empty() {
            let items: Vec<(String, Vec<u8>)> = app_delta.into_iter().collect();
            pipe.hset_multiple(&app_key, &items).ignore();
        }
        if !user_delta.is_empty() {
            let items: Vec<(String, Vec<u8>)> = user_delta.into_iter().collect();
            pipe.hset_multiple(&user_key, &items).ignore();
        }
        if let Some(secs) = ttl_seconds(self.core.session_ttl) {
            pipe.expire(&sess_key, secs).ignore();
        }
        if let Some(secs) = ttl_seconds(self.core.app_state_ttl) {
            pipe.expire(&app_key, secs).ignore();
        }
        if let Some(secs) = ttl_seconds(self.core.user_state_ttl) {
            pipe.expire(&user_key, secs).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("create_session", e))?;

        debug!(session = %key, "created session");
        let view = Session::from_parts(
            &key,
            session_delta,
            Vec::new(),
            HashMap::new(),
            now,
            now,
        );
        view.overlay_scopes(&app_state, &user_state);
        Ok(Arc::new(view))
    }

    async fn get_session(
        &self,
        key: &SessionKey,
        options: &SessionOptions,
    ) -> Result<Option<Arc<Session>>> {
        key.validate()?;
        let mut conn = self.core.conn.clone();
        let sess_key = sessions_key(&key.app_name, &key.user_id);
        let app_key = app_state_key(&key.app_name);
        let user_key = user_state_key(&key.app_name, &key.user_id);
        let sum_key = summaries_key(&key.app_name, &key.user_id);
        let ev_key = events_key(&key.app_name, &key.user_id, &key.session_id);

        let mut pipe = redis::pipe();
        pipe.hget(&sess_key, &key.session_id);
        pipe.hgetall(&app_key);
        pipe.hgetall(&user_key);
        pipe.hget(&sum_key, &key.session_id);
        // Sliding TTL: the same batch refreshes every touched lifetime.
        if let Some(secs) = ttl_seconds(self.core.session_ttl) {
            pipe.expire(&sess_key, secs).ignore();
            pipe.expire(&ev_key, secs).ignore();
            pipe.expire(&sum_key, secs).ignore();
        }
        if let Some(secs) = ttl_seconds(self.core.app_state_ttl) {
            pipe.expire(&app_key, secs).ignore();
        }
        if let Some(secs) = ttl_seconds(self.core.user_state_ttl) {
            pipe.expire(&user_key, secs).ignore();
        }

        let (stored, app_state, user_state, summaries_raw): (
            Option<String>,
            StateMap,
            StateMap,
            Option<String>,
        ) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("get_session", e))?;

        let Some(stored) = stored else {
            return Ok(None);
        };
        let record: SessionState = serde_json::from_str(&stored)
            .map_err(|e| SessionError::InvalidPayload(format!("session record: {e}")))?;
        let summaries: HashMap<String, Summary> = match summaries_raw {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| SessionError::InvalidPayload(format!("summary map: {e}")))?,
            None => HashMap::new(),
        };

        let mut events = self.core.fetch_events(key, options).await?;
        event::apply_window(&mut events, options);
        event::sanitize_user_anchor(&mut events);

        let view = Session::from_parts(
            key,
            record.state,
            events,
            summaries,
            record.created_at,
            record.updated_at,
        );
        view.overlay_scopes(&app_state, &user_state);
        Ok(Some(Arc::new(view)))
    }

    async fn list_sessions(
        &self,
        key: &UserKey,
        options: &SessionOptions,
    ) -> Result<Vec<Arc<Session>>> {
        key.validate()?;
        let mut conn = self.core.conn.clone();
        let sess_key = sessions_key(&key.app_name, &key.user_id);
        let app_key = app_state_key(&key.app_name);
        let user_key = user_state_key(&key.app_name, &key.user_id);
        let sum_key = summaries_key(&key.app_name, &key.user_id);

        let (records, app_state, user_state, summaries_raw): (
            HashMap<String, String>,
            StateMap,
            StateMap,
            HashMap<String, String>,
        ) = redis::pipe()
            .hgetall(&sess_key)
            .hgetall(&app_key)
            .hgetall(&user_key)
            .hgetall(&sum_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("list_sessions", e))?;

        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut parsed: Vec<SessionState> = records
            .values()
            .map(|raw| {
                serde_json::from_str(raw)
                    .map_err(|e| SessionError::InvalidPayload(format!("session record: {e}")))
            })
            .collect::<Result<_>>()?;
        parsed.sort_by_key(|r| r.created_at);

        let mut events_pipe = redis::pipe();
        for record in &parsed {
            events_pipe.zrange(events_key(&key.app_name, &key.user_id, &record.id), 0, -1);
        }
        let event_lists: Vec<Vec<String>> = events_pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("list_sessions", e))?;

        let mut sessions = Vec::with_capacity(parsed.len());
        for (record, raw_events) in parsed.into_iter().zip(event_lists) {
            let mut events = raw_events
                .iter()
                .map(|s| {
                    serde_json::from_str::<Event>(s).map_err(|e| {
                        SessionError::InvalidPayload(format!("event record: {e}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            event::apply_window(&mut events, options);
            event::sanitize_user_anchor(&mut events);

            let summaries: HashMap<String, Summary> = match summaries_raw.get(&record.id) {
                Some(raw) => serde_json::from_str(raw)
                    .map_err(|e| SessionError::InvalidPayload(format!("summary map: {e}")))?,
                None => HashMap::new(),
            };

            let full_key = SessionKey::new(&key.app_name, &key.user_id, &record.id);
            let view = Session::from_parts(
                &full_key,
                record.state,
                events,
                summaries,
                record.created_at,
                record.updated_at,
            );
            view.overlay_scopes(&app_state, &user_state);
            sessions.push(Arc::new(view));
        }
        Ok(sessions)
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<()> {
        key.validate()?;
        let mut conn = self.core.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hdel(sessions_key(&key.app_name, &key.user_id), &key.session_id)
            .ignore()
            .del(events_key(&key.app_name, &key.user_id, &key.session_id))
            .ignore()
            .hdel(summaries_key(&key.app_name, &key.user_id), &key.session_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("delete_session", e))?;
        Ok(())
    }

    async fn update_app_state(&self, app_name: &str, delta: StateMap) -> Result<()> {
        if app_name.is_empty() {
            return Err(SessionError::MissingAppName);
        }
        let items: Vec<(String, Vec<u8>)> = delta
            .into_iter()
            .filter(|(k, _)| !k.starts_with(KEY_PREFIX_TEMP))
            .map(|(k, v)| (k.strip_prefix(KEY_PREFIX_APP).map(str::to_string).unwrap_or(k), v))
            .collect();
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.core.conn.clone();
        let app_key = app_state_key(app_name);
        let mut pipe = redis::pipe();
        pipe.hset_multiple(&app_key, &items).ignore();
        if let Some(secs) = ttl_seconds(self.core.app_state_ttl) {
            pipe.expire(&app_key, secs).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("update_app_state", e))?;
        Ok(())
    }

    async fn delete_app_state(&self, app_name: &str, key: &str) -> Result<()> {
        if app_name.is_empty() {
            return Err(SessionError::MissingAppName);
        }
        if key.is_empty() {
            return Err(SessionError::MissingKey);
        }
        let mut conn = self.core.conn.clone();
        let key = key.strip_prefix(KEY_PREFIX_APP).unwrap_or(key);
        let _: i64 = conn
            .hdel(app_state_key(app_name), key)
            .await
            .map_err(|e| SessionError::backend("delete_app_state", e))?;
        Ok(())
    }

    async fn list_app_states(&self, app_name: &str) -> Result<StateMap> {
        if app_name.is_empty() {
            return Err(SessionError::MissingAppName);
        }
        let mut conn = self.core.conn.clone();
        let stored: StateMap = conn
            .hgetall(app_state_key(app_name))
            .await
            .map_err(|e| SessionError::backend("list_app_states", e))?;
        Ok(state::with_prefix(&stored, KEY_PREFIX_APP))
    }

    async fn update_user_state(&self, key: &UserKey, delta: StateMap) -> Result<()> {
        key.validate()?;
        for state_key in delta.keys() {
            if state_key.starts_with(KEY_PREFIX_APP) || state_key.starts_with(KEY_PREFIX_TEMP) {
                return Err(SessionError::ForbiddenPrefix(state_key.clone()));
            }
        }
        let items: Vec<(String, Vec<u8>)> = delta
            .into_iter()
            .map(|(k, v)| (k.strip_prefix(KEY_PREFIX_USER).map(str::to_string).unwrap_or(k), v))
            .collect();
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.core.conn.clone();
        let user_key = user_state_key(&key.app_name, &key.user_id);
        let mut pipe = redis::pipe();
        pipe.hset_multiple(&user_key, &items).ignore();
        if let Some(secs) = ttl_seconds(self.core.user_state_ttl) {
            pipe.expire(&user_key, secs).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| SessionError::backend("update_user_state", e))?;
        Ok(())
    }

    async fn delete_user_state(&self, key: &UserKey, state_key: &str) -> Result<()> {
        key.validate()?;
        if state_key.is_empty() {
            return Err(SessionError::MissingKey);
        }
        let mut conn = self.core.conn.clone();
        let state_key = state_key.strip_prefix(KEY_PREFIX_USER).unwrap_or(state_key);
        let _: i64 = conn
            .hdel(user_state_key(&key.app_name, &key.user_id), state_key)
            .await
            .map_err(|e| SessionError::backend("delete_user_state", e))?;
        Ok(())
    }

    async fn list_user_states(&self, key: &UserKey) -> Result<StateMap> {
        key.validate()?;
        let mut conn = self.core.conn.clone();
        let stored: StateMap = conn
            .hgetall(user_state_key(&key.app_name, &key.user_id))
            .await
            .map_err(|e| SessionError::backend("list_user_states", e))?;
        Ok(state::with_prefix(&stored, KEY_PREFIX_USER))
    }

    async fn append_event(
        &self,
        session: &Session,
        ev: Event,
        options: &SessionOptions,
    ) -> Result<()> {
        let key = session.key();
        key.validate()?;
        session.update_with_event(&ev, options);

        match &self.persist_pool {
            Some(pool) => {
                let job = PersistJob { key: key.clone(), event: ev };
                match pool.dispatch(&key.composite(), job) {
                    Dispatch::Sent => Ok(()),
                    Dispatch::Rejected(job) => {
                        warn!(session = %key, "persister queue unavailable; writing inline");
                        self.core.persist_event(&job.key, &job.event).await
                    }
                }
            }
            None => self.core.persist_event(&key, &ev).await,
        }
    }

    async fn create_session_summary(
        &self,
        session: &Session,
        filter_key: &str,
        force: bool,
    ) -> Result<()> {
        session.key().validate()?;
        self.core.summarize_and_publish(session, filter_key, force).await
    }

    async fn enqueue_summary_job(
        &self,
        session: &Arc<Session>,
        filter_key: &str,
        force: bool,
    ) -> Result<()> {
        if self.core.summarizer.is_none() {
            return Ok(());
        }
        let key = session.key();
        key.validate()?;
        let job = SummaryJob {
            key: key.clone(),
            filter_key: filter_key.to_string(),
            force,
            session: session.clone(),
        };
        match &self.summary_pool {
            Some(pool) => match pool.dispatch(&key.composite(), job) {
                Dispatch::Sent => Ok(()),
                Dispatch::Rejected(job) => {
                    warn!(session = %key, "summary queue unavailable; running synchronously");
                    self.core.run_summary_job(job).await;
                    Ok(())
                }
            },
            None => {
                self.core.run_summary_job(job).await;
                Ok(())
            }
        }
    }

    async fn get_session_summary_text(&self, session: &Session) -> Option<String> {
        let key = session.key();
        let mut conn = self.core.conn.clone();
        let raw: Option<String> = match conn
            .hget(summaries_key(&key.app_name, &key.user_id), &key.session_id)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(session = %key, error = %err, "summary lookup failed");
                return None;
            }
        };
        let summaries: HashMap<String, Summary> = serde_json::from_str(&raw?).ok()?;
        pick_summary_text(&summaries)
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = &self.persist_pool {
            pool.close().await;
        }
        if let Some(pool) = &self.summary_pool {
            pool.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Response, Role};

    #[test]
    fn test_key_layout() {
        assert_eq!(app_state_key("app"), "appstate:{app}");
        assert_eq!(user_state_key("app", "u1"), "userstate:{app}:u1");
        assert_eq!(sessions_key("app", "u1"), "sess:{app}:u1");
        assert_eq!(events_key("app", "u1", "s1"), "event:{app}:u1:s1");
        assert_eq!(summaries_key("app", "u1"), "sesssum:{app}:u1");
    }

    #[test]
    fn test_event_score_orders_chronologically() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(5);
        assert!(event_score(t0) < event_score(t1));
    }

    #[test]
    fn test_ttl_seconds() {
        assert_eq!(ttl_seconds(Duration::ZERO), None);
        assert_eq!(ttl_seconds(Duration::from_secs(30)), Some(30));
        // Sub-second TTLs round up to the expiry granularity.
        assert_eq!(ttl_seconds(Duration::from_millis(10)), Some(1));
    }

    #[test]
    fn test_session_record_roundtrip() {
        let mut state_map = StateMap::new();
        state_map.insert("k".to_string(), b"v".to_vec());
        let record = SessionState {
            id: "s1".to_string(),
            state: state_map,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let decoded: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, "s1");
        assert_eq!(decoded.state.get("k").unwrap(), b"v");
        assert_eq!(decoded.created_at, record.created_at);
    }

    #[test]
    fn test_event_member_encoding() {
        let ev = Event::new("user")
            .with_response(Response::with_message(Role::User, "hi"))
            .with_filter_key("b1");
        let json = serde_json::to_string(&ev).unwrap();
        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, ev.id);
        assert_eq!(decoded.filter_key, "b1");
        assert_eq!(decoded.content_text(), Some("hi"));
    }

    #[test]
    fn test_instance_registry() {
        register_redis_instance("cache-a", "redis://10.0.0.1:6379");
        assert_eq!(lookup_instance("cache-a").unwrap(), "redis://10.0.0.1:6379");
        assert!(lookup_instance("absent").is_none());
    }
}
