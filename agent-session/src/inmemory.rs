use crate::error::{Result, SessionError};
use crate::event::Event;
use crate::key::{SessionKey, UserKey};
use crate::service::{SessionOptions, SessionService};
use crate::session::Session;
use crate::state::{self, KEY_PREFIX_APP, KEY_PREFIX_TEMP, KEY_PREFIX_USER, StateMap};
use crate::summary::{Summarizer, pick_summary_text, summarize_session};
use crate::worker::{
    DEFAULT_SUMMARY_NUM, DEFAULT_SUMMARY_QUEUE_SIZE, DEFAULT_SUMMARY_TIMEOUT, Dispatch,
    SummaryJob, WorkerPool, clamp_pool_size,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// A zero TTL disables expiry entirely.
fn calculate_expire_at(ttl: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }
    chrono::Duration::from_std(ttl).ok().map(|d| now + d)
}

fn is_expired(expire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expire_at.is_some_and(|t| now > t)
}

struct StoredSession {
    session: Arc<Session>,
    expire_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StoredState {
    state: StateMap,
    expire_at: Option<DateTime<Utc>>,
}

/// Everything belonging to one app, guarded by a single inner lock held
/// across whole mutations or copies.
#[derive(Default)]
struct AppData {
    /// user id -> session id -> stored session
    sessions: HashMap<String, HashMap<String, StoredSession>>,
    user_state: HashMap<String, StoredState>,
    app_state: StoredState,
}

struct MemoryCore {
    apps: RwLock<HashMap<String, Arc<RwLock<AppData>>>>,
    event_limit: Option<usize>,
    session_ttl: Duration,
    app_state_ttl: Duration,
    user_state_ttl: Duration,
    summary_timeout: Duration,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl MemoryCore {
    fn app(&self, app_name: &str) -> Option<Arc<RwLock<AppData>>> {
        self.apps.read().expect("apps lock poisoned").get(app_name).cloned()
    }

    fn app_or_create(&self, app_name: &str) -> Arc<RwLock<AppData>> {
        if let Some(app) = self.app(app_name) {
            return app;
        }
        let mut apps = self.apps.write().expect("apps lock poisoned");
        apps.entry(app_name.to_string()).or_default().clone()
    }

    fn any_ttl_configured(&self) -> bool {
        !self.session_ttl.is_zero()
            || !self.app_state_ttl.is_zero()
            || !self.user_state_ttl.is_zero()
    }

    /// Generate the summary for one filter key and publish it to both the
    /// caller's aggregate and the stored record, under set-if-newer.
    async fn summarize_and_publish(
        &self,
        session: &Session,
        filter_key: &str,
        force: bool,
    ) -> Result<()> {
        let Some(summarizer) = &self.summarizer else {
            return Ok(());
        };
        let Some(summary) = summarize_session(summarizer.as_ref(), session, filter_key, force).await?
        else {
            return Ok(());
        };

        session.apply_summary_if_newer(filter_key, summary.clone());

        let key = session.key();
        if let Some(app) = self.app(&key.app_name) {
            let stored = {
                let data = app.read().expect("app lock poisoned");
                data.sessions
                    .get(&key.user_id)
                    .and_then(|m| m.get(&key.session_id))
                    .map(|s| s.session.clone())
            };
            if let Some(stored) = stored {
                stored.apply_summary_if_newer(filter_key, summary);
            }
        }
        Ok(())
    }

    /// Worker body: bounded by a fresh per-job deadline, then cascaded
    /// into the full-session key after a branch job.
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

    /// Janitor sweep: drop expired sessions and user states, reset expired
    /// app state to an empty map with no expiry.
    fn sweep_expired(&self) {
        let now = Utc::now();
        let apps: Vec<Arc<RwLock<AppData>>> =
            self.apps.read().expect("apps lock poisoned").values().cloned().collect();

        let mut removed = 0usize;
        for app in apps {
            let mut data = app.write().expect("app lock poisoned");
            for sessions in data.sessions.values_mut() {
                let before = sessions.len();
                sessions.retain(|_, s| !is_expired(s.expire_at, now));
                removed += before - sessions.len();
            }
            data.sessions.retain(|_, m| !m.is_empty());
            data.user_state.retain(|_, s| !is_expired(s.expire_at, now));
            if is_expired(data.app_state.expire_at, now) {
                data.app_state = StoredState::default();
            }
        }
        if removed > 0 {
            debug!(removed, "janitor removed expired sessions");
        }
    }
}

/// In-process realization of the session service: nested maps guarded by
/// an outer apps lock and one inner lock per app, with optional TTLs and
/// a background janitor.
pub struct InMemorySessionService {
    core: Arc<MemoryCore>,
    summary_pool: Option<WorkerPool<SummaryJob>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
    janitor_stop: Arc<tokio::sync::Notify>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> InMemorySessionServiceBuilder {
        InMemorySessionServiceBuilder::new()
    }
}

impl Default for InMemorySessionService {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemorySessionServiceBuilder {
    event_limit: Option<usize>,
    session_ttl: Duration,
    app_state_ttl: Duration,
    user_state_ttl: Duration,
    cleanup_interval: Duration,
    summarizer: Option<Arc<dyn Summarizer>>,
    summary_num: usize,
    summary_queue_size: usize,
    summary_job_timeout: Duration,
}

impl InMemorySessionServiceBuilder {
    pub fn new() -> Self {
        Self {
            event_limit: None,
            session_ttl: Duration::ZERO,
            app_state_ttl: Duration::ZERO,
            user_state_ttl: Duration::ZERO,
            cleanup_interval: Duration::ZERO,
            summarizer: None,
            summary_num: DEFAULT_SUMMARY_NUM,
            summary_queue_size: DEFAULT_SUMMARY_QUEUE_SIZE,
            summary_job_timeout: DEFAULT_SUMMARY_TIMEOUT,
        }
    }

    /// Cap on the stored event list; oldest events are evicted past it.
    pub fn with_event_limit(mut self, limit: usize) -> Self {
        self.event_limit = (limit > 0).then_some(limit);
        self
    }

    /// Session lifetime. Zero means sessions never expire.
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

    /// Janitor cadence. Zero keeps the default of five minutes; the
    /// janitor only runs when some TTL is configured.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Size of the async summary worker pool. Zero falls back to the
    /// default of three.
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

    /// Build the service. Must run inside a tokio runtime when a
    /// summarizer or any TTL is configured, since those spawn tasks.
    pub fn build(self) -> InMemorySessionService {
        let core = Arc::new(MemoryCore {
            apps: RwLock::new(HashMap::new()),
            event_limit: self.event_limit,
            session_ttl: self.session_ttl,
            app_state_ttl: self.app_state_ttl,
            user_state_ttl: self.user_state_ttl,
            summary_timeout: self.summary_job_timeout,
            summarizer: self.summarizer,
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

        let janitor_stop = Arc::new(tokio::sync::Notify::new());
        let janitor = core.any_ttl_configured().then(|| {
            let interval = if self.cleanup_interval.is_zero() {
                DEFAULT_CLEANUP_INTERVAL
            } else {
                self.cleanup_interval
            };
            let core = core.clone();
            let stop = janitor_stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // the first tick fires immediately
                loop {
                    tokio::select! {
                        _ = ticker.tick() => core.sweep_expired(),
                        _ = stop.notified() => break,
                    }
                }
                debug!("janitor stopped");
            })
        });

        InMemorySessionService {
            core,
            summary_pool,
            janitor: Mutex::new(janitor),
            janitor_stop,
        }
    }
}

impl Default for InMemorySessionServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(
        &self,
        key: SessionKey,
        state: StateMap,
        options: &SessionOptions,
    ) -> Result<Arc<Session>> {
        key.validate_for_create()?;
        let session_id = if key.session_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            key.session_id.clone()
        };

        let now = Utc::now();
        let (app_delta, user_delta, session_delta) = state::split_state_delta(&state);
        let app = self.core.app_or_create(&key.app_name);
        let mut data = app.write().expect("app lock poisoned");

        if is_expired(data.app_state.expire_at, now) {
            data.app_state = StoredState::default();
        }
        data.app_state.state.extend(app_delta);
        data.app_state.expire_at = calculate_expire_at(self.core.app_state_ttl, now);

        let user_entry = data.user_state.entry(key.user_id.clone()).or_default();
        if is_expired(user_entry.expire_at, now) {
            *user_entry = StoredState::default();
        }
        user_entry.state.extend(user_delta);
        user_entry.expire_at = calculate_expire_at(self.core.user_state_ttl, now);

        let session =
            Arc::new(Session::new(&key.app_name, &key.user_id, &session_id, session_delta));
        data.sessions.entry(key.user_id.clone()).or_default().insert(
            session_id.clone(),
            StoredSession {
                session: session.clone(),
                expire_at: calculate_expire_at(self.core.session_ttl, now),
            },
        );

        let app_state = data.app_state.state.clone();
        let user_state =
            data.user_state.get(&key.user_id).map(|s| s.state.clone()).unwrap_or_default();
        drop(data);

        debug!(session = %session.key(), "created session");
        let view = session.snapshot_with(options);
        view.overlay_scopes(&app_state, &user_state);
        Ok(Arc::new(view))
    }

    async fn get_session(
        &self,
        key: &SessionKey,
        options: &SessionOptions,
    ) -> Result<Option<Arc<Session>>> {
        key.validate()?;
        let now = Utc::now();
        let Some(app) = self.core.app(&key.app_name) else {
            return Ok(None);
        };
        let mut data = app.write().expect("app lock poisoned");

        let session = match data.sessions.get(&key.user_id).and_then(|m| m.get(&key.session_id)) {
            Some(stored) if !is_expired(stored.expire_at, now) => stored.session.clone(),
            _ => return Ok(None),
        };

        let app_state = if is_expired(data.app_state.expire_at, now) {
            StateMap::new()
        } else {
            data.app_state.state.clone()
        };
        let user_state = data
            .user_state
            .get(&key.user_id)
            .filter(|s| !is_expired(s.expire_at, now))
            .map(|s| s.state.clone())
            .unwrap_or_default();

        // Sliding TTL: reads refresh every lifetime they touched.
        refresh_lifetimes(&mut data, &self.core, key, now);
        drop(data);

        let view = session.snapshot_with(options);
        view.overlay_scopes(&app_state, &user_state);
        Ok(Some(Arc::new(view)))
    }

    async fn list_sessions(
        &self,
        key: &UserKey,
        options: &SessionOptions,
    ) -> Result<Vec<Arc<Session>>> {
        key.validate()?;
        let now = Utc::now();
        let Some(app) = self.core.app(&key.app_name) else {
            return Ok(Vec::new());
        };
        let mut data = app.write().expect("app lock poisoned");

        let mut live: Vec<Arc<Session>> = data
            .sessions
            .get(&key.user_id)
            .map(|m| {
                m.values()
                    .filter(|s| !is_expired(s.expire_at, now))
                    .map(|s| s.session.clone())
                    .collect()
            })
            .unwrap_or_default();

        let app_state = if is_expired(data.app_state.expire_at, now) {
            StateMap::new()
        } else {
            data.app_state.state.clone()
        };
        let user_state = data
            .user_state
            .get(&key.user_id)
            .filter(|s| !is_expired(s.expire_at, now))
            .map(|s| s.state.clone())
            .unwrap_or_default();

        if !self.core.session_ttl.is_zero() {
            if let Some(sessions) = data.sessions.get_mut(&key.user_id) {
                let expire_at = calculate_expire_at(self.core.session_ttl, now);
                for stored in sessions.values_mut() {
                    if !is_expired(stored.expire_at, now) {
                        stored.expire_at = expire_at;
                    }
                }
            }
        }
        drop(data);

        live.sort_by_key(|s| s.created_at);
        Ok(live
            .into_iter()
            .map(|session| {
                let view = session.snapshot_with(options);
                view.overlay_scopes(&app_state, &user_state);
                Arc::new(view)
            })
            .collect())
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<()> {
        key.validate()?;
        let Some(app) = self.core.app(&key.app_name) else {
            return Ok(());
        };
        let mut data = app.write().expect("app lock poisoned");
        if let Some(sessions) = data.sessions.get_mut(&key.user_id) {
            sessions.remove(&key.session_id);
            if sessions.is_empty() {
                data.sessions.remove(&key.user_id);
            }
        }
        Ok(())
    }

    async fn update_app_state(&self, app_name: &str, delta: StateMap) -> Result<()> {
        if app_name.is_empty() {
            return Err(SessionError::MissingAppName);
        }
        let now = Utc::now();
        let app = self.core.app_or_create(app_name);
        let mut data = app.write().expect("app lock poisoned");
        if is_expired(data.app_state.expire_at, now) {
            data.app_state = StoredState::default();
        }
        for (key, value) in delta {
            if key.starts_with(KEY_PREFIX_TEMP) {
                continue;
            }
            let key = key.strip_prefix(KEY_PREFIX_APP).map(str::to_string).unwrap_or(key);
            data.app_state.state.insert(key, value);
        }
        data.app_state.expire_at = calculate_expire_at(self.core.app_state_ttl, now);
        Ok(())
    }

    async fn delete_app_state(&self, app_name: &str, key: &str) -> Result<()> {
        if app_name.is_empty() {
            return Err(SessionError::MissingAppName);
        }
        if key.is_empty() {
            return Err(SessionError::MissingKey);
        }
        let Some(app) = self.core.app(app_name) else {
            return Ok(());
        };
        let now = Utc::now();
        let mut data = app.write().expect("app lock poisoned");
        let key = key.strip_prefix(KEY_PREFIX_APP).unwrap_or(key);
        data.app_state.state.remove(key);
        data.app_state.expire_at = calculate_expire_at(self.core.app_state_ttl, now);
        Ok(())
    }

    async fn list_app_states(&self, app_name: &str) -> Result<StateMap> {
        if app_name.is_empty() {
            return Err(SessionError::MissingAppName);
        }
        let Some(app) = self.core.app(app_name) else {
            return Ok(StateMap::new());
        };
        let data = app.read().expect("app lock poisoned");
        if is_expired(data.app_state.expire_at, Utc::now()) {
            return Ok(StateMap::new());
        }
        Ok(state::with_prefix(&data.app_state.state, KEY_PREFIX_APP))
    }

    async fn update_user_state(&self, key: &UserKey, delta: StateMap) -> Result<()> {
        key.validate()?;
        for state_key in delta.keys() {
            if state_key.starts_with(KEY_PREFIX_APP) || state_key.starts_with(KEY_PREFIX_TEMP) {
                return Err(SessionError::ForbiddenPrefix(state_key.clone()));
            }
        }
        let now = Utc::now();
        let app = self.core.app_or_create(&key.app_name);
        let mut data = app.write().expect("app lock poisoned");
        let entry = data.user_state.entry(key.user_id.clone()).or_default();
        if is_expired(entry.expire_at, now) {
            *entry = StoredState::default();
        }
        for (state_key, value) in delta {
            let state_key =
                state_key.strip_prefix(KEY_PREFIX_USER).map(str::to_string).unwrap_or(state_key);
            entry.state.insert(state_key, value);
        }
        entry.expire_at = calculate_expire_at(self.core.user_state_ttl, now);
        Ok(())
    }

    async fn delete_user_state(&self, key: &UserKey, state_key: &str) -> Result<()> {
        key.validate()?;
        if state_key.is_empty() {
            return Err(SessionError::MissingKey);
        }
        let Some(app) = self.core.app(&key.app_name) else {
            return Ok(());
        };
        let now = Utc::now();
        let mut data = app.write().expect("app lock poisoned");
        let state_key = state_key.strip_prefix(KEY_PREFIX_USER).unwrap_or(state_key);
        if let Some(entry) = data.user_state.get_mut(&key.user_id) {
            entry.state.remove(state_key);
            if entry.state.is_empty() {
                // Last key removed: drop the empty container too.
                data.user_state.remove(&key.user_id);
            } else {
                entry.expire_at = calculate_expire_at(self.core.user_state_ttl, now);
            }
        }
        Ok(())
    }

    async fn list_user_states(&self, key: &UserKey) -> Result<StateMap> {
        key.validate()?;
        let Some(app) = self.core.app(&key.app_name) else {
            return Ok(StateMap::new());
        };
        let data = app.read().expect("app lock poisoned");
        Ok(data
            .user_state
            .get(&key.user_id)
            .filter(|s| !is_expired(s.expire_at, Utc::now()))
            .map(|s| state::with_prefix(&s.state, KEY_PREFIX_USER))
            .unwrap_or_default())
    }

    async fn append_event(
        &self,
        session: &Session,
        event: Event,
        options: &SessionOptions,
    ) -> Result<()> {
        let key = session.key();
        key.validate()?;

        // Local half first: the caller's aggregate reflects the event even
        // while persistence is in flight.
        session.update_with_event(&event, options);

        let now = Utc::now();
        let Some(app) = self.core.app(&key.app_name) else {
            return Err(SessionError::AppNotFound(key.app_name));
        };
        let mut data = app.write().expect("app lock poisoned");

        let stored_session = {
            let Some(user_sessions) = data.sessions.get_mut(&key.user_id) else {
                return Err(SessionError::UserNotFound(key.user_id));
            };
            let Some(stored) = user_sessions.get_mut(&key.session_id) else {
                return Err(SessionError::SessionNotFound(key.session_id));
            };
            if is_expired(stored.expire_at, now) {
                return Err(SessionError::SessionExpired(key.session_id));
            }
            stored.expire_at = calculate_expire_at(self.core.session_ttl, now);
            stored.session.clone()
        };

        let (app_delta, user_delta, session_delta) = state::split_state_delta(&event.state_delta);
        if !app_delta.is_empty() {
            if is_expired(data.app_state.expire_at, now) {
                data.app_state = StoredState::default();
            }
            data.app_state.state.extend(app_delta);
            data.app_state.expire_at = calculate_expire_at(self.core.app_state_ttl, now);
        }
        if !user_delta.is_empty() {
            let entry = data.user_state.entry(key.user_id.clone()).or_default();
            if is_expired(entry.expire_at, now) {
                *entry = StoredState::default();
            }
            entry.state.extend(user_delta);
            entry.expire_at = calculate_expire_at(self.core.user_state_ttl, now);
        }
        drop(data);

        let durable = event.is_valid_for_persistence();
        stored_session.apply_persisted_event(
            durable.then_some(&event),
            &session_delta,
            self.core.event_limit,
        );
        Ok(())
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
        let summaries = self
            .core
            .app(&key.app_name)
            .and_then(|app| {
                let data = app.read().expect("app lock poisoned");
                data.sessions
                    .get(&key.user_id)
                    .and_then(|m| m.get(&key.session_id))
                    .map(|s| s.session.summaries())
            })
            .unwrap_or_else(|| session.summaries());
        pick_summary_text(&summaries)
    }

    async fn close(&self) -> Result<()> {
        let handle = self.janitor.lock().expect("janitor lock poisoned").take();
        if let Some(handle) = handle {
            self.janitor_stop.notify_one();
            let _ = handle.await;
        }
        if let Some(pool) = &self.summary_pool {
            pool.close().await;
        }
        Ok(())
    }
}

fn refresh_lifetimes(data: &mut AppData, core: &MemoryCore, key: &SessionKey, now: DateTime<Utc>) {
    if !core.session_ttl.is_zero() {
        if let Some(stored) =
            data.sessions.get_mut(&key.user_id).and_then(|m| m.get_mut(&key.session_id))
        {
            stored.expire_at = calculate_expire_at(core.session_ttl, now);
        }
    }
    if !core.user_state_ttl.is_zero() {
        if let Some(entry) = data.user_state.get_mut(&key.user_id) {
            entry.expire_at = calculate_expire_at(core.user_state_ttl, now);
        }
    }
    if !core.app_state_ttl.is_zero() {
        data.app_state.expire_at = calculate_expire_at(core.app_state_ttl, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_expire_at() {
        let now = Utc::now();
        assert!(calculate_expire_at(Duration::ZERO, now).is_none());

        let at = calculate_expire_at(Duration::from_secs(60), now).unwrap();
        assert_eq!(at, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        assert!(!is_expired(None, now));
        assert!(!is_expired(Some(now + chrono::Duration::seconds(1)), now));
        assert!(is_expired(Some(now - chrono::Duration::seconds(1)), now));
        // Exactly at the boundary: not yet expired.
        assert!(!is_expired(Some(now), now));
    }

    #[test]
    fn test_expired_reads_as_absent() {
        let now = Utc::now();
        let stored = StoredState {
            state: StateMap::new(),
            expire_at: Some(now - chrono::Duration::seconds(1)),
        };
        assert!(is_expired(stored.expire_at, now));
    }
}
