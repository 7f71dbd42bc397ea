#[cfg(feature = "redis")]
use crate::event::Event;
use crate::key::SessionKey;
use crate::session::Session;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[cfg(feature = "redis")]
pub(crate) const DEFAULT_PERSISTER_NUM: usize = 10;
#[cfg(feature = "redis")]
pub(crate) const DEFAULT_PERSIST_QUEUE_SIZE: usize = 256;
#[cfg(feature = "redis")]
pub(crate) const DEFAULT_PERSIST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

pub(crate) const DEFAULT_SUMMARY_NUM: usize = 3;
pub(crate) const DEFAULT_SUMMARY_QUEUE_SIZE: usize = 256;
pub(crate) const DEFAULT_SUMMARY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// One queued summary generation request.
pub(crate) struct SummaryJob {
    pub key: SessionKey,
    pub filter_key: String,
    pub force: bool,
    pub session: Arc<Session>,
}

/// One queued durable-append request.
#[cfg(feature = "redis")]
pub(crate) struct PersistJob {
    pub key: SessionKey,
    pub event: Event,
}

pub(crate) enum Dispatch<J> {
    Sent,
    /// Queue full or already closed; the job comes back so the caller can
    /// run it synchronously.
    Rejected(J),
}

/// A fixed array of workers, each draining its own bounded channel.
/// Jobs are routed by a stable hash of the composite session key, which
/// keeps per-session ordering without any cross-worker coordination.
pub(crate) struct WorkerPool<J> {
    senders: RwLock<Vec<mpsc::Sender<J>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `size` workers. The handler is responsible for bounding each
    /// job with its own deadline; worker tasks never inherit the
    /// submitter's cancellation.
    pub fn spawn<H, Fut>(size: usize, queue_size: usize, handler: H) -> Self
    where
        H: Fn(J) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut senders = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);
        for worker in 0..size {
            let (tx, mut rx) = mpsc::channel::<J>(queue_size);
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    handler(job).await;
                }
                debug!(worker, "worker drained and stopped");
            }));
            senders.push(tx);
        }
        Self { senders: RwLock::new(senders), handles: Mutex::new(handles) }
    }

    /// Non-blocking enqueue: the job is either sent to its shard or handed
    /// back (queue full, or pool closed).
    pub fn dispatch(&self, shard_key: &str, job: J) -> Dispatch<J> {
        let senders = self.senders.read().expect("pool lock poisoned");
        if senders.is_empty() {
            return Dispatch::Rejected(job);
        }
        let shard = shard_index(shard_key, senders.len());
        match senders[shard].try_send(job) {
            Ok(()) => Dispatch::Sent,
            Err(mpsc::error::TrySendError::Full(job))
            | Err(mpsc::error::TrySendError::Closed(job)) => Dispatch::Rejected(job),
        }
    }

    /// Close the queues and wait for the workers to drain them.
    pub async fn close(&self) {
        self.senders.write().expect("pool lock poisoned").clear();
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().expect("pool lock poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Stable 32-bit shard hash of the composite key.
pub(crate) fn shard_index(key: &str, shards: usize) -> usize {
    use std::hash::{DefaultHasher, Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as u32 as usize) % shards
}

/// Pool sizes at or below zero fall back to the default.
pub(crate) fn clamp_pool_size(size: usize, default: usize) -> usize {
    if size == 0 { default } else { size }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};

    #[tokio::test]
    async fn test_jobs_reach_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let pool = WorkerPool::spawn(4, 16, move |n: usize| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(n, Ordering::SeqCst);
            }
        });

        for i in 0..10 {
            assert!(matches!(pool.dispatch(&format!("key-{i}"), 1), Dispatch::Sent));
        }
        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_full_queue_hands_the_job_back() {
        let pool = WorkerPool::spawn(1, 1, |_: usize| async {
            sleep(Duration::from_secs(60)).await;
        });

        // First job occupies the worker, second fills the buffer.
        assert!(matches!(pool.dispatch("k", 1), Dispatch::Sent));
        sleep(Duration::from_millis(50)).await;
        assert!(matches!(pool.dispatch("k", 2), Dispatch::Sent));
        assert!(matches!(pool.dispatch("k", 3), Dispatch::Rejected(3)));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = WorkerPool::spawn(2, 4, |_: usize| async {});
        pool.close().await;
        assert!(matches!(pool.dispatch("k", 7), Dispatch::Rejected(7)));
    }

    #[test]
    fn test_shard_is_stable_and_in_range() {
        let a = shard_index("app:u1:s1", 10);
        assert_eq!(a, shard_index("app:u1:s1", 10));
        assert!(a < 10);
        for i in 0..100 {
            assert!(shard_index(&format!("app:u:{i}"), 3) < 3);
        }
    }

    #[test]
    fn test_clamp_pool_size() {
        assert_eq!(clamp_pool_size(0, 10), 10);
        assert_eq!(clamp_pool_size(4, 10), 4);
    }
}
