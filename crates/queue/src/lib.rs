//! Bounded job queue with a worker pool: jobs fan out to at most `workers`
//! concurrent handlers, retry with exponential backoff on retryable errors,
//! and land in a dead-letter bucket once attempts are exhausted or the error
//! is terminal.

use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use relaydesk_core::error::InboxError;
use relaydesk_core::metrics::MetricsStore;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub workers: usize,
    pub queue_depth: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub retry_jitter_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_depth: 1024,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            retry_jitter_ms: 250,
        }
    }
}

/// A job that exhausted its attempts (or hit a terminal error), kept for
/// diagnostic retry.
#[derive(Debug, Clone)]
pub struct DeadJob<T> {
    pub job: T,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DeadLetterBucket<T> {
    jobs: Mutex<Vec<DeadJob<T>>>,
}

impl<T: Clone> DeadLetterBucket<T> {
    fn new() -> Self {
        Self { jobs: Mutex::new(Vec::new()) }
    }

    fn push(&self, job: T, error: String, attempts: u32) {
        self.jobs.lock().unwrap().push(DeadJob {
            job,
            error,
            attempts,
            failed_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<DeadJob<T>> {
        self.jobs.lock().unwrap().clone()
    }

    /// Take everything out, e.g. to re-enqueue after an incident.
    pub fn drain(&self) -> Vec<DeadJob<T>> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("queue {queue} is full")]
pub struct QueueFull {
    pub queue: &'static str,
}

/// Cloneable enqueue handle.
pub struct JobQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    dead: Arc<DeadLetterBucket<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self { name: self.name, tx: self.tx.clone(), dead: self.dead.clone() }
    }
}

impl<T: Clone + Send + 'static> JobQueue<T> {
    /// Non-blocking enqueue. A full queue is the caller's signal to shed
    /// load, not to wait.
    pub fn enqueue(&self, job: T) -> Result<(), QueueFull> {
        self.tx.try_send(job).map_err(|_| QueueFull { queue: self.name })
    }

    pub fn dead_letter(&self) -> Arc<DeadLetterBucket<T>> {
        self.dead.clone()
    }
}

/// Handle for draining the pool at shutdown.
pub struct PoolHandle {
    dispatcher: JoinHandle<()>,
}

impl PoolHandle {
    /// Wait for queued and in-flight jobs to finish. Callers drop every
    /// `JobQueue` clone first so the channel closes.
    pub async fn drain(self) {
        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "pool dispatcher panicked");
        }
    }
}

/// Deterministic jitter; avoids synchronized retry storms without pulling in
/// an RNG.
fn jitter_delay(attempt: u32, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    Duration::from_millis((seed ^ ((attempt as u64) << 7)) % (jitter_ms + 1))
}

/// Start a worker pool. The handler runs once per attempt; retryable errors
/// back off exponentially from `backoff_base`, terminal errors and exhausted
/// retries go to the dead-letter bucket.
pub fn start_pool<T, F, Fut>(
    name: &'static str,
    options: PoolOptions,
    metrics: Option<Arc<MetricsStore>>,
    handler: F,
) -> (JobQueue<T>, PoolHandle)
where
    T: Clone + Debug + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), InboxError>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<T>(options.queue_depth.max(1));
    let dead = Arc::new(DeadLetterBucket::new());
    let handler = Arc::new(handler);
    let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));

    let dispatcher_dead = dead.clone();
    let dispatcher = tokio::spawn(async move {
        info!(queue = name, workers = options.workers, "job pool started");
        let workers = options.workers.max(1) as u32;

        while let Some(job) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let handler = handler.clone();
            let dead = dispatcher_dead.clone();
            let metrics = metrics.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let mut delay = options.backoff_base;

                for attempt in 1..=options.max_attempts {
                    match (*handler)(job.clone()).await {
                        Ok(()) => return,
                        Err(e) if e.is_retryable() && attempt < options.max_attempts => {
                            warn!(
                                queue = name,
                                attempt,
                                error = %e,
                                "job attempt failed, retrying"
                            );
                            if let Some(m) = &metrics {
                                m.inc_jobs_retried();
                            }
                            sleep(delay + jitter_delay(attempt, options.retry_jitter_ms)).await;
                            delay *= 2;
                        }
                        Err(e) => {
                            error!(queue = name, attempt, error = %e, "job failed permanently");
                            if let Some(m) = &metrics {
                                m.inc_jobs_dead();
                            }
                            dead.push(job, e.to_string(), attempt);
                            return;
                        }
                    }
                }
            });
        }

        // Queue closed; wait for in-flight jobs by taking every permit.
        let _ = semaphore.acquire_many(workers).await;
        info!(queue = name, "job pool drained");
    });

    (JobQueue { name, tx, dead }, PoolHandle { dispatcher })
}
