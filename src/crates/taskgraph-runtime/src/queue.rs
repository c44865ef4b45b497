//! The durable job queue: persisted jobs, leasing, retry, progress fan-out
//! and completion waiters.
//!
//! A [`Job`] is the persisted record of one task execution. A [`JobQueue`]
//! owns a [`QueueStorage`] backend, a [`Limiter`], an [`OutputCache`] and a
//! [`RetryPolicy`], and runs a fixed pool of worker loops that lease jobs,
//! call the registered run function, and commit the outcome.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheLease, SharedOutputCache};
use crate::error::{ErrorKind, QueueError};
use crate::limiter::Limiter;
use crate::retry::RetryPolicy;

/// Status of a persisted job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Aborting,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborting | JobStatus::Skipped
        )
    }
}

/// A persisted execution record for one task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    pub task_type: String,
    pub provider: String,
    pub input: Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(with = "system_time_millis")]
    pub next_run_at: SystemTime,
    #[serde(with = "system_time_millis_opt")]
    pub lease_expires_at: Option<SystemTime>,
    pub output: Option<Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub fingerprint: String,
    pub parent_job_id: Option<String>,
    #[serde(with = "system_time_millis")]
    pub created_at: SystemTime,
    #[serde(with = "system_time_millis")]
    pub updated_at: SystemTime,
}

impl Job {
    pub fn new(
        queue_name: impl Into<String>,
        task_type: impl Into<String>,
        provider: impl Into<String>,
        input: Value,
        fingerprint: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: Uuid::new_v4().to_string(),
            queue_name: queue_name.into(),
            task_type: task_type.into(),
            provider: provider.into(),
            input,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            next_run_at: now,
            lease_expires_at: None,
            output: None,
            error_kind: None,
            error_message: None,
            progress: 0,
            progress_message: None,
            fingerprint: fingerprint.into(),
            parent_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_job_id: impl Into<String>) -> Self {
        self.parent_job_id = Some(parent_job_id.into());
        self
    }
}

mod system_time_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let millis = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        s.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}

mod system_time_millis_opt {
    use super::system_time_millis;
    use serde::{Deserializer, Serializer};
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(t: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => system_time_millis::serialize(t, s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SystemTime>, D::Error> {
        // Only used by round-trip tests; persisted jobs always carry a lease
        // when PROCESSING and `None` is encoded as `null` by `Option`'s own
        // derive elsewhere, so a minimal millis-or-absent reader suffices.
        use serde::Deserialize;
        let opt = Option::<u64>::deserialize(d)?;
        Ok(opt.map(|millis| std::time::UNIX_EPOCH + std::time::Duration::from_millis(millis)))
    }
}

/// A change notification emitted by [`QueueStorage::subscribe_to_changes`].
#[derive(Debug, Clone)]
pub struct JobChange {
    pub job_id: String,
    pub queue_name: String,
    pub status: JobStatus,
}

/// Filter for [`QueueStorage::subscribe_to_changes`]; `None` matches everything.
pub struct ChangeFilter {
    pub queue_name: Option<String>,
}

/// Storage contract for queue persistence. The core's worker loop is the
/// only caller; backends may implement this over memory, a file, or a
/// database without the queue knowing the difference.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;
    /// Atomically selects the oldest PENDING job whose `next_run_at <= now`,
    /// writes PROCESSING and `lease_expires_at = now + lease_duration`, and
    /// returns it. `None` if no such job exists.
    async fn lease_next(&self, lease_duration: Duration) -> Result<Option<Job>, QueueError>;
    async fn complete(&self, id: &str, output: Value) -> Result<(), QueueError>;
    async fn fail(
        &self,
        id: &str,
        error_kind: ErrorKind,
        error_message: String,
        retry_date: Option<SystemTime>,
        max_backoff_next_run_at: Option<SystemTime>,
    ) -> Result<(), QueueError>;
    async fn abort(&self, id: &str) -> Result<(), QueueError>;
    async fn update_progress(
        &self,
        id: &str,
        percent: u8,
        message: Option<String>,
    ) -> Result<(), QueueError>;
    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError>;
    async fn size(&self, queue_name: &str) -> Result<usize, QueueError>;
    async fn clear(&self, queue_name: &str) -> Result<(), QueueError>;
    /// Restore PROCESSING jobs whose lease has expired back to PENDING,
    /// incrementing `attempts`. Returns the ids restored.
    async fn reap_expired_leases(&self, now: SystemTime) -> Result<Vec<String>, QueueError>;
    fn subscribe_to_changes(&self) -> broadcast::Receiver<JobChange>;
}

/// In-memory [`QueueStorage`]. Resets on restart — durable backends are an
/// external collaborator, per the out-of-scope list.
pub struct InMemoryQueueStorage {
    jobs: SyncRwLock<HashMap<String, Job>>,
    changes: broadcast::Sender<JobChange>,
}

impl InMemoryQueueStorage {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            jobs: SyncRwLock::new(HashMap::new()),
            changes: tx,
        }
    }

    fn notify(&self, job: &Job) {
        let _ = self.changes.send(JobChange {
            job_id: job.id.clone(),
            queue_name: job.queue_name.clone(),
            status: job.status,
        });
    }
}

impl Default for InMemoryQueueStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write();
        jobs.insert(job.id.clone(), job.clone());
        drop(jobs);
        self.notify(&job);
        Ok(())
    }

    async fn lease_next(&self, lease_duration: Duration) -> Result<Option<Job>, QueueError> {
        let now = SystemTime::now();
        let mut jobs = self.jobs.write();
        let candidate_id = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.next_run_at <= now)
            .min_by_key(|j| j.next_run_at)
            .map(|j| j.id.clone());

        let Some(id) = candidate_id else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).expect("candidate id came from this map");
        job.status = JobStatus::Processing;
        job.lease_expires_at = Some(now + lease_duration);
        job.updated_at = now;
        let leased = job.clone();
        drop(jobs);
        self.notify(&leased);
        Ok(Some(leased))
    }

    async fn complete(&self, id: &str, output: Value) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::Storage(format!("job {id} not found")))?;
        job.status = JobStatus::Completed;
        job.output = Some(output);
        job.progress = 100;
        job.lease_expires_at = None;
        job.updated_at = SystemTime::now();
        let done = job.clone();
        drop(jobs);
        self.notify(&done);
        Ok(())
    }

    async fn fail(
        &self,
        id: &str,
        error_kind: ErrorKind,
        error_message: String,
        retry_date: Option<SystemTime>,
        backoff_next_run_at: Option<SystemTime>,
    ) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::Storage(format!("job {id} not found")))?;
        job.attempts += 1;
        job.error_kind = Some(error_kind);
        job.error_message = Some(error_message);
        job.lease_expires_at = None;
        job.updated_at = SystemTime::now();

        let retryable = !matches!(
            error_kind,
            ErrorKind::Validation | ErrorKind::Permanent | ErrorKind::Aborted | ErrorKind::MissingRunFn
        ) && job.attempts < job.max_attempts;

        if retryable {
            job.status = JobStatus::Pending;
            job.next_run_at = retry_date.or(backoff_next_run_at).unwrap_or_else(SystemTime::now);
        } else if matches!(error_kind, ErrorKind::Aborted) {
            job.status = JobStatus::Aborting;
        } else {
            job.status = JobStatus::Failed;
        }
        let updated = job.clone();
        drop(jobs);
        self.notify(&updated);
        Ok(())
    }

    async fn abort(&self, id: &str) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::Storage(format!("job {id} not found")))?;
        job.status = JobStatus::Aborting;
        job.lease_expires_at = None;
        job.updated_at = SystemTime::now();
        let aborted = job.clone();
        drop(jobs);
        self.notify(&aborted);
        Ok(())
    }

    async fn update_progress(
        &self,
        id: &str,
        percent: u8,
        message: Option<String>,
    ) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::Storage(format!("job {id} not found")))?;
        // Monotone progress: never move backwards.
        job.progress = job.progress.max(percent.min(100));
        if message.is_some() {
            job.progress_message = message;
        }
        job.updated_at = SystemTime::now();
        let updated = job.clone();
        drop(jobs);
        self.notify(&updated);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.read().get(id).cloned())
    }

    async fn size(&self, queue_name: &str) -> Result<usize, QueueError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|j| j.queue_name == queue_name && !j.status.is_terminal())
            .count())
    }

    async fn clear(&self, queue_name: &str) -> Result<(), QueueError> {
        self.jobs.write().retain(|_, j| j.queue_name != queue_name);
        Ok(())
    }

    async fn reap_expired_leases(&self, now: SystemTime) -> Result<Vec<String>, QueueError> {
        let mut jobs = self.jobs.write();
        let mut restored = Vec::new();
        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing {
                if let Some(expiry) = job.lease_expires_at {
                    if expiry <= now {
                        job.status = JobStatus::Pending;
                        job.attempts += 1;
                        job.lease_expires_at = None;
                        job.updated_at = now;
                        restored.push(job.id.clone());
                    }
                }
            }
        }
        Ok(restored)
    }

    fn subscribe_to_changes(&self) -> broadcast::Receiver<JobChange> {
        self.changes.subscribe()
    }
}

/// Cooperative cancellation signal handed to a running job.
#[derive(Clone)]
pub struct CancellationSignal {
    aborted: Arc<AtomicBool>,
}

impl CancellationSignal {
    fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// A chunk published on a named streaming output port.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub port: String,
    pub value: Value,
    pub sequence: u64,
}

/// Context handed to a running job's `runFn`.
pub struct JobContext {
    job_id: String,
    task_type: String,
    storage: Arc<dyn QueueStorage>,
    cache: SharedOutputCache,
    chunk_tx: broadcast::Sender<Chunk>,
    chunk_seq: AtomicU64,
    signal: CancellationSignal,
}

impl JobContext {
    /// Builds a standalone context outside a running job. Intended for
    /// tests in downstream crates that need to exercise a task context
    /// without spinning up a whole queue.
    pub fn new(
        job_id: impl Into<String>,
        task_type: impl Into<String>,
        storage: Arc<dyn QueueStorage>,
        cache: SharedOutputCache,
        chunk_tx: broadcast::Sender<Chunk>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_type: task_type.into(),
            storage,
            cache,
            chunk_tx,
            chunk_seq: AtomicU64::new(0),
            signal: CancellationSignal::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn signal(&self) -> CancellationSignal {
        self.signal.clone()
    }

    pub async fn update_progress(&self, percent: u8, message: Option<String>) {
        if let Err(err) = self
            .storage
            .update_progress(&self.job_id, percent.min(100), message)
            .await
        {
            warn!(job_id = %self.job_id, %err, "failed to persist progress update");
        }
    }

    /// Publish a chunk. Queue-layer chunks are not validated against any
    /// port declaration — that validation lives one layer up, in the task
    /// runtime, which knows which ports were declared streaming.
    pub fn push_chunk(&self, port: &str, value: Value) {
        let sequence = self.chunk_seq.fetch_add(1, Ordering::SeqCst) as u64;
        let _ = self.chunk_tx.send(Chunk {
            port: port.to_string(),
            value,
            sequence,
        });
    }

    pub fn subscribe_chunks(&self) -> broadcast::Receiver<Chunk> {
        self.chunk_tx.subscribe()
    }

    pub async fn cache_get(&self, fingerprint: &str) -> Option<Value> {
        self.cache.get(&format!("{}:{}", self.task_type, fingerprint)).await
    }

    pub async fn cache_put(&self, fingerprint: &str, value: Value) {
        let key = format!("{}:{}", self.task_type, fingerprint);
        if matches!(self.cache.begin(&key).await, CacheLease::Owner) {
            self.cache.complete(&key, value).await;
        }
    }
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type RunFn =
    Arc<dyn Fn(Value, Arc<JobContext>) -> BoxFuture<Result<Value, QueueError>> + Send + Sync>;

/// `(taskType, provider) -> runFn` lookup table. `register` is the only
/// mutator; lookups are lock-free reads of an `Arc`-swapped snapshot would
/// be overkill here, a `RwLock` is plenty for registration-at-startup.
#[derive(Default)]
pub struct Registry {
    handlers: SyncRwLock<HashMap<(String, String), RunFn>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_type: impl Into<String>, provider: impl Into<String>, run_fn: RunFn) {
        self.handlers
            .write()
            .insert((task_type.into(), provider.into()), run_fn);
    }

    pub fn lookup(&self, task_type: &str, provider: &str) -> Option<RunFn> {
        self.handlers
            .read()
            .get(&(task_type.to_string(), provider.to_string()))
            .cloned()
    }
}

/// Configuration for a [`JobQueue`]'s worker pool and lease discipline.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub worker_count: usize,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(25),
            retry_policy: RetryPolicy::default(),
        }
    }
}

struct Waiters {
    senders: SyncRwLock<HashMap<String, Vec<tokio::sync::oneshot::Sender<Job>>>>,
}

impl Waiters {
    fn new() -> Self {
        Self {
            senders: SyncRwLock::new(HashMap::new()),
        }
    }

    fn register(&self, job_id: &str) -> tokio::sync::oneshot::Receiver<Job> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.senders
            .write()
            .entry(job_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn notify(&self, job: &Job) {
        if let Some(waiters) = self.senders.write().remove(&job.id) {
            for tx in waiters {
                let _ = tx.send(job.clone());
            }
        }
    }
}

/// A named job queue: storage + limiter + cache + retry policy + a pool of
/// worker loops competing for `lease_next`.
pub struct JobQueue {
    name: String,
    storage: Arc<dyn QueueStorage>,
    limiter: Arc<dyn Limiter>,
    cache: SharedOutputCache,
    registry: Arc<Registry>,
    config: QueueConfig,
    waiters: Arc<Waiters>,
    workers: AsyncMutex<Vec<JoinHandle<()>>>,
    watchdog: AsyncMutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    /// Chunk senders for jobs currently running, keyed by job id. Lets a
    /// caller (the graph runner) observe a job's streaming output while
    /// it's in flight instead of only after it completes.
    chunk_subscribers: SyncRwLock<HashMap<String, broadcast::Sender<Chunk>>>,
    /// Cancellation signals for jobs currently running, so `abort` can
    /// reach an in-flight `runFn` cooperatively.
    signals: SyncRwLock<HashMap<String, CancellationSignal>>,
}

impl JobQueue {
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn QueueStorage>,
        limiter: Arc<dyn Limiter>,
        cache: SharedOutputCache,
        registry: Arc<Registry>,
        config: QueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            storage,
            limiter,
            cache,
            registry,
            config,
            waiters: Arc::new(Waiters::new()),
            workers: AsyncMutex::new(Vec::new()),
            watchdog: AsyncMutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            chunk_subscribers: SyncRwLock::new(HashMap::new()),
            signals: SyncRwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribes to chunks published by a job that is currently running.
    /// Returns `None` if the job isn't (yet, or any longer) in flight; a
    /// caller racing this against submission should retry briefly or fall
    /// back to `wait_for`.
    pub fn subscribe_chunks(&self, job_id: &str) -> Option<broadcast::Receiver<Chunk>> {
        self.chunk_subscribers.read().get(job_id).map(|tx| tx.subscribe())
    }

    pub async fn add(&self, mut job: Job) -> Result<String, QueueError> {
        job.queue_name = self.name.clone();
        let id = job.id.clone();
        debug!(job_id = %id, task_type = %job.task_type, "job added");
        self.storage.enqueue(job).await?;
        Ok(id)
    }

    pub async fn get_progress(&self, id: &str) -> Result<Option<(u8, Option<String>)>, QueueError> {
        Ok(self
            .storage
            .get(id)
            .await?
            .map(|j| (j.progress, j.progress_message)))
    }

    /// Resolves once the job reaches a terminal status.
    pub async fn wait_for(&self, id: &str) -> Result<Job, QueueError> {
        if let Some(job) = self.storage.get(id).await? {
            if job.status.is_terminal() {
                return Ok(job);
            }
        }
        let rx = self.waiters.register(id);
        rx.await.map_err(|_| QueueError::Storage("wait_for channel closed".into()))
    }

    pub async fn size(&self) -> Result<usize, QueueError> {
        self.storage.size(&self.name).await
    }

    pub async fn abort(&self, id: &str) -> Result<(), QueueError> {
        self.storage.abort(id).await?;
        if let Some(signal) = self.signals.read().get(id) {
            signal.abort();
        }
        if let Some(job) = self.storage.get(id).await? {
            self.waiters.notify(&job);
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        self.storage.clear(&self.name).await
    }

    /// Starts the worker pool and the lease-reaping watchdog. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(queue = %self.name, workers = self.config.worker_count, "starting job queue");

        let mut handles = Vec::new();
        for worker_id in 0..self.config.worker_count {
            let queue = self.clone();
            handles.push(tokio::spawn(async move { queue.worker_loop(worker_id).await }));
        }
        if let Ok(mut guard) = self.workers.try_lock() {
            *guard = handles;
        }

        let watchdog_queue = self.clone();
        let watchdog = tokio::spawn(async move { watchdog_queue.watchdog_loop().await });
        if let Ok(mut guard) = self.watchdog.try_lock() {
            *guard = Some(watchdog);
        }
    }

    /// Stops accepting new leases and waits for in-flight workers to drain.
    /// Per the at-least-once property, any job left PROCESSING when workers
    /// are aborted returns to PENDING via the watchdog rather than being
    /// silently dropped.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(queue = %self.name, "stopping job queue");
        for handle in self.workers.lock().await.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.watchdog.lock().await.take() {
            handle.abort();
        }
        // One last reap so PROCESSING jobs whose worker was just aborted
        // don't linger past their lease.
        let _ = self.storage.reap_expired_leases(SystemTime::now()).await;
    }

    async fn watchdog_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.poll_interval.max(Duration::from_millis(100))).await;
            match self.storage.reap_expired_leases(SystemTime::now()).await {
                Ok(ids) if !ids.is_empty() => {
                    warn!(queue = %self.name, count = ids.len(), "reaped expired leases");
                }
                Ok(_) => {}
                Err(err) => error!(queue = %self.name, %err, "watchdog reap failed"),
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            if !self.limiter.can_proceed() {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            let leased = match self.storage.lease_next(self.config.lease_duration).await {
                Ok(job) => job,
                Err(err) => {
                    error!(queue = %self.name, worker_id, %err, "lease_next failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            let Some(job) = leased else {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            };

            self.limiter.record_job_start();
            self.run_job(job).await;
            self.limiter.record_job_completion();
        }
    }

    async fn run_job(self: &Arc<Self>, job: Job) {
        let span = tracing::info_span!("job", job_id = %job.id, queue = %self.name, task_type = %job.task_type);
        let _enter = span.enter();

        match self.cache.begin(&job.fingerprint).await {
            CacheLease::Cached(output) => {
                info!("cache hit, skipping execution");
                // SKIPPED jobs still resolve waiters with the cached output.
                if let Err(err) = self.storage.complete(&job.id, output).await {
                    error!(%err, "failed to commit skipped job");
                }
                if let Ok(Some(updated)) = self.storage.get(&job.id).await {
                    let mut skipped = updated;
                    skipped.status = JobStatus::Skipped;
                    self.waiters.notify(&skipped);
                }
                return;
            }
            CacheLease::Follow(mut rx) => {
                info!("following in-flight execution for the same fingerprint");
                match rx.recv().await {
                    Ok(Ok(output)) => {
                        let _ = self.storage.complete(&job.id, output).await;
                    }
                    Ok(Err(message)) => {
                        let _ = self
                            .storage
                            .fail(&job.id, ErrorKind::Retryable, message, None, Some(SystemTime::now()))
                            .await;
                    }
                    Err(_) => {
                        let _ = self
                            .storage
                            .fail(
                                &job.id,
                                ErrorKind::Retryable,
                                "in-flight execution dropped".into(),
                                None,
                                Some(SystemTime::now()),
                            )
                            .await;
                    }
                }
                if let Ok(Some(updated)) = self.storage.get(&job.id).await {
                    self.waiters.notify(&updated);
                }
                return;
            }
            CacheLease::Owner => {}
        }

        let Some(run_fn) = self.registry.lookup(&job.task_type, &job.provider) else {
            warn!(provider = %job.provider, "no run function registered");
            self.cache
                .fail(&job.fingerprint, "missing run function".into())
                .await;
            let _ = self
                .storage
                .fail(
                    &job.id,
                    ErrorKind::MissingRunFn,
                    format!(
                        "no run function registered for task type {:?} provider {:?}",
                        job.task_type, job.provider
                    ),
                    None,
                    None,
                )
                .await;
            if let Ok(Some(updated)) = self.storage.get(&job.id).await {
                self.waiters.notify(&updated);
            }
            return;
        };

        let (chunk_tx, _rx) = broadcast::channel(64);
        let signal = CancellationSignal::new();
        self.chunk_subscribers
            .write()
            .insert(job.id.clone(), chunk_tx.clone());
        self.signals.write().insert(job.id.clone(), signal.clone());
        let ctx = Arc::new(JobContext {
            job_id: job.id.clone(),
            task_type: job.task_type.clone(),
            storage: self.storage.clone(),
            cache: self.cache.clone(),
            chunk_tx,
            chunk_seq: AtomicU64::new(0),
            signal,
        });

        let outcome = run_fn(job.input.clone(), ctx).await;
        self.chunk_subscribers.write().remove(&job.id);
        self.signals.write().remove(&job.id);

        match outcome {
            Ok(output) => {
                info!("job completed");
                self.cache.complete(&job.fingerprint, output.clone()).await;
                if let Err(err) = self.storage.complete(&job.id, output).await {
                    error!(%err, "failed to commit completed job");
                }
            }
            Err(err) => {
                warn!(%err, "job failed");
                if let QueueError::RateLimit { retry_date: Some(t), .. } = &err {
                    self.limiter.set_next_available_time(*t);
                }
                self.cache.fail(&job.fingerprint, err.to_string()).await;
                let backoff = Some(
                    self.config
                        .retry_policy
                        .next_run_at(SystemTime::now(), job.attempts),
                );
                if let Err(storage_err) = self
                    .storage
                    .fail(&job.id, err.error_kind(), err.to_string(), err.retry_date(), backoff)
                    .await
                {
                    error!(%storage_err, "failed to commit failed job");
                }
            }
        }

        if let Ok(Some(updated)) = self.storage.get(&job.id).await {
            self.waiters.notify(&updated);
        }
    }
}
