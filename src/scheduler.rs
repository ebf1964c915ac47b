//! The per-node scheduling engine.
//!
//! Each node runs one poller and one dispatcher. The poller repeatedly asks
//! the store to atomically claim batches of due jobs inside a moving time
//! window; the dispatcher holds claimed jobs in a delay queue until their
//! due time, then submits them to a semaphore-bounded worker pool. Worker
//! completion releases a refill signal that wakes the poller early when it
//! had to stop claiming because the node's in-flight cap was hit.
//!
//! Cross-node coordination happens exclusively through the claim/lock
//! protocol in the store: at most one worker anywhere holds a job's lease.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use mongodb::Database;
use mongodb::bson::oid::ObjectId;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::builder::{JobBuilder, RepeatOptions};
use crate::config::SchedulerConfig;
use crate::errors::Error;
use crate::job_registry::JobRegistry;
use crate::schema::{self, ScheduledJob};
use crate::spec::{CancelMode, CancelOptions, CancelQuery, CancelResult, PersistResult};
use crate::storage::JobStore;
use crate::util;
use crate::worker::Worker;

/// Consecutive poll failures after which the engine stops itself.
const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 30;

/// How long a backlogged poller waits for a worker to finish before
/// re-checking capacity.
const BACKLOG_WAIT: Duration = Duration::from_millis(200);

/// A MongoDB-backed job scheduler node.
///
/// Cheap to clone; all clones share the same engine state. See the crate
/// docs for a usage example.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    database: Database,
    store: JobStore,
    worker: Worker,
    worker_id: Arc<str>,

    started: AtomicBool,
    /// Node-wide cap on concurrently running handlers.
    global_permits: Arc<Semaphore>,
    /// Per-handler-name caps, created lazily.
    per_name_permits: Mutex<HashMap<String, Arc<Semaphore>>>,
    /// Released once per worker completion; wakes a backlogged poller early.
    refill_signal: Arc<Semaphore>,
    /// Ids sitting in the delay queue; deduplicates poller vs. dispatcher.
    enqueued: Mutex<HashSet<ObjectId>>,
    /// End of the last polled window.
    window_cursor: Mutex<Option<chrono::DateTime<Utc>>>,
    dispatch_tx: Mutex<Option<mpsc::UnboundedSender<ScheduledJob>>>,
    background: Mutex<Option<BackgroundTasks>>,
    workers: tokio::sync::Mutex<JoinSet<()>>,
}

struct BackgroundTasks {
    poller: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Scheduler {
    /// Create a scheduler node over the given database.
    ///
    /// The worker id is resolved once here: a non-blank configured value, or
    /// an auto-generated `<hostname>-<pid>-<uuid>`.
    pub fn new(database: &Database, registry: JobRegistry, config: SchedulerConfig) -> Scheduler {
        let store = JobStore::new(database);
        let worker_id: Arc<str> = util::resolve_worker_id(config.worker_id.as_deref()).into();

        let worker = Worker {
            store: store.clone(),
            registry: Arc::new(registry),
            worker_id: Arc::clone(&worker_id),
            max_retry_count: config.max_retry_count,
            cleanup_finished_jobs: config.cleanup_finished_jobs,
        };

        Scheduler {
            inner: Arc::new(Inner {
                global_permits: Arc::new(Semaphore::new(config.max_concurrency)),
                refill_signal: Arc::new(Semaphore::new(0)),
                per_name_permits: Mutex::new(HashMap::new()),
                enqueued: Mutex::new(HashSet::new()),
                window_cursor: Mutex::new(None),
                dispatch_tx: Mutex::new(None),
                background: Mutex::new(None),
                workers: tokio::sync::Mutex::new(JoinSet::new()),
                started: AtomicBool::new(false),
                database: database.clone(),
                store,
                worker,
                worker_id,
                config,
            }),
        }
    }

    /// Start polling and executing due jobs. Idempotent.
    ///
    /// Fails with [`Error::InvalidArgument`] when `process-every` or
    /// `default-lock-lifetime` is zero. A scheduler disabled by
    /// configuration logs and returns without starting.
    pub async fn start(&self) -> Result<(), Error> {
        let inner = &self.inner;

        if !inner.config.enabled {
            info!("Scheduler is disabled by configuration; ignoring start");
            return Ok(());
        }
        if inner.config.process_every.is_zero() {
            return Err(Error::InvalidArgument(
                "process-every must be a positive duration".into(),
            ));
        }
        if inner.config.default_lock_lifetime.is_zero() {
            return Err(Error::InvalidArgument(
                "default-lock-lifetime must be a positive duration".into(),
            ));
        }

        if inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        if inner.config.ensure_indexes_on_startup {
            if let Err(error) = schema::ensure_indexes(&inner.database).await {
                inner.started.store(false, Ordering::SeqCst);
                return Err(error);
            }
        }

        info!(
            worker.id = %inner.worker_id,
            process_every = ?inner.config.process_every,
            default_lock_lifetime = ?inner.config.default_lock_lifetime,
            max_concurrency = inner.config.max_concurrency,
            lock_limit = inner.config.lock_limit,
            batch_size = inner.config.batch_size,
            "Scheduler starting"
        );

        util::lock(&inner.window_cursor).get_or_insert_with(Utc::now);

        let (tx, rx) = mpsc::unbounded_channel();
        *util::lock(&inner.dispatch_tx) = Some(tx);

        let dispatcher = tokio::spawn(dispatcher_loop(Arc::clone(inner), rx));
        let poller = tokio::spawn(poller_loop(Arc::clone(inner)));
        *util::lock(&inner.background) = Some(BackgroundTasks { poller, dispatcher });

        info!("Scheduler started");
        Ok(())
    }

    /// Stop polling and executing. Idempotent.
    ///
    /// In-flight handlers get up to `default-lock-lifetime` to finish, then
    /// are aborted; an aborted job's document stays locked until its lease
    /// expires, at which point any node reclaims it.
    pub async fn stop(&self) {
        Inner::shutdown(Arc::clone(&self.inner)).await;
    }

    /// Whether this node is currently running.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// The resolved lease-owner id of this node.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// The underlying job store.
    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Start building a job without a payload. Nothing is persisted until
    /// `save()`.
    pub fn create(&self, name: impl Into<String>) -> JobBuilder<()> {
        JobBuilder::new(self.inner.store.clone(), name, None)
    }

    /// Start building a job carrying a typed payload.
    pub fn create_with_data<T: Serialize>(
        &self,
        name: impl Into<String>,
        data: T,
    ) -> JobBuilder<T> {
        JobBuilder::new(self.inner.store.clone(), name, Some(data))
    }

    /// Start building a one-time job at an absolute time.
    pub fn schedule(&self, name: impl Into<String>, at: chrono::DateTime<Utc>) -> JobBuilder<()> {
        self.create(name).schedule(at)
    }

    /// Start building a one-time job at an absolute time, with a payload.
    pub fn schedule_with_data<T: Serialize>(
        &self,
        name: impl Into<String>,
        at: chrono::DateTime<Utc>,
        data: T,
    ) -> JobBuilder<T> {
        self.create_with_data(name, data).schedule(at)
    }

    /// Persist a job that runs as soon as the next poll sees it.
    pub async fn now(&self, name: impl Into<String>) -> Result<PersistResult, Error> {
        self.create(name).schedule(Utc::now()).save().await
    }

    /// Like [`now`](Self::now), with a payload.
    pub async fn now_with_data<T: Serialize>(
        &self,
        name: impl Into<String>,
        data: T,
    ) -> Result<PersistResult, Error> {
        self.create_with_data(name, data).schedule(Utc::now()).save().await
    }

    /// Create or update the repeating SINGLE job `name` with the given
    /// interval spec (human text, cron, or numeric seconds).
    pub async fn every(
        &self,
        name: impl Into<String>,
        interval: &str,
        options: Option<RepeatOptions>,
    ) -> Result<PersistResult, Error> {
        self.create(name)
            .single()
            .repeat_every_with(interval, options.unwrap_or_default())?
            .save()
            .await
    }

    /// Like [`every`](Self::every), with a payload.
    pub async fn every_with_data<T: Serialize>(
        &self,
        name: impl Into<String>,
        interval: &str,
        data: T,
        options: Option<RepeatOptions>,
    ) -> Result<PersistResult, Error> {
        self.create_with_data(name, data)
            .single()
            .repeat_every_with(interval, options.unwrap_or_default())?
            .save()
            .await
    }

    /// Like [`every`](Self::every), with the interval given in seconds.
    pub async fn every_secs(
        &self,
        name: impl Into<String>,
        seconds: u64,
        options: Option<RepeatOptions>,
    ) -> Result<PersistResult, Error> {
        self.create(name)
            .single()
            .repeat_every_secs_with(seconds, options.unwrap_or_default())?
            .save()
            .await
    }

    /// Like [`every_secs`](Self::every_secs), with a payload.
    pub async fn every_secs_with_data<T: Serialize>(
        &self,
        name: impl Into<String>,
        seconds: u64,
        data: T,
        options: Option<RepeatOptions>,
    ) -> Result<PersistResult, Error> {
        self.create_with_data(name, data)
            .single()
            .repeat_every_secs_with(seconds, options.unwrap_or_default())?
            .save()
            .await
    }

    /// Cancel jobs matched by `query`, either disabling or deleting them.
    ///
    /// Fails with [`Error::InvalidArgument`] on an empty query or a
    /// non-positive limit.
    pub async fn cancel(
        &self,
        query: &CancelQuery,
        options: CancelOptions,
    ) -> Result<CancelResult, Error> {
        options.validate()?;
        if query.is_empty() {
            return Err(Error::InvalidArgument(
                "cancel query must include at least one selector".into(),
            ));
        }

        match options.mode {
            CancelMode::Disable => {
                let modified = self.inner.store.disable_by_query(query, options.limit).await?;
                Ok(CancelResult {
                    matched: modified,
                    modified,
                    deleted: 0,
                })
            }
            CancelMode::Delete => {
                let deleted = self.inner.store.delete_by_query(query, options.limit).await?;
                Ok(CancelResult {
                    matched: deleted,
                    modified: 0,
                    deleted,
                })
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_id", &self.inner.worker_id)
            .field("started", &self.is_started())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Inner {
    async fn shutdown(inner: Arc<Inner>) {
        if inner
            .started
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("Scheduler stopping…");

        let background = util::lock(&inner.background).take();
        if let Some(tasks) = &background {
            tasks.poller.abort();
        }

        // Closing the channel lets the dispatcher drain its queue and exit.
        util::lock(&inner.dispatch_tx).take();

        {
            let mut workers = inner.workers.lock().await;
            let grace = inner.config.default_lock_lifetime;
            let finished_in_time =
                timeout(grace, async { while workers.join_next().await.is_some() {} })
                    .await
                    .is_ok();
            if !finished_in_time {
                warn!("Workers did not finish within the lock lifetime; aborting them");
                workers.abort_all();
                while workers.join_next().await.is_some() {}
            }
        }

        if let Some(tasks) = background {
            tasks.dispatcher.abort();
            let _ = tasks.dispatcher.await;
            let _ = tasks.poller.await;
        }

        util::lock(&inner.enqueued).clear();
        while let Ok(permit) = inner.refill_signal.try_acquire() {
            permit.forget();
        }

        info!("Scheduler stopped");
    }

    /// One poll round. Returns true when the round ended because the node's
    /// in-flight cap was hit (backlog), which makes the poller short-sleep
    /// on the refill signal instead of a full `process-every`.
    async fn poll_once(&self) -> Result<bool, Error> {
        let window_start = *util::lock(&self.window_cursor).get_or_insert_with(Utc::now);
        let window_end = window_start
            + chrono::Duration::from_std(self.config.process_every).map_err(|_| {
                Error::InvalidArgument("process-every is out of range".into())
            })?;

        let running = self
            .config
            .max_concurrency
            .saturating_sub(self.global_permits.available_permits());
        let in_flight = util::lock(&self.enqueued).len() + running;

        let mut remaining = if self.config.lock_limit == 0 {
            usize::MAX
        } else {
            self.config.lock_limit.saturating_sub(in_flight)
        };

        if remaining == 0 {
            *util::lock(&self.window_cursor) = Some(window_end);
            return Ok(true);
        }

        let batch_size = self.config.batch_size.max(1);
        let mut backlog = false;

        loop {
            let take = batch_size.min(remaining);
            let jobs = self
                .store
                .claim_due_jobs(
                    window_end,
                    take,
                    self.config.default_lock_lifetime,
                    &self.worker_id,
                )
                .await?;
            let claimed = jobs.len();
            debug!(claimed, %window_end, remaining, "Polled for due jobs");

            for job in jobs {
                if !util::lock(&self.enqueued).insert(job.id) {
                    continue;
                }
                let tx = util::lock(&self.dispatch_tx).clone();
                if let Some(tx) = tx {
                    // A closed channel means we are stopping; the claim
                    // expires on its own.
                    let _ = tx.send(job);
                }
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }

            if claimed < take {
                break;
            }
            if remaining == 0 {
                backlog = true;
                break;
            }
        }

        *util::lock(&self.window_cursor) = Some(window_end);
        Ok(backlog)
    }

    /// Submit a due job to the worker pool, blocking until both the global
    /// and the per-name concurrency caps have room.
    async fn submit(&self, job: ScheduledJob) {
        let per_name = self.permits_for_name(&job.name);

        let Ok(global_permit) = Arc::clone(&self.global_permits).acquire_owned().await else {
            return;
        };
        let Ok(name_permit) = per_name.acquire_owned().await else {
            return;
        };

        if !self.started.load(Ordering::SeqCst) {
            // Stopping; the claim expires and another node picks the job up.
            return;
        }

        let worker = self.worker.clone();
        let refill_signal = Arc::clone(&self.refill_signal);

        let mut workers = self.workers.lock().await;
        // Shutdown may have drained the pool while we waited for permits or
        // the lock; a job spawned now would escape the stop grace period.
        if !self.started.load(Ordering::SeqCst) {
            debug!(job.id = %job.id, "Scheduler stopped while submitting; dropping job");
            return;
        }
        while workers.try_join_next().is_some() {}
        workers.spawn(async move {
            worker.run_job(job).await;
            drop(name_permit);
            drop(global_permit);
            refill_signal.add_permits(1);
        });
    }

    fn permits_for_name(&self, name: &str) -> Arc<Semaphore> {
        let mut permits = util::lock(&self.per_name_permits);
        Arc::clone(
            permits
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.default_concurrency))),
        )
    }
}

async fn poller_loop(inner: Arc<Inner>) {
    let mut consecutive_failures: u32 = 0;

    while inner.started.load(Ordering::SeqCst) {
        let backlog = match inner.poll_once().await {
            Ok(backlog) => {
                consecutive_failures = 0;
                backlog
            }
            Err(error) => {
                consecutive_failures += 1;
                error!(%error, failures = consecutive_failures, "Polling for due jobs failed");

                if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                    error!("Stopping scheduler after repeated polling failures");
                    tokio::spawn(Inner::shutdown(Arc::clone(&inner)));
                    break;
                }

                sleep(poll_backoff(consecutive_failures)).await;
                continue;
            }
        };

        if !inner.started.load(Ordering::SeqCst) {
            break;
        }

        if backlog {
            if let Ok(Ok(permit)) = timeout(
                BACKLOG_WAIT,
                Arc::clone(&inner.refill_signal).acquire_owned(),
            )
            .await
            {
                permit.forget();
            }
        } else {
            sleep(inner.config.process_every).await;
        }
    }
}

async fn dispatcher_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<ScheduledJob>) {
    let mut queue: DelayQueue<ScheduledJob> = DelayQueue::new();

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(job) => {
                    let delay = job
                        .next_run_at
                        .map(|at| at.to_chrono().signed_duration_since(Utc::now()))
                        .and_then(|until_due| until_due.to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    queue.insert(job, delay);
                }
                None => break,
            },
            Some(job) = next_expired(&mut queue) => {
                util::lock(&inner.enqueued).remove(&job.id);
                inner.submit(job).await;
            }
        }
    }
}

/// The next due job, or `None` immediately when the queue is empty (which
/// disables that select branch until a new job is inserted).
async fn next_expired(queue: &mut DelayQueue<ScheduledJob>) -> Option<ScheduledJob> {
    futures_util::future::poll_fn(|cx| queue.poll_expired(cx))
        .await
        .map(|expired| expired.into_inner())
}

/// Backoff for consecutive poll-loop failures: 1s, 2s, 4s… capped at 60s.
fn poll_backoff(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(15);
    let millis = (1_000_u64 << exp).min(60_000);
    Duration::from_millis(millis)
}
