use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::job::{Job, JobId, JobLock, JobOptions, JobPayload, JobStatus, RepeatSpec, Stage, now_ms};
use super::repeat::{CronSchedule, RepeatDefinition, ScheduleError};
use super::store::{JobStore, QueueError, StatusCounts};
use crate::observability::Metrics;
use crate::stages::{StageError, StageHandler};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("a handler is already registered for the {0} stage")]
    HandlerAlreadyRegistered(Stage),

    #[error("job {0} is not locked by this worker")]
    LockMismatch(JobId),

    #[error("broker is shutting down")]
    ShuttingDown,
}

/// Why a single attempt of a job failed
#[derive(Debug, Error)]
pub enum AttemptFailure {
    #[error(transparent)]
    Handler(#[from] StageError),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Broker tuning knobs
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Upper bound on how long an idle worker sleeps before re-checking its stage
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub event_capacity: usize,
    /// Concurrent workers per registered stage
    pub worker_slots: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            event_capacity: 256,
            worker_slots: 1,
        }
    }
}

impl BrokerConfig {
    /// Exponential backoff after `attempts_made` failed attempts: base, 2×base, 4×base...
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

/// Lifecycle notifications published by the broker
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Completed { job: Job },
    Retrying { job: Job, error: String, delay: Duration },
    /// Published exactly once per job, when its last attempt fails
    Failed { job: Job, error: String },
}

/// Anything that accepts new jobs; stage handlers depend on this rather than on `Broker`
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<Job, BrokerError>;
}

/// Durable job broker
///
/// Architecture:
/// 1. `enqueue` persists a Waiting job into the JobStore and wakes the stage
/// 2. `process` registers the single handler of a stage and spawns its workers
/// 3. A worker claims the earliest due job (Waiting → Active, lock token issued)
/// 4. The handler runs in its own task under the job's timeout
/// 5. Success → Completed; failure → Waiting after backoff, or Failed once
///    attempts are exhausted
///
/// Claims and finalizations are serialized by one write lock, so a job is
/// Active under at most one worker. Repeat jobs get their next instance at
/// claim time, independent of how the current one ends.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    store: JobStore,
    config: BrokerConfig,
    events: broadcast::Sender<BrokerEvent>,
    wakers: HashMap<Stage, Notify>,
    registered: Mutex<HashSet<Stage>>,
    active: Mutex<HashSet<JobId>>,
    write_lock: Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    metrics: Arc<Metrics>,
    instance: Uuid,
    /// Set when a claimed repeat instance could not schedule its successor
    repeats_stalled: AtomicBool,
}

impl Broker {
    /// Open the job store at `path` and build a broker on top of it
    pub fn open<P: AsRef<Path>>(path: P, config: BrokerConfig) -> Result<Self, BrokerError> {
        let store = JobStore::open(path)?;
        Self::with_store(store, config)
    }

    pub fn with_store(store: JobStore, config: BrokerConfig) -> Result<Self, BrokerError> {
        recover_stalled(&store)?;

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let wakers = Stage::ALL.iter().map(|stage| (*stage, Notify::new())).collect();
        let instance = Uuid::now_v7();

        info!(
            %instance,
            worker_slots = config.worker_slots,
            "Broker ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                events,
                wakers,
                registered: Mutex::new(HashSet::new()),
                active: Mutex::new(HashSet::new()),
                write_lock: Mutex::new(()),
                workers: Mutex::new(Vec::new()),
                shutdown,
                metrics: Arc::new(Metrics::new()),
                instance,
                repeats_stalled: AtomicBool::new(false),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Persist a new Waiting job
    ///
    /// With `options.repeat` set, a standing definition is stored under the
    /// repeat key and the returned job is the instance waiting for the next
    /// cron firing. Registering an unchanged repeat again returns that same
    /// instance.
    pub async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<Job, BrokerError> {
        if let Some(spec) = options.repeat.clone() {
            return self.enqueue_repeat(payload, options, spec).await;
        }

        let store = &self.inner.store;
        let id = store.next_id()?;
        let job = Job::new(id, payload, &options, now_ms());
        store.put(&job, None)?;
        self.inner.metrics.job_enqueued();

        info!(
            job_id = job.id,
            stage = %job.stage,
            max_attempts = job.max_attempts,
            "Job enqueued"
        );

        self.wake(job.stage);
        Ok(job)
    }

    async fn enqueue_repeat(
        &self,
        payload: JobPayload,
        options: JobOptions,
        spec: RepeatSpec,
    ) -> Result<Job, BrokerError> {
        let schedule = CronSchedule::parse(&spec.cron, &spec.timezone)?;
        let max_attempts = options.max_attempts.max(1);
        let timeout_ms = options.timeout.as_millis().min(u64::MAX as u128) as u64;
        let _guard = self.inner.write_lock.lock().await;
        let store = &self.inner.store;

        let mut created_at_ms = now_ms();
        if let Some(mut existing) = store.get_repeat(&spec.key)? {
            let pending = self.pending_instance(&existing)?;
            if existing.spec == spec {
                if let Some(job) = pending {
                    let same_settings = existing.max_attempts == max_attempts
                        && existing.timeout_ms == timeout_ms
                        && existing.payload == payload;
                    if same_settings {
                        debug!(key = %spec.key, job_id = job.id, "Repeat already registered");
                        return Ok(job);
                    }

                    // Same firing times; the waiting instance keeps its slot
                    info!(
                        key = %spec.key,
                        job_id = job.id,
                        old_max_attempts = existing.max_attempts,
                        max_attempts,
                        old_timeout_ms = existing.timeout_ms,
                        timeout_ms,
                        "Updating repeat job settings"
                    );
                    existing.max_attempts = max_attempts;
                    existing.timeout_ms = timeout_ms;
                    existing.payload = payload;

                    let mut updated = job.clone();
                    updated.stage = existing.payload.stage();
                    updated.payload = existing.payload.clone();
                    updated.max_attempts = max_attempts;
                    updated.timeout_ms = timeout_ms;
                    store.put_repeat_instance(&updated, Some(&job), &existing)?;
                    self.wake(updated.stage);
                    return Ok(updated);
                }
            } else {
                info!(
                    key = %spec.key,
                    old_cron = %existing.spec.cron,
                    new_cron = %spec.cron,
                    "Replacing repeat definition"
                );
                if let Some(job) = pending {
                    store.remove(&job)?;
                }
            }
            created_at_ms = existing.created_at_ms;
        }

        let mut definition = RepeatDefinition {
            spec,
            payload,
            max_attempts,
            timeout_ms,
            pending: None,
            created_at_ms,
        };
        let job = self.materialize(&mut definition, &schedule, now_ms())?;

        info!(
            key = %definition.spec.key,
            cron = %definition.spec.cron,
            timezone = %definition.spec.timezone,
            job_id = job.id,
            next_run_ms = job.available_at_ms,
            "Repeat registered"
        );
        Ok(job)
    }

    fn pending_instance(&self, definition: &RepeatDefinition) -> Result<Option<Job>, BrokerError> {
        let Some(id) = definition.pending else {
            return Ok(None);
        };
        Ok(self
            .inner
            .store
            .get(id)?
            .filter(|job| job.status == JobStatus::Waiting))
    }

    /// Create the instance for the first firing after `after_ms`
    fn materialize(
        &self,
        definition: &mut RepeatDefinition,
        schedule: &CronSchedule,
        after_ms: i64,
    ) -> Result<Job, BrokerError> {
        let store = &self.inner.store;
        let run_at = schedule.next_after_ms(after_ms)?;
        let id = store.next_id()?;
        let options = JobOptions::new(definition.max_attempts, Duration::from_millis(definition.timeout_ms))
            .with_repeat(definition.spec.clone());
        let job = Job::new(id, definition.payload.clone(), &options, run_at);

        definition.pending = Some(id);
        store.put_repeat_instance(&job, None, definition)?;
        self.inner.metrics.job_enqueued();
        self.wake(job.stage);

        Ok(job)
    }

    /// Register the handler of `stage` and start its workers
    pub async fn process(&self, stage: Stage, handler: Arc<dyn StageHandler>) -> Result<(), BrokerError> {
        if *self.inner.shutdown.borrow() {
            return Err(BrokerError::ShuttingDown);
        }
        if !self.inner.registered.lock().await.insert(stage) {
            return Err(BrokerError::HandlerAlreadyRegistered(stage));
        }

        let slots = self.inner.config.worker_slots.max(1);
        let mut workers = self.inner.workers.lock().await;
        for slot in 0..slots {
            let broker = self.clone();
            let handler = handler.clone();
            workers.push(tokio::spawn(broker.run_worker(stage, slot, handler)));
        }

        info!(%stage, slots, "Stage handler registered");
        Ok(())
    }

    async fn run_worker(self, stage: Stage, slot: usize, handler: Arc<dyn StageHandler>) {
        let worker = format!("{}:{}:{}", self.inner.instance, stage, slot);
        let mut shutdown = self.inner.shutdown.subscribe();
        debug!(%worker, "Worker started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            match self.claim(stage, &worker).await {
                Ok(Some(job)) => self.run_job(job, handler.clone()).await,
                Ok(None) => {
                    self.resume_repeats().await;
                    let wait = self.idle_wait(stage);
                    tokio::select! {
                        _ = self.inner.wakers[&stage].notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(%worker, error = %e, "Failed to claim job");
                    tokio::time::sleep(self.inner.config.poll_interval).await;
                }
            }
        }

        debug!(%worker, "Worker stopped");
    }

    /// Take the earliest due Waiting job of `stage`, if any
    async fn claim(&self, stage: Stage, worker: &str) -> Result<Option<Job>, BrokerError> {
        let _guard = self.inner.write_lock.lock().await;
        let store = &self.inner.store;
        let now = now_ms();

        let Some((id, available_at_ms)) = store.first_waiting(stage)? else {
            return Ok(None);
        };
        if available_at_ms > now {
            return Ok(None);
        }

        let waiting = store.get(id)?.ok_or(QueueError::JobNotFound(id))?;
        if !self.inner.active.lock().await.insert(id) {
            warn!(job_id = id, "Job already active, skipping claim");
            return Ok(None);
        }

        let mut job = waiting.clone();
        job.status = JobStatus::Active;
        job.lock = Some(JobLock {
            token: Uuid::now_v7(),
            worker: worker.to_string(),
            acquired_at_ms: now,
        });

        if let Err(e) = store.put(&job, Some(&waiting)) {
            self.inner.active.lock().await.remove(&id);
            return Err(e.into());
        }

        if let Some(spec) = &job.repeat {
            if let Err(e) = self.schedule_next(spec, &job, now) {
                self.inner.repeats_stalled.store(true, Ordering::Release);
                error!(
                    job_id = job.id,
                    key = %spec.key,
                    error = %e,
                    "Failed to schedule next repeat instance, will retry while idle"
                );
            }
        }

        debug!(job_id = job.id, %stage, %worker, "Job claimed");
        Ok(Some(job))
    }

    fn schedule_next(&self, spec: &RepeatSpec, claimed: &Job, now: i64) -> Result<(), BrokerError> {
        let Some(mut definition) = self.inner.store.get_repeat(&spec.key)? else {
            return Ok(());
        };
        // Only the instance the definition points at advances the chain
        if definition.pending != Some(claimed.id) {
            return Ok(());
        }

        let schedule = definition.schedule()?;
        let next = self.materialize(&mut definition, &schedule, now.max(claimed.available_at_ms))?;
        debug!(
            key = %spec.key,
            job_id = next.id,
            next_run_ms = next.available_at_ms,
            "Next repeat instance scheduled"
        );
        Ok(())
    }

    /// Give every repeat without a waiting instance a new one
    async fn resume_repeats(&self) {
        if !self.inner.repeats_stalled.swap(false, Ordering::AcqRel) {
            return;
        }

        let _guard = self.inner.write_lock.lock().await;
        if let Err(e) = self.rematerialize_orphans() {
            self.inner.repeats_stalled.store(true, Ordering::Release);
            warn!(error = %e, "Repeat schedule still broken, retrying on next idle loop");
        }
    }

    fn rematerialize_orphans(&self) -> Result<(), BrokerError> {
        for (key, mut definition) in self.inner.store.repeats()? {
            if self.pending_instance(&definition)?.is_some() {
                continue;
            }
            let schedule = definition.schedule()?;
            let job = self.materialize(&mut definition, &schedule, now_ms())?;
            warn!(
                %key,
                job_id = job.id,
                next_run_ms = job.available_at_ms,
                "Repeat schedule resumed, missed firings skipped"
            );
        }
        Ok(())
    }

    fn idle_wait(&self, stage: Stage) -> Duration {
        let poll = self.inner.config.poll_interval;
        match self.inner.store.first_waiting(stage) {
            Ok(Some((_, available_at_ms))) => {
                let delta = available_at_ms - now_ms();
                if delta <= 0 {
                    Duration::ZERO
                } else {
                    poll.min(Duration::from_millis(delta as u64))
                }
            }
            _ => poll,
        }
    }

    async fn run_job(&self, job: Job, handler: Arc<dyn StageHandler>) {
        let span = info_span!(
            "job",
            job_id = job.id,
            stage = %job.stage,
            attempt = job.attempts_made + 1
        );

        async {
            info!(max_attempts = job.max_attempts, "Processing job");

            let timeout = job.timeout();
            let task_job = job.clone();
            let task = tokio::spawn(
                async move { handler.handle(&task_job).await }.in_current_span(),
            );

            // Dropping the JoinHandle on timeout detaches the task; it is not aborted.
            let outcome = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(err))) => Err(AttemptFailure::Handler(err)),
                Ok(Err(join_err)) => Err(AttemptFailure::Panicked(join_err.to_string())),
                Err(_) => {
                    warn!(?timeout, "Handler timed out, leaving it running in the background");
                    Err(AttemptFailure::TimedOut(timeout))
                }
            };

            let finalized = match outcome {
                Ok(()) => self.complete(&job).await,
                Err(failure) => self.fail(&job, failure).await,
            };
            if let Err(e) = finalized {
                error!(error = %e, "Failed to finalize job");
            }

            self.inner.active.lock().await.remove(&job.id);
        }
        .instrument(span)
        .await
    }

    /// Load the stored job and check that `claimed` still owns it
    fn owned(&self, claimed: &Job) -> Result<Job, BrokerError> {
        let stored = self
            .inner
            .store
            .get(claimed.id)?
            .ok_or(QueueError::JobNotFound(claimed.id))?;

        let token = |job: &Job| job.lock.as_ref().map(|lock| lock.token);
        if stored.status != JobStatus::Active || token(&stored) != token(claimed) {
            return Err(BrokerError::LockMismatch(claimed.id));
        }
        Ok(stored)
    }

    async fn complete(&self, claimed: &Job) -> Result<(), BrokerError> {
        let _guard = self.inner.write_lock.lock().await;
        let stored = self.owned(claimed)?;

        let mut done = stored.clone();
        done.status = JobStatus::Completed;
        done.lock = None;
        done.finished_at_ms = Some(now_ms());
        self.inner.store.put(&done, Some(&stored))?;
        self.inner.metrics.job_completed();

        info!("Job completed");
        let _ = self.inner.events.send(BrokerEvent::Completed { job: done });
        Ok(())
    }

    async fn fail(&self, claimed: &Job, failure: AttemptFailure) -> Result<(), BrokerError> {
        let _guard = self.inner.write_lock.lock().await;
        let stored = self.owned(claimed)?;
        let reason = failure.to_string();

        let mut next = stored.clone();
        next.attempts_made += 1;
        next.lock = None;
        next.failed_reason = Some(reason.clone());

        if next.has_attempts_left() {
            let delay = self.inner.config.backoff(next.attempts_made);
            next.status = JobStatus::Waiting;
            next.available_at_ms = now_ms() + delay.as_millis() as i64;
            self.inner.store.put(&next, Some(&stored))?;
            self.inner.metrics.job_retried();

            warn!(
                attempts = next.attempts_made,
                max_attempts = next.max_attempts,
                ?delay,
                error = %reason,
                "Job attempt failed, will retry"
            );
            let _ = self.inner.events.send(BrokerEvent::Retrying {
                job: next,
                error: reason,
                delay,
            });
        } else {
            next.status = JobStatus::Failed;
            next.finished_at_ms = Some(now_ms());
            self.inner.store.put(&next, Some(&stored))?;
            self.inner.metrics.job_failed();

            error!(attempts = next.attempts_made, error = %reason, "Job failed");
            let _ = self.inner.events.send(BrokerEvent::Failed {
                job: next,
                error: reason,
            });
        }
        Ok(())
    }

    fn wake(&self, stage: Stage) {
        if let Some(waker) = self.inner.wakers.get(&stage) {
            waker.notify_one();
        }
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>, BrokerError> {
        Ok(self.inner.store.get(id)?)
    }

    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, BrokerError> {
        Ok(self.inner.store.list(status, limit)?)
    }

    pub fn counts(&self) -> Result<StatusCounts, BrokerError> {
        Ok(self.inner.store.counts()?)
    }

    pub fn repeats(&self) -> Result<BTreeMap<String, RepeatDefinition>, BrokerError> {
        Ok(self.inner.store.repeats()?)
    }

    /// Stop claiming, wait for in-flight handlers, flush the keyspace
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.inner.shutdown.send_replace(true);

        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        self.inner.store.flush()?;
        info!("Broker stopped");
        Ok(())
    }
}

#[async_trait]
impl JobSink for Broker {
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<Job, BrokerError> {
        Broker::enqueue(self, payload, options).await
    }
}

/// Return jobs left Active by a previous process to Waiting
fn recover_stalled(store: &JobStore) -> Result<(), BrokerError> {
    for stalled in store.jobs_with_status(JobStatus::Active)? {
        let mut job = stalled.clone();
        job.status = JobStatus::Waiting;
        job.lock = None;
        job.available_at_ms = now_ms();
        store.put(&job, Some(&stalled))?;
        warn!(job_id = job.id, stage = %job.stage, "Recovered stalled job");
    }
    Ok(())
}
