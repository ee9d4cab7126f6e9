//! Worker execution envelope.
//!
//! A worker claims one delivery at a time and drives it through
//! PROCESSING to a terminal state:
//!
//! 1. Record PROCESSING with the progress stub, unless the record is already terminal
//! 2. Run the unit of work under the soft and hard time limits
//! 3. Retry transient faults with exponential backoff while the claim is held
//! 4. Commit SUCCESS or FAILURE, then ack
//!
//! The ack always follows the commit, so a crash anywhere before it leaves the
//! message with the broker for redelivery.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    Broker, Delivery, FailureCategory, JobContext, JobFailure, JobFault, JobRecord, Outcome,
    Progress, RetryPolicy, BackoffStrategy, TaskPayload, TimeLimits, UnitOfWork, UnitRegistry,
};
use crate::config::{QueueConfig, WorkerConfig};
use crate::error::{Result, TransmuteError};
use crate::observability::metrics::{record_job_finished, record_retry, set_active_jobs};
use crate::store::JobStore;

/// Per-worker execution settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub name: String,
    pub limits: TimeLimits,
    pub retry: RetryPolicy,
    /// Longest idle wait between empty claims
    pub poll_interval: Duration,
    /// Jobs run before the worker is recycled
    pub max_jobs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: "transmute-worker".to_string(),
            limits: TimeLimits::default(),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(250),
            max_jobs: 50,
        }
    }
}

impl WorkerSettings {
    pub fn from_config(worker: &WorkerConfig, queue: &QueueConfig) -> Self {
        Self {
            name: "transmute-worker".to_string(),
            limits: TimeLimits {
                soft: worker.soft_time_limit,
                hard: worker.hard_time_limit,
            },
            retry: RetryPolicy {
                max_retries: worker.max_retries,
                backoff: BackoffStrategy::exponential(
                    worker.retry_backoff_base,
                    worker.retry_backoff_max,
                ),
            },
            poll_interval: queue.poll_interval,
            max_jobs: worker.max_jobs_per_worker,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Longest a single delivery can be held: every run hits the hard limit
    /// and every retry waits its full backoff.
    pub fn worst_case_run(&self) -> Duration {
        let runs = self.retry.max_retries.saturating_add(1);
        let backoff: Duration = (0..self.retry.max_retries)
            .map(|retry| self.retry.next_retry_delay(retry))
            .sum();
        self.limits.hard.saturating_mul(runs).saturating_add(backoff)
    }
}

/// Counters shared by every worker of a pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub retried: Arc<AtomicU64>,
    pub redelivered: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn redelivered(&self) -> u64 {
        self.redelivered.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn job_started(&self) {
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        set_active_jobs(active);
    }

    fn job_ended(&self) {
        let active = self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        set_active_jobs(active);
    }
}

/// Why a worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Hit `max_jobs`; the pool replaces it
    Recycled,
    Shutdown,
}

/// How one execution of a unit of work ended.
enum Attempt {
    Finished(Outcome),
    Faulted(JobFault),
    TimedOut,
}

/// Claims deliveries and runs them through the execution envelope.
pub struct Worker {
    settings: WorkerSettings,
    broker: Arc<dyn Broker>,
    store: JobStore,
    registry: Arc<UnitRegistry>,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        broker: Arc<dyn Broker>,
        store: JobStore,
        registry: Arc<UnitRegistry>,
    ) -> Self {
        Self {
            settings,
            broker,
            store,
            registry,
            stats: WorkerStats::new(),
        }
    }

    pub fn with_stats(mut self, stats: WorkerStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Claim and process deliveries until recycled or cancelled.
    ///
    /// Cancellation is observed between jobs; a job in progress always runs
    /// to its commit.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerExit {
        let mut completed: u64 = 0;
        tracing::info!(worker = %self.settings.name, broker = self.broker.name(), "Worker started");

        let exit = loop {
            if completed >= self.settings.max_jobs {
                break WorkerExit::Recycled;
            }
            if shutdown.is_cancelled() {
                break WorkerExit::Shutdown;
            }

            match self.broker.claim().await {
                Ok(Some(delivery)) => {
                    let id = delivery.id();
                    if let Err(e) = self.process(delivery).await {
                        e.log();
                        tracing::warn!(
                            worker = %self.settings.name,
                            job_id = %id,
                            "Delivery left unacked for redelivery"
                        );
                    }
                    completed += 1;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break WorkerExit::Shutdown,
                        _ = self.broker.wait_for_work(self.settings.poll_interval) => {}
                    }
                }
                Err(e) => {
                    e.log();
                    tokio::select! {
                        _ = shutdown.cancelled() => break WorkerExit::Shutdown,
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        };

        tracing::info!(
            worker = %self.settings.name,
            completed,
            exit = ?exit,
            "Worker stopped"
        );
        exit
    }

    /// Run one delivery through the envelope.
    ///
    /// Returns an error, leaving the delivery unacked, when a state could not
    /// be committed.
    pub async fn process(&self, delivery: Delivery) -> Result<()> {
        let id = delivery.id();
        let kind = delivery.job.payload.kind();

        if delivery.is_redelivery() {
            self.stats.redelivered.fetch_add(1, Ordering::Relaxed);
            tracing::info!(job_id = %id, deliveries = delivery.delivery_count, "Processing redelivered job");
        }

        let mut record = match self.store.load(id).await? {
            Some(record) if record.is_terminal() => {
                // Committed by an earlier delivery that died before its ack.
                tracing::debug!(job_id = %id, state = %record.state, "Job already terminal");
                self.broker.ack(id).await?;
                return Ok(());
            }
            Some(record) => record,
            None => JobRecord::pending(id, kind, delivery.job.enqueued_at),
        };

        record.mark_processing()?;
        self.store.save(&mut record).await?;

        self.stats.job_started();
        let started = Instant::now();
        let outcome = self.execute(&delivery.job.payload, &mut record).await;
        self.stats.job_ended();

        let label = match outcome {
            Outcome::Success(output) => {
                record.mark_succeeded(output)?;
                "success"
            }
            Outcome::Error(failure) => {
                tracing::warn!(
                    job_id = %id,
                    kind = %kind,
                    category = %failure.category,
                    error = %failure.message,
                    "Job failed"
                );
                record.mark_failed(failure)?;
                "failure"
            }
        };

        // A terminal state is written once. If another delivery of this job
        // committed while we ran, its result stands.
        if let Some(current) = self.store.load(id).await? {
            if current.is_terminal() {
                tracing::warn!(
                    job_id = %id,
                    state = %current.state,
                    discarded = label,
                    "Job already committed by another delivery"
                );
                self.broker.ack(id).await?;
                return Ok(());
            }
        }

        self.store.save(&mut record).await?;
        self.broker.ack(id).await?;

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        if label == "success" {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        record_job_finished(kind.as_str(), label, started.elapsed().as_secs_f64());
        tracing::info!(job_id = %id, kind = %kind, state = %record.state, attempts = record.attempts, "Job finished");
        Ok(())
    }

    /// Run attempts until an outcome is reached or the retry budget is spent.
    async fn execute(&self, payload: &TaskPayload, record: &mut JobRecord) -> Outcome {
        let Some(unit) = self.registry.get(record.kind) else {
            return Outcome::Error(JobFailure::new(
                FailureCategory::Fault,
                format!("No unit of work registered for '{}'", record.kind),
            ));
        };
        let payload = Arc::new(payload.clone());
        let mut retries_done = 0;

        loop {
            match self.attempt(unit.clone(), payload.clone(), record).await {
                Attempt::Finished(outcome) => return outcome,
                Attempt::TimedOut => {
                    let limit_ms = self.settings.limits.hard.as_millis() as u64;
                    let error = TransmuteError::time_limit_exceeded(limit_ms, limit_ms);
                    return Outcome::Error(JobFailure::new(
                        FailureCategory::TimeLimitExceeded,
                        error.user_message(),
                    ));
                }
                Attempt::Faulted(fault) => {
                    if !self.settings.retry.should_retry(retries_done, &fault) {
                        let category = if fault.retryable {
                            FailureCategory::RetriesExhausted
                        } else {
                            FailureCategory::Fault
                        };
                        return Outcome::Error(JobFailure::new(category, fault.message));
                    }

                    let delay = self.settings.retry.next_retry_delay(retries_done);
                    retries_done += 1;
                    tracing::warn!(
                        job_id = %record.id,
                        retry = retries_done,
                        delay_ms = delay.as_millis() as u64,
                        error = %fault,
                        "Transient fault, retrying"
                    );
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    record_retry(record.kind.as_str());

                    record.mark_retrying(delay);
                    if let Err(e) = self.store.save(record).await {
                        e.log();
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One execution under the time limits. Progress from the unit is
    /// persisted here so the worker stays the only writer of the record.
    async fn attempt(
        &self,
        unit: Arc<dyn UnitOfWork>,
        payload: Arc<TaskPayload>,
        record: &mut JobRecord,
    ) -> Attempt {
        let limits = self.settings.limits;
        let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(16);
        let (soft_tx, soft_rx) = watch::channel(false);
        let ctx = JobContext::new(record.id, record.kind, record.attempts, soft_rx)
            .with_progress_sender(progress_tx);

        let mut handle = tokio::spawn(async move { unit.run(&payload, &ctx).await });

        let soft = tokio::time::sleep(limits.soft);
        let hard = tokio::time::sleep(limits.hard);
        tokio::pin!(soft, hard);
        let mut soft_fired = false;

        loop {
            tokio::select! {
                joined = &mut handle => {
                    return match joined {
                        Ok(Ok(outcome)) => Attempt::Finished(outcome),
                        Ok(Err(fault)) => Attempt::Faulted(fault),
                        Err(e) => Attempt::Faulted(fault_from_join(e)),
                    };
                }
                Some(progress) = progress_rx.recv() => {
                    record.set_progress(progress);
                    if let Err(e) = self.store.save(record).await {
                        e.log();
                    }
                }
                _ = &mut soft, if !soft_fired => {
                    soft_fired = true;
                    tracing::warn!(job_id = %record.id, limit_secs = limits.soft.as_secs(), "Soft time limit reached");
                    let _ = soft_tx.send(true);
                }
                _ = &mut hard => {
                    handle.abort();
                    tracing::error!(job_id = %record.id, limit_secs = limits.hard.as_secs(), "Hard time limit reached, execution aborted");
                    return Attempt::TimedOut;
                }
            }
        }
    }
}

/// A panicking or cancelled unit is a non-retryable fault.
fn fault_from_join(error: JoinError) -> JobFault {
    if error.is_panic() {
        let message = panic_message(error.into_panic());
        JobFault::fatal(format!("Unit of work panicked: {}", message)).with_code("Panic")
    } else {
        JobFault::fatal("Unit of work was cancelled").with_code("Cancelled")
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
