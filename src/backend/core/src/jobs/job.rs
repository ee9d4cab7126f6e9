//! Job definitions and traits.
//!
//! This module provides the core abstractions of the job lifecycle:
//!
//! - **JobState**: PENDING, PROCESSING, SUCCESS(output), FAILURE(error)
//! - **JobRecord**: What the result store holds for one job
//! - **UnitOfWork**: The interface every kind of job implements
//! - **JobContext**: Progress reporting and soft-limit signalling during execution
//! - **RetryPolicy**: Retry budget and backoff for transient faults

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::payload::{JobOutput, TaskPayload};
use crate::error::{ErrorCode, TransmuteError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Deterministic id of the `index`-th member of a batch.
    ///
    /// Re-running a dispatch for the same batch yields the same member ids, so a
    /// redelivered dispatch cannot create a second set of jobs.
    pub fn member_of(batch: JobId, index: usize) -> Self {
        Self(Uuid::new_v5(&batch.0, &(index as u64).to_be_bytes()))
    }

    /// First eight characters, used in archive names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = TransmuteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TransmuteError::job_not_found(s))
    }
}

/// The kinds of unit of work the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Convert,
    DispatchBatch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::DispatchBatch => "dispatch_batch",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Progress
// ═══════════════════════════════════════════════════════════════════════════════

/// Progress metadata reported while a job is PROCESSING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// 0-100
    pub percent: u8,
    pub label: String,
}

impl Progress {
    pub fn new(percent: u8, label: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            label: label.into(),
        }
    }

    /// Stub written at claim time, before the unit of work runs.
    pub fn claimed() -> Self {
        Self::new(0, "Starting")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Failures
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a job ended in FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The unit of work returned a structured error
    Conversion,
    /// Batch fan-out could not be recorded
    Dispatch,
    /// The unit of work faulted with a non-retryable error
    Fault,
    /// Transient faults outlasted the retry budget
    RetriesExhausted,
    /// The hard wall-clock limit fired
    TimeLimitExceeded,
    /// A resource cap (such as batch size) was exceeded
    LimitExceeded,
    /// A batch member's record is gone (expired or never written)
    Expired,
}

impl FailureCategory {
    /// Name reported to clients as `error_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversion => "ConversionError",
            Self::Dispatch => "DispatchError",
            Self::Fault => "ExecutionFault",
            Self::RetriesExhausted => "RetriesExhausted",
            Self::TimeLimitExceeded => "TimeLimitExceeded",
            Self::LimitExceeded => "LimitExceeded",
            Self::Expired => "ResultExpired",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a FAILURE record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub category: FailureCategory,
}

impl JobFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category,
        }
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(FailureCategory::Conversion, message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job. Terminal states always carry their payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Processing,
    Success(JobOutput),
    Failure(JobFailure),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failure(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Success(_) => "SUCCESS",
            Self::Failure(_) => "FAILURE",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Success(_) | Self::Failure(_) => 2,
        }
    }

    /// PENDING -> PROCESSING -> {SUCCESS, FAILURE}; PROCESSING may be re-entered
    /// by a redelivered claim.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the result store knows about one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    #[serde(flatten)]
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    /// Executions started, including retries and redeliveries
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn pending(id: JobId, kind: JobKind, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            state: JobState::Pending,
            progress: None,
            attempts: 0,
            created_at,
            updated_at: created_at,
            expires_at: None,
        }
    }

    fn transition(&mut self, next: JobState) -> Result<(), TransmuteError> {
        if !self.state.can_transition_to(&next) {
            return Err(TransmuteError::new(
                ErrorCode::InvalidStateTransition,
                format!("Job {} cannot move from {} to {}", self.id, self.state, next),
            ));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Claimed by a worker: PROCESSING with the initial progress stub.
    pub fn mark_processing(&mut self) -> Result<(), TransmuteError> {
        self.transition(JobState::Processing)?;
        self.attempts += 1;
        self.progress = Some(Progress::claimed());
        Ok(())
    }

    /// Last write wins; only the owning worker calls this.
    pub fn set_progress(&mut self, progress: Progress) {
        self.progress = Some(progress);
        self.updated_at = Utc::now();
    }

    pub fn mark_retrying(&mut self, delay: Duration) {
        self.attempts += 1;
        self.set_progress(Progress::new(
            self.progress.as_ref().map(|p| p.percent).unwrap_or(0),
            format!("Retrying in {}ms", delay.as_millis()),
        ));
    }

    pub fn mark_succeeded(&mut self, output: JobOutput) -> Result<(), TransmuteError> {
        self.transition(JobState::Success(output))?;
        self.progress = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, failure: JobFailure) -> Result<(), TransmuteError> {
        self.transition(JobState::Failure(failure))?;
        self.progress = None;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Unit of Work Results
// ═══════════════════════════════════════════════════════════════════════════════

/// What a unit of work returns when it runs to completion.
///
/// `Error` is a normal, successful execution of the envelope that yields a
/// FAILURE record; it is never retried.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(JobOutput),
    Error(JobFailure),
}

/// An unexpected fault raised by a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFault {
    pub message: String,
    /// Transient faults (connectivity, timeouts) are retried with backoff
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl JobFault {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobFault {}

impl From<TransmuteError> for JobFault {
    fn from(error: TransmuteError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

/// Result type for one execution of a unit of work.
pub type UnitResult = std::result::Result<Outcome, JobFault>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// initial * multiplier^retry, capped at max
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 1_000,
            max_delay_ms: 600_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64) * multiplier.powi(retry as i32);
                delay.min(*max_delay_ms as f64) as u64
            }
        };
        Duration::from_millis(ms)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry behaviour for faults raised by a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first execution
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether a fault seen after `retries_done` retries earns another run.
    pub fn should_retry(&self, retries_done: u32, fault: &JobFault) -> bool {
        fault.retryable && retries_done < self.max_retries
    }

    pub fn next_retry_delay(&self, retries_done: u32) -> Duration {
        self.backoff.delay_for_retry(retries_done)
    }
}

/// Wall-clock limits for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimits {
    /// Warning point; the unit of work is told to wrap up
    pub soft: Duration,
    /// The execution is aborted and the job fails
    pub hard: Duration,
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(540),
            hard: Duration::from_secs(600),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a unit of work during execution.
pub struct JobContext {
    job_id: JobId,
    kind: JobKind,
    attempt: u32,
    progress_sender: Option<mpsc::Sender<Progress>>,
    soft_limit: watch::Receiver<bool>,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        kind: JobKind,
        attempt: u32,
        soft_limit: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job_id,
            kind,
            attempt,
            progress_sender: None,
            soft_limit,
        }
    }

    pub fn with_progress_sender(mut self, sender: mpsc::Sender<Progress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    /// Context with no envelope attached, for running a unit of work inline.
    pub fn detached(job_id: JobId, kind: JobKind) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(job_id, kind, 1, rx)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report progress; the envelope persists it.
    pub async fn report_progress(&self, percent: u8, label: impl Into<String>) {
        if let Some(ref sender) = self.progress_sender {
            let _ = sender.send(Progress::new(percent, label)).await;
        }
    }

    /// True once the soft time limit has passed.
    pub fn soft_limit_reached(&self) -> bool {
        *self.soft_limit.borrow()
    }

    /// Resolves when the soft time limit passes. Never resolves without an envelope.
    pub async fn soft_limit(&self) {
        let mut rx = self.soft_limit.clone();
        if rx.wait_for(|reached| *reached).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(job_id = %self.job_id, kind = %self.kind, attempt = self.attempt, message);
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(job_id = %self.job_id, kind = %self.kind, attempt = self.attempt, message);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Unit of Work Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A job implementation: input payload in, success or error result out.
///
/// Delivery is at-least-once, so `run` may be called again for the same job
/// after a crash; implementations must be safe to re-run.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// The payload kind this unit handles.
    fn kind(&self) -> JobKind;

    /// Execute once.
    ///
    /// Return `Outcome::Error` for failures that belong in the job result,
    /// `JobFault::retryable` for transient faults worth another attempt and
    /// `JobFault::fatal` for everything else.
    async fn run(&self, payload: &TaskPayload, ctx: &JobContext) -> UnitResult;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::{ConversionOutput, OutputFormat};

    fn success() -> JobState {
        JobState::Success(JobOutput::Conversion(ConversionOutput::new(
            vec![1, 2, 3],
            OutputFormat::Jpeg,
            "a_converted.jpg",
        )))
    }

    #[test]
    fn test_job_id() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);

        let parsed: JobId = id1.to_string().parse().unwrap();
        assert_eq!(parsed, id1);
        assert!("not-a-uuid".parse::<JobId>().is_err());
        assert_eq!(id1.short().len(), 8);
    }

    #[test]
    fn test_member_ids_are_deterministic() {
        let batch = JobId::new();
        assert_eq!(JobId::member_of(batch, 0), JobId::member_of(batch, 0));
        assert_ne!(JobId::member_of(batch, 0), JobId::member_of(batch, 1));
        assert_ne!(JobId::member_of(batch, 0), JobId::member_of(JobId::new(), 0));
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let failure = JobState::Failure(JobFailure::conversion("bad"));
        assert!(JobState::Pending.can_transition_to(&JobState::Processing));
        assert!(JobState::Processing.can_transition_to(&JobState::Processing));
        assert!(JobState::Processing.can_transition_to(&success()));
        assert!(JobState::Processing.can_transition_to(&failure));
        assert!(!JobState::Processing.can_transition_to(&JobState::Pending));
        assert!(!success().can_transition_to(&failure));
        assert!(!failure.can_transition_to(&JobState::Processing));
    }

    #[test]
    fn test_record_lifecycle() {
        let mut record = JobRecord::pending(JobId::new(), JobKind::Convert, Utc::now());
        record.mark_processing().unwrap();
        assert_eq!(record.state, JobState::Processing);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.progress, Some(Progress::claimed()));

        record.set_progress(Progress::new(50, "Converting image"));
        assert_eq!(record.progress.as_ref().unwrap().percent, 50);

        record.mark_failed(JobFailure::conversion("corrupt")).unwrap();
        assert!(record.is_terminal());
        assert!(record.progress.is_none());

        let err = record.mark_processing().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        let err = record.mark_succeeded(JobOutput::Batch(crate::jobs::payload::BatchRecord {
            batch_id: record.id,
            total: 0,
            job_ids: vec![],
            filenames: vec![],
        }));
        assert!(err.is_err());
    }

    #[test]
    fn test_record_serializes_state_tag() {
        let mut record = JobRecord::pending(JobId::new(), JobKind::Convert, Utc::now());
        record.mark_processing().unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "PROCESSING");

        record.mark_failed(JobFailure::conversion("corrupt")).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "FAILURE");
        assert_eq!(json["payload"]["category"], "conversion");

        let back: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffStrategy::exponential(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_retry(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_retry(3), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::default();
        let transient = JobFault::retryable("connection reset");
        let fatal = JobFault::fatal("panicked");

        assert!(policy.should_retry(0, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(0, &fatal));
        assert!(!RetryPolicy::no_retry().should_retry(0, &transient));
    }

    #[test]
    fn test_fault_from_error_keeps_retry_class() {
        let fault = JobFault::from(TransmuteError::new(ErrorCode::StoreUnavailable, "down"));
        assert!(fault.retryable);
        assert_eq!(fault.code.as_deref(), Some("StoreUnavailable"));

        let fault = JobFault::from(TransmuteError::validation("bad"));
        assert!(!fault.retryable);
    }

    #[tokio::test]
    async fn test_context_soft_limit_signal() {
        let (tx, rx) = watch::channel(false);
        let ctx = JobContext::new(JobId::new(), JobKind::Convert, 1, rx);
        assert!(!ctx.soft_limit_reached());
        tx.send(true).unwrap();
        ctx.soft_limit().await;
        assert!(ctx.soft_limit_reached());
    }

    #[tokio::test]
    async fn test_context_progress_is_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let ctx = JobContext::detached(JobId::new(), JobKind::Convert).with_progress_sender(tx);
        ctx.report_progress(150, "Converting image").await;
        assert_eq!(rx.recv().await, Some(Progress::new(100, "Converting image")));
    }
}
