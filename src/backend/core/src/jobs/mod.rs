//! Job lifecycle: submission, execution envelope, status.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Job Lifecycle                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  │
//! │  │  Submitter  │───▶│   Broker    │───▶│   Worker    │───▶│   Result    │  │
//! │  │  (JobId)    │    │ (visibility │    │ (envelope,  │    │   Store     │  │
//! │  │             │    │  timeout)   │◀───│  late ack)  │    │   (TTL)     │  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘  │
//! │                            │                                    │          │
//! │                            ▼                                    ▼          │
//! │                     ┌──────────────────────────────────────────────┐       │
//! │                     │    StatusQuery (store first, then broker)    │       │
//! │                     └──────────────────────────────────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! States only move forward: PENDING → PROCESSING → {SUCCESS, FAILURE}.
//! PENDING is never stored; it is what a job reads as while the broker still
//! holds it and no worker has written a record.

pub mod job;
pub mod payload;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod status;
pub mod submit;
pub mod worker;

pub use job::{
    BackoffStrategy, FailureCategory, JobContext, JobFailure, JobFault, JobId, JobKind,
    JobRecord, JobState, Outcome, Progress, RetryPolicy, TimeLimits, UnitOfWork, UnitResult,
};
pub use payload::{
    BatchRecord, BatchRequest, ConversionOptions, ConversionOutput, ConvertRequest, JobOutput,
    OutputFormat, TaskPayload,
};
pub use pool::{PoolHandle, WorkerPool};
pub use queue::{
    Broker, Delivery, InMemoryBroker, QueueStats, QueuedJob, RedisBroker, Visibility,
};
pub use registry::UnitRegistry;
pub use status::{JobStatus, StatusQuery};
pub use submit::JobSubmitter;
pub use worker::{Worker, WorkerExit, WorkerSettings, WorkerStats};
