#![allow(clippy::result_large_err)]
//! # Transmute Core
//!
//! Asynchronous image conversion with batch fan-out and fan-in.
//!
//! ## Architecture
//!
//! - **Jobs**: Broker, worker envelope (retries, time limits, late ack), status queries
//! - **Batch**: Atomic dispatch of up to 50 member jobs, composite status, ZIP packaging
//! - **Store**: Key-value result store with TTL, in-memory or Redis
//! - **Convert**: External-tool converter behind a trait
//! - **API**: HTTP surface for submission, status and downloads
//! - **Observability**: Structured logging, tracing export and Prometheus metrics

pub mod api;
pub mod batch;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod store;
pub mod validation;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, TransmuteError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::batch::{
        BatchAggregator, BatchOrchestrator, BatchStatus, BatchSummary, BatchView, MemberState,
        ResultPackager,
    };
    pub use crate::config::Config;
    pub use crate::convert::{CommandConverter, ConvertError, Converter};
    pub use crate::engine::Engine;
    pub use crate::error::{ErrorCode, ErrorContext, Result, TransmuteError};
    pub use crate::jobs::{
        Broker, ConversionOptions, ConvertRequest, JobId, JobStatus, JobSubmitter, OutputFormat,
        StatusQuery, TaskPayload, WorkerPool,
    };
    pub use crate::store::{JobStore, ResultStore};
}
