//! Batch orchestration.
//!
//! A batch is itself a job. Its unit of work fans the items out into member
//! jobs and stores the member list as its result; the batch's composite
//! status is then derived from the members on every read.
//!
//! ```text
//!   submit ──▶ dispatch job ──▶ member 0 ─┐
//!                         ├──▶ member 1 ─┼──▶ aggregate ──▶ PROCESSING | SUCCESS
//!                         └──▶ member N ─┘                   FAILURE | PARTIAL
//! ```

pub mod aggregate;
pub mod dispatch;
pub mod package;

pub use aggregate::{
    derive_status, BatchAggregator, BatchStatus, BatchSummary, BatchView, MemberState,
    MemberStatus,
};
pub use dispatch::BatchDispatchUnit;
pub use package::{Archive, ResultPackager};

use crate::error::{Result, TransmuteError};
use crate::jobs::{BatchRequest, ConvertRequest, JobId, JobSubmitter, TaskPayload};

/// Entry point for batch submission and queries.
#[derive(Clone)]
pub struct BatchOrchestrator {
    submitter: JobSubmitter,
    aggregator: BatchAggregator,
    max_items: usize,
}

impl BatchOrchestrator {
    pub fn new(submitter: JobSubmitter, aggregator: BatchAggregator, max_items: usize) -> Self {
        Self {
            submitter,
            aggregator,
            max_items,
        }
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Submit the dispatch job for `items`, in order. Returns the batch id.
    pub async fn submit(&self, items: Vec<ConvertRequest>) -> Result<JobId> {
        if items.is_empty() {
            return Err(TransmuteError::validation("No files provided"));
        }
        if items.len() > self.max_items {
            return Err(TransmuteError::batch_too_large(items.len(), self.max_items));
        }

        let total = items.len();
        let batch_id = self
            .submitter
            .submit(TaskPayload::DispatchBatch(BatchRequest { items }))
            .await?;
        tracing::info!(batch_id = %batch_id, total, "Batch submitted");
        Ok(batch_id)
    }

    /// Current view of a batch, re-aggregated from its members.
    pub async fn view(&self, batch_id: JobId) -> Result<BatchView> {
        self.aggregator.view(batch_id).await
    }

    pub fn packager(&self) -> ResultPackager {
        ResultPackager::new(self.aggregator.clone())
    }
}
