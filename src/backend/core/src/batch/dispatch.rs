//! Batch fan-out: the unit of work behind a batch job.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::TransmuteError;
use crate::jobs::{
    BatchRecord, Broker, FailureCategory, JobContext, JobFailure, JobFault, JobId, JobKind,
    JobOutput, Outcome, QueuedJob, TaskPayload, UnitOfWork, UnitResult,
};
use crate::observability::metrics::record_batch_dispatched;

/// Enqueues every member of a batch in one atomic broker call and records
/// the batch to member mapping as the batch job's own result.
///
/// Member ids derive from the batch id and position, so a redelivered
/// dispatch re-enqueues the same ids and the broker drops the duplicates.
pub struct BatchDispatchUnit {
    broker: Arc<dyn Broker>,
    max_items: usize,
}

impl BatchDispatchUnit {
    pub fn new(broker: Arc<dyn Broker>, max_items: usize) -> Self {
        Self { broker, max_items }
    }
}

#[async_trait]
impl UnitOfWork for BatchDispatchUnit {
    fn kind(&self) -> JobKind {
        JobKind::DispatchBatch
    }

    async fn run(&self, payload: &TaskPayload, ctx: &JobContext) -> UnitResult {
        let TaskPayload::DispatchBatch(request) = payload else {
            return Err(JobFault::fatal("Batch dispatch received a non-batch payload"));
        };

        let count = request.items.len();
        if count == 0 {
            return Ok(Outcome::Error(JobFailure::new(
                FailureCategory::LimitExceeded,
                "Batch contains no files",
            )));
        }
        if count > self.max_items {
            let error = TransmuteError::batch_too_large(count, self.max_items);
            return Ok(Outcome::Error(JobFailure::new(
                FailureCategory::LimitExceeded,
                error.user_message(),
            )));
        }

        let batch_id = ctx.job_id();
        ctx.report_progress(0, format!("Dispatching {} files", count))
            .await;

        let mut record = BatchRecord {
            batch_id,
            total: count,
            job_ids: Vec::with_capacity(count),
            filenames: Vec::with_capacity(count),
        };
        let members: Vec<QueuedJob> = request
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let id = JobId::member_of(batch_id, index);
                record.job_ids.push(id);
                record.filenames.push(item.filename.clone());
                QueuedJob::new(id, TaskPayload::Convert(item.clone()))
            })
            .collect();

        match self.broker.enqueue_many(members).await {
            Ok(()) => {
                record_batch_dispatched(count as u64);
                tracing::info!(batch_id = %batch_id, total = count, "Batch dispatched");
                Ok(Outcome::Success(JobOutput::Batch(record)))
            }
            Err(e) if e.is_retryable() => Err(JobFault::from(e)),
            Err(e) => Ok(Outcome::Error(JobFailure::new(
                FailureCategory::Dispatch,
                format!("Batch dispatch failed: {}", e.user_message()),
            ))),
        }
    }
}
