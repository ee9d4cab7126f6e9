//! Job submission: issue an id, hand the message to the broker, return.

use std::sync::Arc;

use super::{Broker, JobId, QueuedJob, TaskPayload};
use crate::error::Result;
use crate::observability::metrics::record_job_submitted;

/// Fire-and-forget submission of units of work.
///
/// A submitted job reads as PENDING from the moment the broker accepts it;
/// nothing is written to the result store until a worker claims it.
#[derive(Clone)]
pub struct JobSubmitter {
    broker: Arc<dyn Broker>,
}

impl JobSubmitter {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Enqueue `payload` under a fresh id.
    pub async fn submit(&self, payload: TaskPayload) -> Result<JobId> {
        self.submit_with_id(JobId::new(), payload).await
    }

    /// Enqueue `payload` under a caller-chosen id. Resubmitting an id the
    /// broker still holds is a no-op.
    pub async fn submit_with_id(&self, id: JobId, payload: TaskPayload) -> Result<JobId> {
        let kind = payload.kind();
        self.broker.enqueue(QueuedJob::new(id, payload)).await?;
        record_job_submitted(kind.as_str());
        tracing::info!(job_id = %id, kind = %kind, "Job submitted");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::{BatchRequest, TaskPayload};
    use crate::jobs::{InMemoryBroker, Visibility};

    #[tokio::test]
    async fn test_submit_returns_unique_ids_and_enqueues() {
        let broker = Arc::new(InMemoryBroker::default());
        let submitter = JobSubmitter::new(broker.clone());

        let payload = TaskPayload::DispatchBatch(BatchRequest { items: vec![] });
        let a = submitter.submit(payload.clone()).await.unwrap();
        let b = submitter.submit(payload).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(broker.visibility(a).await.unwrap(), Visibility::Queued);
        assert_eq!(broker.visibility(b).await.unwrap(), Visibility::Queued);
    }
}
