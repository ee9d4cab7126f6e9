//! Status query: read-only view of a job from the result store and the broker.

use serde::Serialize;
use std::sync::Arc;

use super::{Broker, JobFailure, JobId, JobOutput, JobRecord, JobState, Progress, Visibility};
use crate::error::{Result, TransmuteError};
use crate::store::JobStore;

/// Observable state of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing(Option<Progress>),
    Success(JobOutput),
    Failure(JobFailure),
}

impl JobStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing(_) => "PROCESSING",
            Self::Success(_) => "SUCCESS",
            Self::Failure(_) => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failure(_))
    }
}

impl From<JobRecord> for JobStatus {
    fn from(record: JobRecord) -> Self {
        match record.state {
            JobState::Pending => Self::Pending,
            JobState::Processing => Self::Processing(record.progress),
            JobState::Success(output) => Self::Success(output),
            JobState::Failure(failure) => Self::Failure(failure),
        }
    }
}

/// Derives job status; never mutates anything.
#[derive(Clone)]
pub struct StatusQuery {
    store: JobStore,
    broker: Arc<dyn Broker>,
}

impl StatusQuery {
    pub fn new(store: JobStore, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    /// Status of `id`, or `JobNotFound` when neither collaborator knows it.
    pub async fn status(&self, id: JobId) -> Result<JobStatus> {
        self.lookup(id)
            .await?
            .ok_or_else(|| TransmuteError::job_not_found(id))
    }

    /// `None` means the record expired or never existed.
    pub async fn lookup(&self, id: JobId) -> Result<Option<JobStatus>> {
        if let Some(record) = self.store.load(id).await? {
            return Ok(Some(record.into()));
        }
        self.resolve_missing(id).await
    }

    /// Statuses for many jobs with one store round trip, in the order of `ids`.
    pub async fn lookup_many(&self, ids: &[JobId]) -> Result<Vec<Option<JobStatus>>> {
        let records = self.store.load_many(ids).await?;
        let resolved = ids.iter().zip(records).map(|(id, record)| async move {
            match record {
                Some(record) => Ok(Some(JobStatus::from(record))),
                None => self.resolve_missing(*id).await,
            }
        });
        futures::future::try_join_all(resolved).await
    }

    /// No record: ask the broker whether the job is still queued.
    async fn resolve_missing(&self, id: JobId) -> Result<Option<JobStatus>> {
        match self.broker.visibility(id).await? {
            Visibility::Queued | Visibility::InFlight => Ok(Some(JobStatus::Pending)),
            Visibility::Unknown => {
                // A worker may have committed and acked between the two reads.
                Ok(self.store.load(id).await?.map(JobStatus::from))
            }
        }
    }
}
