//! Batch fan-in: composite status derived from member states on every read.
//!
//! Nothing here is cached. Each call re-reads every member, so the composite
//! can lag a member by at most the duration of one read.

use serde::Serialize;
use std::fmt;
use std::time::Instant;

use crate::error::{ErrorCode, Result, TransmuteError};
use crate::jobs::{
    BatchRecord, ConversionOutput, FailureCategory, JobFailure, JobId, JobOutput, JobStatus,
    Progress, StatusQuery,
};
use crate::observability::metrics::record_aggregation;

/// Composite status of a dispatched batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Processing,
    Success,
    Failure,
    Partial,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Partial => "PARTIAL",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite status and percent from member counts.
///
/// Any member not yet terminal keeps the batch PROCESSING; otherwise the mix
/// of successes and failures decides.
pub fn derive_status(total: usize, completed: usize, failed: usize) -> (BatchStatus, u8) {
    let done = completed + failed;
    if done < total {
        let percent = (done * 100 / total) as u8;
        (BatchStatus::Processing, percent)
    } else if failed == 0 {
        (BatchStatus::Success, 100)
    } else if completed == 0 {
        (BatchStatus::Failure, 100)
    } else {
        (BatchStatus::Partial, 100)
    }
}

/// One member's state as seen by the last read.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberState {
    Pending,
    Processing(Option<Progress>),
    Succeeded(ConversionOutput),
    Failed(JobFailure),
}

impl MemberState {
    fn from_lookup(status: Option<JobStatus>) -> Self {
        match status {
            Some(JobStatus::Pending) => Self::Pending,
            Some(JobStatus::Processing(progress)) => Self::Processing(progress),
            Some(JobStatus::Success(JobOutput::Conversion(output))) => Self::Succeeded(output),
            Some(JobStatus::Success(JobOutput::Batch(_))) => Self::Failed(JobFailure::new(
                FailureCategory::Fault,
                "Member produced a batch record instead of a conversion",
            )),
            Some(JobStatus::Failure(failure)) => Self::Failed(failure),
            // Expired or never written; it can no longer succeed.
            None => Self::Failed(JobFailure::new(
                FailureCategory::Expired,
                "Result expired or not found",
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing(_) => "PROCESSING",
            Self::Succeeded(_) => "SUCCESS",
            Self::Failed(_) => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberStatus {
    pub job_id: JobId,
    pub filename: String,
    pub state: MemberState,
}

/// Result of one aggregation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub batch_id: JobId,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub percent: u8,
    /// In dispatch order
    pub members: Vec<MemberStatus>,
}

impl BatchSummary {
    pub fn from_members(batch_id: JobId, members: Vec<MemberStatus>) -> Self {
        let total = members.len();
        let completed = members
            .iter()
            .filter(|m| matches!(m.state, MemberState::Succeeded(_)))
            .count();
        let failed = members
            .iter()
            .filter(|m| matches!(m.state, MemberState::Failed(_)))
            .count();
        let (status, percent) = derive_status(total, completed, failed);

        Self {
            batch_id,
            status,
            total,
            completed,
            failed,
            pending: total - completed - failed,
            percent,
            members,
        }
    }

    pub fn message(&self) -> String {
        match self.status {
            BatchStatus::Processing => format!(
                "Processing {} files. {} completed, {} failed.",
                self.pending, self.completed, self.failed
            ),
            BatchStatus::Success => {
                format!("All {} files converted successfully.", self.completed)
            }
            BatchStatus::Failure => format!("All {} files failed to convert.", self.failed),
            BatchStatus::Partial => format!(
                "Batch completed with {} successes and {} failures.",
                self.completed, self.failed
            ),
        }
    }

    /// Outputs of the members that succeeded, in dispatch order.
    pub fn successful_outputs(&self) -> impl Iterator<Item = &ConversionOutput> {
        self.members.iter().filter_map(|m| match &m.state {
            MemberState::Succeeded(output) => Some(output),
            _ => None,
        })
    }
}

/// What a batch id currently resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchView {
    /// The dispatch job is still PENDING or PROCESSING
    Dispatching(JobStatus),
    /// The dispatch job itself failed; no member exists
    DispatchFailed(JobFailure),
    Dispatched(BatchSummary),
}

/// Polls member jobs to build batch summaries.
#[derive(Clone)]
pub struct BatchAggregator {
    status: StatusQuery,
}

impl BatchAggregator {
    pub fn new(status: StatusQuery) -> Self {
        Self { status }
    }

    pub async fn view(&self, batch_id: JobId) -> Result<BatchView> {
        let status = match self.status.lookup(batch_id).await? {
            Some(status) => status,
            None => return Err(TransmuteError::batch_not_found(batch_id)),
        };

        match status {
            JobStatus::Pending | JobStatus::Processing(_) => Ok(BatchView::Dispatching(status)),
            JobStatus::Failure(failure) => Ok(BatchView::DispatchFailed(failure)),
            JobStatus::Success(JobOutput::Batch(record)) => {
                Ok(BatchView::Dispatched(self.summarize(&record).await?))
            }
            JobStatus::Success(JobOutput::Conversion(_)) => Err(TransmuteError::new(
                ErrorCode::NotABatch,
                format!("Job {} is a single conversion, not a batch", batch_id),
            )),
        }
    }

    /// Read every member once, concurrently, and derive the composite.
    pub async fn summarize(&self, record: &BatchRecord) -> Result<BatchSummary> {
        let started = Instant::now();
        let statuses = self.status.lookup_many(&record.job_ids).await?;

        let members = record
            .members()
            .zip(statuses)
            .map(|((job_id, filename), status)| MemberStatus {
                job_id,
                filename: filename.to_string(),
                state: MemberState::from_lookup(status),
            })
            .collect();

        let summary = BatchSummary::from_members(record.batch_id, members);
        record_aggregation(started.elapsed().as_secs_f64());
        tracing::debug!(
            batch_id = %record.batch_id,
            status = %summary.status,
            completed = summary.completed,
            failed = summary.failed,
            pending = summary.pending,
            "Batch aggregated"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::OutputFormat;

    #[test]
    fn test_derive_status_priority() {
        assert_eq!(derive_status(3, 1, 0), (BatchStatus::Processing, 33));
        assert_eq!(derive_status(3, 1, 1), (BatchStatus::Processing, 66));
        assert_eq!(derive_status(50, 0, 0), (BatchStatus::Processing, 0));
        assert_eq!(derive_status(3, 3, 0), (BatchStatus::Success, 100));
        assert_eq!(derive_status(3, 0, 3), (BatchStatus::Failure, 100));
        assert_eq!(derive_status(3, 2, 1), (BatchStatus::Partial, 100));
    }

    #[test]
    fn test_percent_floors() {
        // 2/3 is 66.67
        assert_eq!(derive_status(3, 2, 0).1, 66);
        assert_eq!(derive_status(7, 1, 0).1, 14);
        assert_eq!(derive_status(50, 49, 0).1, 98);
    }

    fn member(state: MemberState) -> MemberStatus {
        MemberStatus {
            job_id: JobId::new(),
            filename: "a.heic".into(),
            state,
        }
    }

    #[test]
    fn test_summary_messages() {
        let ok = || {
            member(MemberState::Succeeded(ConversionOutput::new(
                vec![1],
                OutputFormat::Jpeg,
                "a_converted.jpg",
            )))
        };
        let bad = || member(MemberState::Failed(JobFailure::conversion("corrupt")));

        let processing =
            BatchSummary::from_members(JobId::new(), vec![ok(), bad(), member(MemberState::Pending)]);
        assert_eq!(processing.status, BatchStatus::Processing);
        assert_eq!(processing.message(), "Processing 1 files. 1 completed, 1 failed.");

        let partial = BatchSummary::from_members(JobId::new(), vec![ok(), bad(), ok()]);
        assert_eq!(
            partial.message(),
            "Batch completed with 2 successes and 1 failures."
        );
        assert_eq!(partial.successful_outputs().count(), 2);

        let success = BatchSummary::from_members(JobId::new(), vec![ok(), ok()]);
        assert_eq!(success.message(), "All 2 files converted successfully.");

        let failure = BatchSummary::from_members(JobId::new(), vec![bad()]);
        assert_eq!(failure.message(), "All 1 files failed to convert.");
    }

    #[test]
    fn test_missing_member_counts_as_failed() {
        let state = MemberState::from_lookup(None);
        match state {
            MemberState::Failed(failure) => assert_eq!(failure.category, FailureCategory::Expired),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
