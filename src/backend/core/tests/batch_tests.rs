//! Integration tests for batch dispatch, aggregation and packaging.

mod common;

use std::io::{Cursor, Read};
use std::time::Duration;

use common::{
    engine, patient_config, request, test_config, wait_for_batch, wait_for_job, ScriptedConverter,
};
use transmute_core::batch::{BatchStatus, BatchSummary, BatchView, MemberState};
use transmute_core::error::ErrorCode;
use transmute_core::jobs::{JobId, JobStatus, QueuedJob, TaskPayload};

fn finished(view: &BatchView) -> bool {
    matches!(view, BatchView::Dispatched(s) if s.status != BatchStatus::Processing)
}

fn summary(view: BatchView) -> BatchSummary {
    match view {
        BatchView::Dispatched(summary) => summary,
        other => panic!("batch not dispatched: {:?}", other),
    }
}

fn zip_entries(bytes: &[u8]) -> Vec<(String, String)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut file = archive.by_index(i).unwrap();
            let mut contents = String::new();
            file.read_to_string(&mut contents).unwrap();
            (file.name().to_string(), contents)
        })
        .collect()
}

// ============================================================================
// Aggregation
// ============================================================================

#[tokio::test]
async fn test_mixed_batch_is_partial_and_packages_successes() {
    let converter = ScriptedConverter::new();
    let engine = engine(test_config(), converter.clone());
    let pool = engine.start_workers();

    let batch_id = engine
        .batches()
        .submit(vec![request("a.heic"), request("bad.heic"), request("c.heic")])
        .await
        .unwrap();

    let summary = summary(wait_for_batch(&engine, batch_id, finished).await);
    assert_eq!(summary.status, BatchStatus::Partial);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.percent, 100);
    assert_eq!(
        summary.message(),
        "Batch completed with 2 successes and 1 failures."
    );

    let names: Vec<&str> = summary.members.iter().map(|m| m.filename.as_str()).collect();
    assert_eq!(names, vec!["a.heic", "bad.heic", "c.heic"]);
    assert_eq!(summary.members[1].job_id, JobId::member_of(batch_id, 1));
    match &summary.members[1].state {
        MemberState::Failed(failure) => assert_eq!(failure.message, "not a valid image"),
        other => panic!("unexpected member state {:?}", other),
    }

    let archive = engine.batches().packager().package(batch_id).await.unwrap();
    assert_eq!(archive.filename, format!("batch_{}_results.zip", batch_id.short()));
    assert_eq!(archive.entries, vec!["a_converted.jpg", "c_converted.jpg"]);
    assert_eq!(
        zip_entries(&archive.bytes),
        vec![
            ("a_converted.jpg".to_string(), "jpeg:a.heic".to_string()),
            ("c_converted.jpg".to_string(), "jpeg:c.heic".to_string()),
        ]
    );

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_repeated_filenames_get_numbered_archive_entries() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let pool = engine.start_workers();

    let batch_id = engine
        .batches()
        .submit(vec![request("a.heic"), request("a.heic"), request("a.heic")])
        .await
        .unwrap();
    let summary = summary(wait_for_batch(&engine, batch_id, finished).await);
    assert_eq!(summary.status, BatchStatus::Success);

    let archive = engine.batches().packager().package(batch_id).await.unwrap();
    assert_eq!(
        archive.entries,
        vec!["a_converted.jpg", "a_converted (2).jpg", "a_converted (3).jpg"]
    );
    let entries = zip_entries(&archive.bytes);
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|(_, contents)| contents == "jpeg:a.heic"));

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_all_failed_batch_has_nothing_to_package() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let pool = engine.start_workers();

    let batch_id = engine
        .batches()
        .submit(vec![request("bad1.heic"), request("bad2.heic")])
        .await
        .unwrap();

    let summary = summary(wait_for_batch(&engine, batch_id, finished).await);
    assert_eq!(summary.status, BatchStatus::Failure);
    assert_eq!(summary.message(), "All 2 files failed to convert.");

    let err = engine.batches().packager().package(batch_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NothingToPackage);

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_all_successful_batch_is_success() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let pool = engine.start_workers();

    let batch_id = engine
        .batches()
        .submit(vec![request("a.heic"), request("b.dng")])
        .await
        .unwrap();

    let summary = summary(wait_for_batch(&engine, batch_id, finished).await);
    assert_eq!(summary.status, BatchStatus::Success);
    assert_eq!(summary.message(), "All 2 files converted successfully.");

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_progress_is_reported_while_members_run() {
    let converter = ScriptedConverter::new();
    let engine = engine(patient_config(), converter.clone());
    let pool = engine.start_workers();

    let batch_id = engine
        .batches()
        .submit(vec![
            request("a.heic"),
            request("gate1.heic"),
            request("gate2.heic"),
            request("bad.heic"),
        ])
        .await
        .unwrap();

    let view = wait_for_batch(&engine, batch_id, |view| {
        matches!(view, BatchView::Dispatched(s) if s.completed == 1 && s.failed == 1)
    })
    .await;
    let summary = summary(view);
    assert_eq!(summary.status, BatchStatus::Processing);
    assert_eq!(summary.pending, 2);
    assert_eq!(summary.percent, 50);
    assert_eq!(summary.message(), "Processing 2 files. 1 completed, 1 failed.");

    // Packaging before completion returns what has finished so far.
    let early = engine.batches().packager().package(batch_id).await.unwrap();
    assert_eq!(early.entries, vec!["a_converted.jpg"]);

    converter.open_gate(2);
    let summary = summary_of(&engine, batch_id).await;
    assert_eq!(summary.status, BatchStatus::Partial);
    assert_eq!(summary.completed, 3);

    let full = engine.batches().packager().package(batch_id).await.unwrap();
    assert_eq!(
        full.entries,
        vec!["a_converted.jpg", "gate1_converted.jpg", "gate2_converted.jpg"]
    );

    pool.shutdown(Duration::from_secs(2)).await;
}

async fn summary_of(engine: &transmute_core::engine::Engine, batch_id: JobId) -> BatchSummary {
    summary(wait_for_batch(engine, batch_id, finished).await)
}

#[tokio::test]
async fn test_percent_rounds_down() {
    let converter = ScriptedConverter::new();
    let engine = engine(patient_config(), converter.clone());
    let pool = engine.start_workers();

    let batch_id = engine
        .batches()
        .submit(vec![request("a.heic"), request("gate1.heic"), request("gate2.heic")])
        .await
        .unwrap();

    let summary = summary(
        wait_for_batch(&engine, batch_id, |view| {
            matches!(view, BatchView::Dispatched(s) if s.completed == 1)
        })
        .await,
    );
    // 1 of 3 is 33.3%.
    assert_eq!(summary.percent, 33);

    converter.open_gate(2);
    summary_of(&engine, batch_id).await;
    pool.shutdown(Duration::from_secs(2)).await;
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_batch_before_dispatch_is_pending() {
    let engine = engine(test_config(), ScriptedConverter::new());

    let batch_id = engine
        .batches()
        .submit(vec![request("a.heic")])
        .await
        .unwrap();

    let view = engine.batches().view(batch_id).await.unwrap();
    assert_eq!(view, BatchView::Dispatching(JobStatus::Pending));

    let err = engine.batches().packager().package(batch_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BatchNotDispatched);
}

#[tokio::test]
async fn test_batch_size_is_bounded() {
    let engine = engine(test_config(), ScriptedConverter::new());

    let err = engine.batches().submit(Vec::new()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationFailed);

    let items = (0..51).map(|i| request(&format!("{}.heic", i))).collect();
    let err = engine.batches().submit(items).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BatchTooLarge);

    let items = (0..50).map(|i| request(&format!("{}.heic", i))).collect();
    assert!(engine.batches().submit(items).await.is_ok());
}

#[tokio::test]
async fn test_repeated_member_enqueue_is_a_no_op() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let batch_id = JobId::new();

    let members = || {
        (0..3)
            .map(|i| {
                QueuedJob::new(
                    JobId::member_of(batch_id, i),
                    TaskPayload::Convert(request(&format!("{}.heic", i))),
                )
            })
            .collect::<Vec<_>>()
    };

    engine.broker().enqueue_many(members()).await.unwrap();
    engine.broker().enqueue_many(members()).await.unwrap();
    assert_eq!(engine.broker().stats().await.unwrap().queued, 3);
}

// ============================================================================
// Lookup Errors
// ============================================================================

#[tokio::test]
async fn test_unknown_and_non_batch_ids() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let pool = engine.start_workers();

    let err = engine.batches().view(JobId::new()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BatchNotFound);

    let job_id = engine
        .submitter()
        .submit(TaskPayload::Convert(request("single.heic")))
        .await
        .unwrap();
    wait_for_job(&engine, job_id).await;

    let err = engine.batches().view(job_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotABatch);

    pool.shutdown(Duration::from_secs(2)).await;
}
