//! HTTP-level tests for the API router.
//!
//! Requests are driven through `tower::ServiceExt::oneshot` against an
//! in-memory engine with a scripted converter.

mod common;

use std::io::Cursor;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use common::{engine, test_config, ScriptedConverter};
use transmute_core::api::{build_router, AppState};
use transmute_core::engine::Engine;

const BOUNDARY: &str = "transmute-test-boundary";

fn app(engine: &Engine) -> Router {
    build_router(AppState::new(engine.clone()))
}

fn multipart(field: &str, files: &[(&str, &str)]) -> Body {
    let mut body = Vec::new();
    for (filename, data) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Body::from(body)
}

fn upload(uri: &str, field: &str, files: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(multipart(field, files))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn poll_until(app: &Router, uri: &str, statuses: &[&str]) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (code, json) = send_json(app, get(uri)).await;
        assert_eq!(code, StatusCode::OK, "{}", json);
        let status = json["data"]["status"].as_str().unwrap_or_default().to_string();
        if statuses.contains(&status.as_str()) {
            return json["data"].clone();
        }
        assert!(tokio::time::Instant::now() < deadline, "{} stuck at {}", uri, status);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Service Endpoints
// ============================================================================

#[tokio::test]
async fn test_health_reports_broker() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let (status, json) = send_json(&app(&engine), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["broker"], "in_memory");
    assert_eq!(json["queue"]["queued"], 0);
}

#[tokio::test]
async fn test_root_lists_endpoints() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let (status, json) = send_json(&app(&engine), get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["endpoints"]["batch"]["POST /jobs/batch-convert"].is_string());
}

// ============================================================================
// Synchronous Conversion
// ============================================================================

#[tokio::test]
async fn test_sync_webp_conversion_returns_bytes() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let (status, headers, body) = send(
        &app(&engine),
        upload("/convert-to-webp?lossless=true", "file", &[("IMG_1.heic", "raw")]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/webp");
    assert!(headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("converted.webp"));
    assert_eq!(body, b"webp:IMG_1.heic");
}

#[tokio::test]
async fn test_sync_rejection_is_unprocessable() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let (status, json) = send_json(
        &app(&engine),
        upload("/convert", "file", &[("bad.heic", "raw")]),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["success"], false);
    assert_eq!(json["error_code"], "CONVERSION_FAILED");
}

// ============================================================================
// Upload Validation
// ============================================================================

#[tokio::test]
async fn test_upload_validation() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let app = app(&engine);

    let (status, json) = send_json(&app, upload("/jobs/convert", "file", &[("a.png", "raw")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "UNSUPPORTED_FORMAT");

    let (status, json) = send_json(
        &app,
        upload("/jobs/convert?quality=101", "file", &[("a.heic", "raw")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "VALIDATION_FAILED");

    let (status, json) = send_json(
        &app,
        upload("/jobs/convert?output_format=gif", "file", &[("a.heic", "raw")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "UNSUPPORTED_FORMAT");

    let (status, _) = send_json(&app, upload("/jobs/convert", "other", &[("a.heic", "raw")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let mut config = test_config();
    config.server.max_upload_bytes = 8;
    let engine = engine(config, ScriptedConverter::new());

    let (status, json) = send_json(
        &app(&engine),
        upload("/jobs/convert", "file", &[("a.heic", "more than eight bytes")]),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["error_code"], "PAYLOAD_TOO_LARGE");
}

// ============================================================================
// Jobs
// ============================================================================

#[tokio::test]
async fn test_job_lifecycle_over_http() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let app = app(&engine);

    let (status, json) = send_json(&app, upload("/jobs/convert", "file", &[("photo.heic", "raw")])).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["data"]["status"], "PENDING");
    assert_eq!(json["data"]["filename"], "photo.heic");
    let job_id = json["data"]["job_id"].as_str().unwrap().to_string();

    // No workers yet: queued, and the result is not ready.
    let (_, json) = send_json(&app, get(&format!("/jobs/{}", job_id))).await;
    assert_eq!(json["data"]["status"], "PENDING");
    assert_eq!(json["data"]["message"], "Job is queued and waiting to be processed");

    let (status, json) = send_json(&app, get(&format!("/jobs/{}/result", job_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error_code"], "RESULT_NOT_READY");

    let pool = engine.start_workers();
    let data = poll_until(&app, &format!("/jobs/{}", job_id), &["SUCCESS", "FAILURE"]).await;
    assert_eq!(data["status"], "SUCCESS");
    assert_eq!(data["result"]["filename"], "photo_converted.jpg");
    assert_eq!(data["result"]["output_format"], "jpeg");
    assert_eq!(
        data["message"],
        format!("Job completed. Use GET /jobs/{}/result to download.", job_id)
    );

    let (status, headers, body) = send(&app, get(&format!("/jobs/{}/result", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
    assert!(headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("photo_converted.jpg"));
    assert_eq!(body, b"jpeg:photo.heic");

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_result_download_header_survives_non_ascii_names() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let app = app(&engine);

    let (status, json) = send_json(&app, upload("/jobs/convert", "file", &[("café.heic", "raw")])).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = json["data"]["job_id"].as_str().unwrap().to_string();

    let pool = engine.start_workers();
    let data = poll_until(&app, &format!("/jobs/{}", job_id), &["SUCCESS", "FAILURE"]).await;
    assert_eq!(data["status"], "SUCCESS");
    assert_eq!(data["result"]["filename"], "café_converted.jpg");

    let (status, headers, body) = send(&app, get(&format!("/jobs/{}/result", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"caf__converted.jpg\""
    );
    assert_eq!(body, "jpeg:café.heic".as_bytes());

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_failed_job_over_http() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let app = app(&engine);
    let pool = engine.start_workers();

    let (_, json) = send_json(&app, upload("/jobs/convert", "file", &[("bad.heic", "raw")])).await;
    let job_id = json["data"]["job_id"].as_str().unwrap().to_string();

    let data = poll_until(&app, &format!("/jobs/{}", job_id), &["SUCCESS", "FAILURE"]).await;
    assert_eq!(data["status"], "FAILURE");
    assert_eq!(data["error"], "not a valid image");
    assert_eq!(data["error_type"], "ConversionError");

    let (status, json) = send_json(&app, get(&format!("/jobs/{}/result", job_id))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error_code"], "JOB_FAILED");

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_unknown_and_malformed_job_ids() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let app = app(&engine);

    let (status, json) = send_json(&app, get(&format!("/jobs/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error_code"], "JOB_NOT_FOUND");

    let (status, _) = send_json(&app, get("/jobs/not-a-uuid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, json) = send_json(&app, get("/jobs/batch/not-a-uuid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error_code"], "BATCH_NOT_FOUND");
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn test_batch_lifecycle_over_http() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let app = app(&engine);
    let pool = engine.start_workers();

    let (status, json) = send_json(
        &app,
        upload(
            "/jobs/batch-convert",
            "files",
            &[("a.heic", "1"), ("bad.heic", "2"), ("c.dng", "3")],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["data"]["total_files"], 3);
    let batch_id = json["data"]["batch_id"].as_str().unwrap().to_string();

    let data = poll_until(
        &app,
        &format!("/jobs/batch/{}", batch_id),
        &["SUCCESS", "FAILURE", "PARTIAL"],
    )
    .await;
    assert_eq!(data["status"], "PARTIAL");
    assert_eq!(data["total_files"], 3);
    assert_eq!(data["completed"], 2);
    assert_eq!(data["failed"], 1);
    assert_eq!(data["percent"], 100);
    let files = data["files"].as_array().unwrap();
    assert_eq!(files.len(), 3);
    assert_eq!(files[0]["filename"], "a.heic");
    assert_eq!(files[0]["output_format"], "webp");
    assert_eq!(files[1]["status"], "FAILURE");
    assert_eq!(files[1]["error"], "not a valid image");

    let (status, headers, body) = send(&app, get(&format!("/jobs/batch/{}/results", batch_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/zip");
    let archive = zip::ZipArchive::new(Cursor::new(body)).unwrap();
    let mut names: Vec<&str> = archive.file_names().collect();
    names.sort();
    assert_eq!(names, vec!["a_converted.webp", "c_converted.webp"]);

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_batch_limits_over_http() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let app = app(&engine);

    let (status, json) = send_json(&app, upload("/jobs/batch-convert", "files", &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "VALIDATION_FAILED");

    let names: Vec<String> = (0..51).map(|i| format!("{}.heic", i)).collect();
    let files: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "x")).collect();
    let (status, json) = send_json(&app, upload("/jobs/batch-convert", "files", &files)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error_code"], "BATCH_TOO_LARGE");

    let (status, json) = send_json(
        &app,
        upload("/jobs/batch-convert", "files", &[("a.heic", "1"), ("b.png", "2")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().starts_with("File 'b.png' validation failed"));
}

#[tokio::test]
async fn test_batch_pending_before_dispatch() {
    let engine = engine(test_config(), ScriptedConverter::new());
    let app = app(&engine);

    let (_, json) = send_json(&app, upload("/jobs/batch-convert", "files", &[("a.heic", "1")])).await;
    let batch_id = json["data"]["batch_id"].as_str().unwrap().to_string();

    let (status, json) = send_json(&app, get(&format!("/jobs/batch/{}", batch_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["status"], "PENDING");

    let (status, json) = send_json(&app, get(&format!("/jobs/batch/{}/results", batch_id))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error_code"], "BATCH_NOT_DISPATCHED");
}
