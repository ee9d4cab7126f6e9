//! API request handlers.
//!
//! All handlers return `Result<impl IntoResponse, TransmuteError>` so that
//! errors map to HTTP status codes through `TransmuteError`'s `IntoResponse`.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiResponse, AppState};
use crate::batch::{BatchSummary, BatchView, MemberState};
use crate::error::{ErrorCode, Result, TransmuteError};
use crate::jobs::{
    ConversionOptions, ConvertRequest, JobId, JobOutput, JobStatus, OutputFormat, TaskPayload,
};
use crate::validation::{validate_batch, validate_options, validate_upload};

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "Image Conversion Service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "synchronous": {
                "POST /convert": "Convert HEIC/DNG/JPG to JPEG (blocking)",
                "POST /convert-to-webp": "Convert HEIC/DNG/JPG to WebP (blocking)"
            },
            "asynchronous": {
                "POST /jobs/convert": "Submit a conversion job",
                "GET /jobs/{job_id}": "Check job status",
                "GET /jobs/{job_id}/result": "Download the converted image"
            },
            "batch": {
                "POST /jobs/batch-convert": "Submit up to 50 files as one batch",
                "GET /jobs/batch/{batch_id}": "Check batch status",
                "GET /jobs/batch/{batch_id}/results": "Download successful conversions as ZIP"
            }
        }
    }))
}

pub async fn health_check(State(state): State<AppState>) -> Response {
    let broker = state.engine.broker();
    match broker.stats().await {
        Ok(queue) => Json(serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "broker": broker.name(),
            "queue": queue,
        }))
        .into_response(),
        Err(e) => {
            e.log();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "version": env!("CARGO_PKG_VERSION"),
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "broker": broker.name(),
                    "error": e.user_message(),
                })),
            )
                .into_response()
        }
    }
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Uploads
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct ConvertQuery {
    pub output_format: Option<String>,
    pub quality: Option<i64>,
    #[serde(default)]
    pub lossless: bool,
}

impl ConvertQuery {
    fn options(&self, defaults: ConversionOptions) -> Result<ConversionOptions> {
        validate_options(
            self.output_format.as_deref(),
            self.quality,
            self.lossless,
            defaults,
        )
    }
}

struct Upload {
    filename: String,
    data: Vec<u8>,
}

/// Collect every part named `field`, validating each file as it arrives.
async fn read_uploads(
    multipart: &mut Multipart,
    field: &str,
    max_bytes: usize,
) -> Result<Vec<Upload>> {
    let mut uploads = Vec::new();
    while let Some(part) = multipart.next_field().await? {
        if part.name() != Some(field) {
            continue;
        }
        let filename = part.file_name().unwrap_or("upload").to_string();
        let data = part.bytes().await?;
        validate_upload(&filename, data.len(), max_bytes)?;
        uploads.push(Upload {
            filename,
            data: data.to_vec(),
        });
    }
    Ok(uploads)
}

async fn read_single_upload(multipart: &mut Multipart, max_bytes: usize) -> Result<Upload> {
    read_uploads(multipart, "file", max_bytes)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| TransmuteError::validation("Missing multipart field 'file'"))
}

fn attachment(media_type: &'static str, filename: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, media_type.to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(filename)),
        ],
        bytes,
    )
        .into_response()
}

/// `attachment` disposition with a filename that fits a header quoted-string.
/// Quotes, backslashes, control and non-ASCII characters become `_`.
fn content_disposition(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();
    let safe = if safe.trim().is_empty() {
        "download".to_string()
    } else {
        safe
    };
    format!("attachment; filename=\"{}\"", safe)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Synchronous Conversion
// ═══════════════════════════════════════════════════════════════════════════════

async fn convert_now(
    state: &AppState,
    mut multipart: Multipart,
    options: ConversionOptions,
) -> Result<Response> {
    let max = state.engine.config().server.max_upload_bytes;
    let upload = read_single_upload(&mut multipart, max).await?;

    let bytes = state
        .engine
        .converter()
        .convert(&upload.data, &upload.filename, &options)
        .await?;

    let format = options.output_format;
    Ok(attachment(
        format.media_type(),
        &format!("converted.{}", format.extension()),
        bytes,
    ))
}

pub async fn convert_to_jpeg(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response> {
    let options = state.engine.default_options(OutputFormat::Jpeg);
    convert_now(&state, multipart, options).await
}

pub async fn convert_to_webp(
    State(state): State<AppState>,
    Query(query): Query<ConvertQuery>,
    multipart: Multipart,
) -> Result<Response> {
    let options = ConvertQuery {
        output_format: Some("webp".to_string()),
        ..query
    }
    .options(state.engine.default_options(OutputFormat::Webp))?;
    convert_now(&state, multipart, options).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct JobSubmitted {
    pub job_id: JobId,
    pub status: String,
    pub filename: String,
    pub message: String,
}

pub async fn submit_job(
    State(state): State<AppState>,
    Query(query): Query<ConvertQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let options = query.options(state.engine.default_options(OutputFormat::Jpeg))?;
    let max = state.engine.config().server.max_upload_bytes;
    let upload = read_single_upload(&mut multipart, max).await?;

    let job_id = state
        .engine
        .submitter()
        .submit(TaskPayload::Convert(ConvertRequest {
            data: upload.data,
            filename: upload.filename.clone(),
            options,
        }))
        .await?;

    let response = JobSubmitted {
        job_id,
        status: "PENDING".to_string(),
        filename: upload.filename,
        message: format!("Job submitted. Check status with GET /jobs/{}", job_id),
    };
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(response))))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultSummary {
    pub output_format: OutputFormat,
    pub filename: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobStatusResponse {
    fn new(job_id: JobId, status: &JobStatus) -> Self {
        let mut response = Self {
            job_id,
            status: status.name().to_string(),
            progress: None,
            current: None,
            result: None,
            error: None,
            error_type: None,
            message: None,
        };

        match status {
            JobStatus::Pending => {
                response.message = Some("Job is queued and waiting to be processed".to_string());
            }
            JobStatus::Processing(progress) => {
                response.progress = Some(progress.as_ref().map(|p| p.percent).unwrap_or(0));
                response.current = Some(
                    progress
                        .as_ref()
                        .map(|p| p.label.clone())
                        .unwrap_or_else(|| "Processing...".to_string()),
                );
            }
            JobStatus::Success(JobOutput::Conversion(output)) => {
                response.result = Some(ResultSummary {
                    output_format: output.format,
                    filename: output.filename.clone(),
                    size_bytes: output.size_bytes,
                });
                response.message = Some(format!(
                    "Job completed. Use GET /jobs/{}/result to download.",
                    job_id
                ));
            }
            JobStatus::Success(JobOutput::Batch(_)) => {
                response.message = Some(format!(
                    "Batch dispatched. Use GET /jobs/batch/{} for member status.",
                    job_id
                ));
            }
            JobStatus::Failure(failure) => {
                response.error = Some(failure.message.clone());
                response.error_type = Some(failure.category.as_str().to_string());
            }
        }
        response
    }
}

pub async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let job_id: JobId = id.parse()?;
    let status = state.engine.status().status(job_id).await?;
    Ok(Json(ApiResponse::success(JobStatusResponse::new(job_id, &status))))
}

pub async fn get_job_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let job_id: JobId = id.parse()?;

    match state.engine.status().status(job_id).await? {
        JobStatus::Pending => Err(TransmuteError::new(
            ErrorCode::ResultNotReady,
            format!("Job is still queued. Check status with GET /jobs/{}", job_id),
        )),
        JobStatus::Processing(_) => Err(TransmuteError::new(
            ErrorCode::ResultNotReady,
            format!("Job is still processing. Check status with GET /jobs/{}", job_id),
        )),
        JobStatus::Failure(failure) => Err(TransmuteError::new(
            ErrorCode::JobFailed,
            format!("Conversion failed: {}", failure.message),
        )
        .with_context("error_type", failure.category.as_str())),
        JobStatus::Success(JobOutput::Conversion(output)) => Ok(attachment(
            output.format.media_type(),
            &output.filename,
            output.data,
        )),
        JobStatus::Success(JobOutput::Batch(_)) => Err(TransmuteError::validation(format!(
            "Job {} is a batch. Download its results from GET /jobs/batch/{}/results",
            job_id, job_id
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Batches
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchSubmitted {
    pub batch_id: JobId,
    pub status: String,
    pub total_files: usize,
    pub message: String,
}

pub async fn submit_batch(
    State(state): State<AppState>,
    Query(query): Query<ConvertQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let options = query.options(state.engine.default_options(OutputFormat::Webp))?;
    let max_bytes = state.engine.config().server.max_upload_bytes;
    let max_items = state.engine.batches().max_items();

    let mut uploads = Vec::new();
    while let Some(part) = multipart.next_field().await? {
        if part.name() != Some("files") {
            continue;
        }
        if uploads.len() == max_items {
            return Err(TransmuteError::batch_too_large(max_items + 1, max_items));
        }
        let filename = part.file_name().unwrap_or("upload").to_string();
        let data = part.bytes().await?;
        validate_upload(&filename, data.len(), max_bytes).map_err(|e| {
            TransmuteError::new(
                e.code(),
                format!("File '{}' validation failed: {}", filename, e.user_message()),
            )
        })?;
        uploads.push(ConvertRequest {
            data: data.to_vec(),
            filename,
            options,
        });
    }
    validate_batch(uploads.len(), max_items)?;

    let total_files = uploads.len();
    let batch_id = state.engine.batches().submit(uploads).await?;

    let response = BatchSubmitted {
        batch_id,
        status: "PENDING".to_string(),
        total_files,
        message: format!(
            "Batch job submitted. Use GET /jobs/batch/{} to check status.",
            batch_id
        ),
    };
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(response))))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileStatus {
    pub filename: String,
    pub job_id: JobId,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchStatusResponse {
    pub batch_id: JobId,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileStatus>,
}

impl BatchStatusResponse {
    fn bare(batch_id: JobId, status: &str) -> Self {
        Self {
            batch_id,
            status: status.to_string(),
            total_files: None,
            completed: None,
            failed: None,
            pending: None,
            percent: None,
            message: None,
            error: None,
            files: Vec::new(),
        }
    }

    fn from_view(batch_id: JobId, view: BatchView) -> Self {
        match view {
            BatchView::Dispatching(JobStatus::Processing(_)) => Self {
                message: Some("Batch is being dispatched".to_string()),
                ..Self::bare(batch_id, "PROCESSING")
            },
            BatchView::Dispatching(_) => Self {
                message: Some("Batch job is queued and waiting to be processed".to_string()),
                ..Self::bare(batch_id, "PENDING")
            },
            BatchView::DispatchFailed(failure) => Self {
                error: Some(failure.message),
                ..Self::bare(batch_id, "FAILURE")
            },
            BatchView::Dispatched(summary) => Self::from_summary(summary),
        }
    }

    fn from_summary(summary: BatchSummary) -> Self {
        let message = summary.message();
        let files = summary
            .members
            .into_iter()
            .map(|member| {
                let mut file = FileStatus {
                    filename: member.filename,
                    job_id: member.job_id,
                    status: member.state.name().to_string(),
                    output_format: None,
                    size_bytes: None,
                    error: None,
                };
                match member.state {
                    MemberState::Succeeded(output) => {
                        file.output_format = Some(output.format);
                        file.size_bytes = Some(output.size_bytes);
                    }
                    MemberState::Failed(failure) => file.error = Some(failure.message),
                    MemberState::Pending | MemberState::Processing(_) => {}
                }
                file
            })
            .collect();

        Self {
            total_files: Some(summary.total),
            completed: Some(summary.completed),
            failed: Some(summary.failed),
            pending: Some(summary.pending),
            percent: Some(summary.percent),
            message: Some(message),
            files,
            ..Self::bare(summary.batch_id, summary.status.as_str())
        }
    }
}

fn parse_batch_id(id: &str) -> Result<JobId> {
    id.parse().map_err(|_| TransmuteError::batch_not_found(id))
}

pub async fn get_batch_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let batch_id = parse_batch_id(&id)?;
    let view = state.engine.batches().view(batch_id).await?;
    Ok(Json(ApiResponse::success(BatchStatusResponse::from_view(
        batch_id, view,
    ))))
}

pub async fn get_batch_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let batch_id = parse_batch_id(&id)?;
    let archive = state.engine.batches().packager().package(batch_id).await?;
    Ok(attachment("application/zip", &archive.filename, archive.bytes))
}
