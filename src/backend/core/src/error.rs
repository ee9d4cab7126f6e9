//! Error handling for Transmute Core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and context chaining
//! - HTTP status code mapping for API responses
//! - Retry classification used by the worker envelope
//! - Error logging with tracing integration and error metrics
//!
//! # Usage
//!
//! ```rust,ignore
//! use transmute_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn read_record() -> Result<Vec<u8>> {
//!     let bytes = std::fs::read("record.json").with_error_code(ErrorCode::StoreError)?;
//!     Ok(bytes)
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Transmute operations.
pub type Result<T> = std::result::Result<T, TransmuteError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input Errors (1000-1099)
    ValidationFailed,
    UnsupportedFormat,
    PayloadTooLarge,
    BatchTooLarge,

    // Job Errors (1100-1199)
    JobNotFound,
    BatchNotFound,
    NotABatch,
    ResultNotReady,
    BatchNotDispatched,
    JobFailed,
    NothingToPackage,
    TimeLimitExceeded,
    ConversionFailed,
    InvalidStateTransition,

    // Store Errors (2000-2099)
    StoreError,
    StoreUnavailable,

    // Queue Errors (2100-2199)
    QueueError,
    QueueUnavailable,

    // Serialization Errors (2200-2299)
    SerializationError,
    ArchiveError,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::ValidationFailed => 1000,
            Self::UnsupportedFormat => 1001,
            Self::PayloadTooLarge => 1002,
            Self::BatchTooLarge => 1003,

            Self::JobNotFound => 1100,
            Self::BatchNotFound => 1101,
            Self::NotABatch => 1102,
            Self::ResultNotReady => 1103,
            Self::BatchNotDispatched => 1104,
            Self::JobFailed => 1105,
            Self::NothingToPackage => 1106,
            Self::TimeLimitExceeded => 1107,
            Self::ConversionFailed => 1108,
            Self::InvalidStateTransition => 1109,

            Self::StoreError => 2000,
            Self::StoreUnavailable => 2001,

            Self::QueueError => 2100,
            Self::QueueUnavailable => 2101,

            Self::SerializationError => 2200,
            Self::ArchiveError => 2201,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Not Found (404)
            Self::JobNotFound | Self::BatchNotFound | Self::ResultNotReady => {
                StatusCode::NOT_FOUND
            }

            // Bad Request (400)
            Self::ValidationFailed | Self::UnsupportedFormat | Self::BatchTooLarge => {
                StatusCode::BAD_REQUEST
            }

            // Payload Too Large (413)
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,

            // Conflict (409)
            Self::NotABatch | Self::BatchNotDispatched | Self::InvalidStateTransition => {
                StatusCode::CONFLICT
            }

            // Unprocessable Entity (422)
            Self::JobFailed | Self::NothingToPackage | Self::ConversionFailed => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            // Timeout (504)
            Self::TimeLimitExceeded => StatusCode::GATEWAY_TIMEOUT,

            // Service Unavailable (503)
            Self::StoreUnavailable | Self::QueueUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            // Internal Server Error (500)
            Self::StoreError
            | Self::QueueError
            | Self::SerializationError
            | Self::ArchiveError
            | Self::ConfigurationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is a transient infrastructure fault worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable | Self::QueueUnavailable | Self::StoreError | Self::QueueError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "input",
            1100..=1199 => "job",
            2000..=2099 => "store",
            2100..=2199 => "queue",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Client errors (bad input, unknown ids, results not ready)
    Low,
    /// Job-level failures and limits
    Medium,
    /// System errors
    High,
    /// Backing services unreachable
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationFailed
            | ErrorCode::UnsupportedFormat
            | ErrorCode::PayloadTooLarge
            | ErrorCode::BatchTooLarge
            | ErrorCode::JobNotFound
            | ErrorCode::BatchNotFound
            | ErrorCode::NotABatch
            | ErrorCode::ResultNotReady
            | ErrorCode::BatchNotDispatched => Self::Low,

            ErrorCode::JobFailed
            | ErrorCode::NothingToPackage
            | ErrorCode::TimeLimitExceeded
            | ErrorCode::ConversionFailed
            | ErrorCode::InvalidStateTransition => Self::Medium,

            ErrorCode::StoreError
            | ErrorCode::QueueError
            | ErrorCode::SerializationError
            | ErrorCode::ArchiveError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::StoreUnavailable
            | ErrorCode::QueueUnavailable
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, batch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty() && self.entity_id.is_none() && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Transmute Core.
///
/// Carries a stable [`ErrorCode`], a message that is safe to return to clients,
/// an optional internal message that is only logged, and the source error.
#[derive(Error, Debug)]
pub struct TransmuteError {
    code: ErrorCode,
    user_message: Cow<'static, str>,
    internal_message: Option<String>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for TransmuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl TransmuteError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    /// The job id is unknown to both the result store and the broker.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id).with_suggestion(
                "The job id never existed or its result expired; resubmit the file",
            ))
    }

    pub fn batch_not_found(batch_id: impl fmt::Display) -> Self {
        let id = batch_id.to_string();
        Self::new(ErrorCode::BatchNotFound, format!("Batch not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("batch", id))
    }

    /// A batch request exceeded the configured item cap.
    pub fn batch_too_large(count: usize, max: usize) -> Self {
        Self::new(
            ErrorCode::BatchTooLarge,
            format!("Batch of {} files exceeds the limit of {} files", count, max),
        )
        .with_context("count", count)
        .with_context("max", max)
    }

    /// A job ran past its hard wall-clock limit.
    pub fn time_limit_exceeded(elapsed_ms: u64, limit_ms: u64) -> Self {
        Self::with_internal(
            ErrorCode::TimeLimitExceeded,
            format!("Job exceeded the hard time limit of {}s", limit_ms / 1000),
            format!("elapsed {}ms, limit {}ms", elapsed_ms, limit_ms),
        )
        .with_context("elapsed_ms", elapsed_ms)
        .with_context("limit_ms", limit_ms)
    }

    /// A batch has no successful member to put in an archive.
    pub fn nothing_to_package(batch_id: impl fmt::Display) -> Self {
        let id = batch_id.to_string();
        Self::new(
            ErrorCode::NothingToPackage,
            "All files in batch failed to convert or are still processing. No results available.",
        )
        .with_details(ErrorDetails::new().with_entity("batch", id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "transmute_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON body returned for failed requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,
    /// User-facing message
    pub error: String,
    /// Machine-readable code
    pub error_code: ErrorCode,
    /// Numeric error code
    pub numeric_code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

impl From<&TransmuteError> for ErrorResponse {
    fn from(error: &TransmuteError) -> Self {
        Self {
            success: false,
            error: error.user_message.to_string(),
            error_code: error.code,
            numeric_code: error.code.numeric_code(),
            details: if error.details.is_empty() {
                None
            } else {
                Some(error.details.clone())
            },
        }
    }
}

impl IntoResponse for TransmuteError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.http_status();
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error with a message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error with an explicit code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| TransmuteError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| TransmuteError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| TransmuteError::internal(message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| TransmuteError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for TransmuteError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_timeout()
            || error.is_io_error()
        {
            (ErrorCode::StoreUnavailable, "Unable to reach the result backend")
        } else {
            (ErrorCode::StoreError, "A result backend error occurred")
        };
        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for TransmuteError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for TransmuteError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for TransmuteError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::TimeLimitExceeded,
            "Operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<zip::result::ZipError> for TransmuteError {
    fn from(error: zip::result::ZipError) -> Self {
        Self::with_internal(
            ErrorCode::ArchiveError,
            "Failed to build the results archive",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for TransmuteError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::task::JoinError> for TransmuteError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "A background task failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<axum::extract::multipart::MultipartError> for TransmuteError {
    fn from(error: axum::extract::multipart::MultipartError) -> Self {
        Self::with_internal(
            ErrorCode::ValidationFailed,
            "Malformed multipart upload",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<anyhow::Error> for TransmuteError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", error))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
