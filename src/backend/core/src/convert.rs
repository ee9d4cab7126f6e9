//! Conversion collaborator and the unit of work that runs it.
//!
//! Pixel work happens in an external image tool. This module only moves bytes
//! in and out of it and classifies what went wrong.

use async_trait::async_trait;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ConverterConfig;
use crate::error::{ErrorCode, TransmuteError};
use crate::jobs::{
    ConversionOptions, ConversionOutput, FailureCategory, JobContext, JobFailure, JobFault,
    JobKind, JobOutput, OutputFormat, Outcome, TaskPayload, UnitOfWork, UnitResult,
};

/// Input extensions the converter accepts, lowercase with leading dot.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[".heic", ".heif", ".dng", ".jpg", ".jpeg"];

/// Highest JPEG quality passed to the encoder.
const MAX_JPEG_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum ConvertError {
    /// The input itself could not be converted. Retrying will not help.
    #[error("Conversion failed: {0}")]
    Rejected(String),

    /// The converter could not run.
    #[error("{message}")]
    Fault { message: String, retryable: bool },
}

impl ConvertError {
    fn io(context: &str, error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
        );
        Self::Fault {
            message: format!("{}: {}", context, error),
            retryable,
        }
    }
}

impl From<ConvertError> for TransmuteError {
    fn from(error: ConvertError) -> Self {
        match error {
            ConvertError::Rejected(message) => TransmuteError::new(
                ErrorCode::ConversionFailed,
                format!("Conversion failed: {}", message),
            ),
            ConvertError::Fault { message, .. } => {
                TransmuteError::with_internal(ErrorCode::InternalError, "Converter unavailable", message)
            }
        }
    }
}

/// Turns image bytes into the requested output format.
///
/// Implementations must be safe to call again with the same input.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        data: &[u8],
        filename: &str,
        options: &ConversionOptions,
    ) -> Result<Vec<u8>, ConvertError>;

    fn name(&self) -> &'static str;
}

/// Converter backed by an ImageMagick-compatible command line tool.
pub struct CommandConverter {
    program: String,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(config: &ConverterConfig) -> Self {
        Self::new(config.program.clone())
    }

    fn args(input: &Path, output: &Path, options: &ConversionOptions) -> Vec<OsString> {
        // `[0]` selects the primary image of multi-image HEIC containers.
        let mut source = input.as_os_str().to_os_string();
        source.push("[0]");

        let mut args = vec![source, "-auto-orient".into()];
        match options.output_format {
            OutputFormat::Jpeg => {
                args.push("-quality".into());
                args.push(options.quality.min(MAX_JPEG_QUALITY).to_string().into());
            }
            OutputFormat::Webp if options.lossless => {
                args.push("-define".into());
                args.push("webp:lossless=true".into());
            }
            OutputFormat::Webp => {
                args.push("-quality".into());
                args.push(options.quality.to_string().into());
            }
        }
        args.push(output.as_os_str().to_os_string());
        args
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(
        &self,
        data: &[u8],
        filename: &str,
        options: &ConversionOptions,
    ) -> Result<Vec<u8>, ConvertError> {
        let dir = tempfile::tempdir().map_err(|e| ConvertError::io("Creating work dir", e))?;
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "bin".to_string());
        let input = dir.path().join(format!("input.{}", ext));
        let output = dir
            .path()
            .join(format!("output.{}", options.output_format.extension()));

        tokio::fs::write(&input, data)
            .await
            .map_err(|e| ConvertError::io("Writing input", e))?;

        let result = Command::new(&self.program)
            .args(Self::args(&input, &output, options))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ConvertError::Fault {
                    message: format!("Conversion tool '{}' not found", self.program),
                    retryable: false,
                })
            }
            Err(e) => return Err(ConvertError::io("Running conversion tool", e)),
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("converter exited with {}", out.status)
            } else {
                stderr
            };
            tracing::debug!(filename, reason = %reason, "Conversion rejected");
            return Err(ConvertError::Rejected(reason));
        }

        tokio::fs::read(&output)
            .await
            .map_err(|e| ConvertError::io("Reading output", e))
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// The conversion unit of work.
pub struct ConvertUnit {
    converter: Arc<dyn Converter>,
}

impl ConvertUnit {
    pub fn new(converter: Arc<dyn Converter>) -> Self {
        Self { converter }
    }
}

#[async_trait]
impl UnitOfWork for ConvertUnit {
    fn kind(&self) -> JobKind {
        JobKind::Convert
    }

    async fn run(&self, payload: &TaskPayload, ctx: &JobContext) -> UnitResult {
        let TaskPayload::Convert(request) = payload else {
            return Err(JobFault::fatal("Conversion received a non-conversion payload"));
        };

        ctx.report_progress(50, "Converting image").await;

        // Dropping the conversion at the soft limit kills the external tool.
        let converted = tokio::select! {
            result = self.converter.convert(&request.data, &request.filename, &request.options) => result,
            _ = ctx.soft_limit() => {
                ctx.log_warn("Soft time limit reached, abandoning conversion");
                return Ok(Outcome::Error(JobFailure::new(
                    FailureCategory::TimeLimitExceeded,
                    format!("Conversion of '{}' exceeded the soft time limit", request.filename),
                )));
            }
        };

        match converted {
            Ok(data) => {
                let format = request.options.output_format;
                let filename = request.options.output_filename(&request.filename);
                Ok(Outcome::Success(JobOutput::Conversion(ConversionOutput::new(
                    data, format, filename,
                ))))
            }
            Err(ConvertError::Rejected(reason)) => {
                ctx.log_warn(&reason);
                Ok(Outcome::Error(JobFailure::conversion(reason)))
            }
            Err(ConvertError::Fault { message, retryable }) => Err(if retryable {
                JobFault::retryable(message)
            } else {
                JobFault::fatal(message)
            }),
        }
    }
}
