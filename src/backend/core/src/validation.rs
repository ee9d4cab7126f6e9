//! Input validation applied at the API boundary, before anything is submitted.

use std::path::Path;

use crate::convert::SUPPORTED_EXTENSIONS;
use crate::error::{ErrorCode, Result, TransmuteError};
use crate::jobs::{ConversionOptions, OutputFormat};

/// Check one uploaded file's name and size.
pub fn validate_upload(filename: &str, size: usize, max_bytes: usize) -> Result<()> {
    if size > max_bytes {
        return Err(TransmuteError::new(
            ErrorCode::PayloadTooLarge,
            format!("File too large (max {}MB)", max_bytes / (1024 * 1024)),
        )
        .with_context("size", size)
        .with_context("max_bytes", max_bytes));
    }
    if size == 0 {
        return Err(TransmuteError::validation(format!("File '{}' is empty", filename)));
    }

    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        let shown = if ext.is_empty() { "(none)" } else { ext.as_str() };
        return Err(TransmuteError::new(
            ErrorCode::UnsupportedFormat,
            format!(
                "Unsupported file type: {}. Supported: {}",
                shown,
                SUPPORTED_EXTENSIONS.join(", ")
            ),
        ));
    }
    Ok(())
}

/// Build conversion options from optional request parameters.
pub fn validate_options(
    output_format: Option<&str>,
    quality: Option<i64>,
    lossless: bool,
    defaults: ConversionOptions,
) -> Result<ConversionOptions> {
    let output_format = match output_format {
        Some(raw) => raw.parse::<OutputFormat>()?,
        None => defaults.output_format,
    };
    let quality = match quality {
        Some(q) if (0..=100).contains(&q) => q as u8,
        Some(_) => {
            return Err(TransmuteError::validation("Quality must be between 0 and 100"));
        }
        None => defaults.quality,
    };

    Ok(ConversionOptions {
        output_format,
        quality,
        lossless,
    })
}

/// A batch must hold between one and `max` files.
pub fn validate_batch(count: usize, max: usize) -> Result<()> {
    if count == 0 {
        return Err(TransmuteError::validation(
            "No files provided. Please upload at least one file.",
        ));
    }
    if count > max {
        return Err(TransmuteError::batch_too_large(count, max));
    }
    Ok(())
}
