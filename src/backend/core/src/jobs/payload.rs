//! Payloads carried through the broker and terminal outputs kept in the result store.
//!
//! Raw bytes are serialized as base64 strings so the same shapes travel over
//! the JSON encoding used by the Redis backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::job::{JobId, JobKind};
use crate::error::{ErrorCode, TransmuteError};

// ═══════════════════════════════════════════════════════════════════════════════
// Conversion Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Target encoding for a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Webp,
}

impl OutputFormat {
    /// File extension used for converted files.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Jpeg
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = TransmuteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::Webp),
            other => Err(TransmuteError::new(
                ErrorCode::UnsupportedFormat,
                format!("Invalid output format '{}'. Must be 'jpeg' or 'webp'", other),
            )),
        }
    }
}

/// Encoder settings for one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionOptions {
    pub output_format: OutputFormat,
    /// 0-100, ignored when `lossless` is set
    pub quality: u8,
    /// WebP only
    #[serde(default)]
    pub lossless: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Jpeg,
            quality: 85,
            lossless: false,
        }
    }
}

impl ConversionOptions {
    /// Suggested filename for the converted output of `source`.
    pub fn output_filename(&self, source: &str) -> String {
        let stem = Path::new(source)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("image");
        format!("{}_converted.{}", stem, self.output_format.extension())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// One file to convert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertRequest {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub filename: String,
    pub options: ConversionOptions,
}

/// Files fanned out by a batch dispatch job, in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<ConvertRequest>,
}

/// The work a queued job performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Convert(ConvertRequest),
    DispatchBatch(BatchRequest),
}

impl TaskPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Convert(_) => JobKind::Convert,
            Self::DispatchBatch(_) => JobKind::DispatchBatch,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Terminal Outputs
// ═══════════════════════════════════════════════════════════════════════════════

/// Successful conversion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionOutput {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub format: OutputFormat,
    pub filename: String,
    pub size_bytes: u64,
}

impl ConversionOutput {
    pub fn new(data: Vec<u8>, format: OutputFormat, filename: impl Into<String>) -> Self {
        let size_bytes = data.len() as u64;
        Self {
            data,
            format,
            filename: filename.into(),
            size_bytes,
        }
    }
}

/// Batch to member mapping, fixed once dispatch succeeds.
///
/// `job_ids[i]` was created for `filenames[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: JobId,
    pub total: usize,
    pub job_ids: Vec<JobId>,
    pub filenames: Vec<String>,
}

impl BatchRecord {
    pub fn members(&self) -> impl Iterator<Item = (JobId, &str)> + '_ {
        self.job_ids
            .iter()
            .copied()
            .zip(self.filenames.iter().map(String::as_str))
    }
}

/// Payload of a SUCCESS record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutput {
    Conversion(ConversionOutput),
    Batch(BatchRecord),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Serde helpers
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
