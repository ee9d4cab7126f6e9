//! Batch commands.
//!
//! Provides submit, status, and download operations for batches.

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

use super::{save_download, ConversionArgs};
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum BatchCommands {
    /// Submit up to 50 images as one batch
    Submit {
        /// Images to convert
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        conversion: ConversionArgs,
    },

    /// Show batch progress and per-file status
    Status {
        /// Batch ID
        batch_id: Uuid,
    },

    /// Download successful conversions as a ZIP archive
    Download {
        /// Batch ID
        batch_id: Uuid,

        /// Output file or directory
        #[arg(short = 'd', long = "dest")]
        out: Option<PathBuf>,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct BatchSubmitted {
    batch_id: Uuid,
    status: String,
    total_files: usize,
    message: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct FileStatus {
    filename: String,
    job_id: Uuid,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct BatchStatus {
    batch_id: Uuid,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_files: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    files: Vec<FileStatus>,
}

#[derive(Debug, Serialize, Tabled)]
struct FileRow {
    #[tabled(rename = "File")]
    filename: String,
    #[tabled(rename = "Job")]
    job_id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

impl From<&FileStatus> for FileRow {
    fn from(file: &FileStatus) -> Self {
        let detail = match (&file.error, file.size_bytes) {
            (Some(error), _) => error.clone(),
            (None, Some(size)) => format!("{} bytes", size),
            (None, None) => String::new(),
        };
        Self {
            filename: file.filename.clone(),
            job_id: file.job_id.to_string()[..8].to_string(),
            status: file.status.clone(),
            detail,
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: BatchCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        BatchCommands::Submit { files, conversion } => {
            let paths: Vec<&std::path::Path> = files.iter().map(PathBuf::as_path).collect();
            let resp: BatchSubmitted = client
                .upload("/jobs/batch-convert", "files", &paths, &conversion.query())
                .await?;

            match format {
                OutputFormat::Table => {
                    output::print_success("Batch submitted");
                    output::print_detail("Batch ID", &resp.batch_id.to_string());
                    output::print_detail("Files", &resp.total_files.to_string());
                }
                _ => output::print_item(&resp, format)?,
            }
        }

        BatchCommands::Status { batch_id } => {
            let status: BatchStatus = client.get(&format!("/jobs/batch/{}", batch_id)).await?;

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Batch: {}", batch_id));
                    output::print_detail(
                        "Status",
                        &output::status_label(&status.status).to_string(),
                    );
                    if let (Some(total), Some(percent)) = (status.total_files, status.percent) {
                        output::print_detail(
                            "Progress",
                            &format!(
                                "{}% ({} done, {} failed, {} pending of {})",
                                percent,
                                status.completed.unwrap_or(0),
                                status.failed.unwrap_or(0),
                                status.pending.unwrap_or(0),
                                total
                            ),
                        );
                    }
                    if let Some(message) = &status.message {
                        output::print_detail("Message", message);
                    }
                    if let Some(error) = &status.error {
                        output::print_detail("Error", error);
                    }
                    if !status.files.is_empty() {
                        println!();
                        let rows: Vec<FileRow> = status.files.iter().map(FileRow::from).collect();
                        output::print_list(&rows, format)?;
                    }
                }
                _ => output::print_item(&status, format)?,
            }
        }

        BatchCommands::Download { batch_id, out } => {
            let archive = client
                .download(&format!("/jobs/batch/{}/results", batch_id))
                .await?;
            let fallback = format!("batch_{}_results.zip", &batch_id.simple().to_string()[..8]);
            let path = save_download(archive, out.as_deref(), &fallback)?;
            output::print_success(&format!("Saved {}", path.display()));
        }
    }

    Ok(())
}
