//! Single-image job commands: submit, status and result download.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{save_download, ConversionArgs};
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct ConvertArgs {
    /// Image to convert (.heic, .heif, .dng, .jpg, .jpeg)
    pub file: PathBuf,

    #[command(flatten)]
    pub conversion: ConversionArgs,

    /// Wait for the job to finish and download the result
    #[arg(short, long)]
    pub wait: bool,

    /// Where to write the result when waiting (file or directory)
    #[arg(short = 'd', long = "dest")]
    pub out: Option<PathBuf>,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "600")]
    pub timeout: u64,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Job ID
    pub job_id: Uuid,
}

#[derive(Args)]
pub struct ResultArgs {
    /// Job ID
    pub job_id: Uuid,

    /// Output file or directory
    #[arg(short = 'd', long = "dest")]
    pub out: Option<PathBuf>,
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct JobSubmitted {
    job_id: Uuid,
    status: String,
    filename: String,
    message: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct ResultSummary {
    output_format: String,
    filename: String,
    size_bytes: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct JobStatus {
    job_id: Uuid,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<ResultSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "SUCCESS" | "FAILURE")
    }

    fn print(&self) {
        output::print_header(&format!("Job: {}", self.job_id));
        output::print_detail("Status", &output::status_label(&self.status).to_string());
        if let Some(progress) = self.progress {
            let current = self.current.as_deref().unwrap_or("");
            output::print_detail("Progress", &format!("{}% {}", progress, current));
        }
        if let Some(result) = &self.result {
            output::print_detail("Output", &result.filename);
            output::print_detail("Format", &result.output_format);
            output::print_detail("Size", &format!("{} bytes", result.size_bytes));
        }
        if let Some(error) = &self.error {
            let kind = self.error_type.as_deref().unwrap_or("error");
            output::print_detail("Error", &format!("{} ({})", error, kind));
        }
        if let Some(message) = &self.message {
            output::print_detail("Message", message);
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn convert(args: ConvertArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let submitted: JobSubmitted = client
        .upload(
            "/jobs/convert",
            "file",
            &[args.file.as_path()],
            &args.conversion.query(),
        )
        .await?;

    match format {
        OutputFormat::Table => {
            output::print_success("Job submitted");
            output::print_detail("Job ID", &submitted.job_id.to_string());
            output::print_detail("File", &submitted.filename);
        }
        _ => output::print_item(&submitted, format)?,
    }

    if !args.wait {
        return Ok(());
    }

    let status = wait_for(client, submitted.job_id, Duration::from_secs(args.timeout)).await?;
    if status.status != "SUCCESS" {
        match format {
            OutputFormat::Table => status.print(),
            _ => output::print_item(&status, format)?,
        }
        anyhow::bail!("Job {} did not succeed", submitted.job_id);
    }

    download(client, submitted.job_id, args.out).await
}

pub async fn status(args: StatusArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: JobStatus = client.get(&format!("/jobs/{}", args.job_id)).await?;
    match format {
        OutputFormat::Table => status.print(),
        _ => output::print_item(&status, format)?,
    }
    Ok(())
}

pub async fn result(args: ResultArgs, client: &ApiClient) -> Result<()> {
    download(client, args.job_id, args.out).await
}

async fn download(client: &ApiClient, job_id: Uuid, out: Option<PathBuf>) -> Result<()> {
    let file = client.download(&format!("/jobs/{}/result", job_id)).await?;
    let path = save_download(file, out.as_deref(), &format!("{}.bin", job_id))?;
    output::print_success(&format!("Saved {}", path.display()));
    Ok(())
}

async fn wait_for(client: &ApiClient, job_id: Uuid, timeout: Duration) -> Result<JobStatus> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_status = String::new();
    loop {
        let status: JobStatus = client.get(&format!("/jobs/{}", job_id)).await?;
        if status.is_terminal() {
            return Ok(status);
        }
        if status.status != last_status {
            output::print_info(&format!("Job {} is {}", job_id, status.status));
            last_status = status.status.clone();
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("Timed out waiting for job {}", job_id);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parses_server_shape() {
        let json = r#"{
            "job_id": "6f1c2f9e-3b7a-4c1e-9a55-0f4c2b1d7e10",
            "status": "SUCCESS",
            "result": {"output_format": "jpeg", "filename": "a_converted.jpg", "size_bytes": 12},
            "message": "Job completed."
        }"#;
        let status: JobStatus = serde_json::from_str(json).unwrap();
        assert!(status.is_terminal());
        assert_eq!(status.result.unwrap().size_bytes, 12);

        let pending: JobStatus = serde_json::from_str(
            r#"{"job_id": "6f1c2f9e-3b7a-4c1e-9a55-0f4c2b1d7e10", "status": "PENDING"}"#,
        )
        .unwrap();
        assert!(!pending.is_terminal());
    }
}
