//! `transmute health`: broker reachability and queue depth.

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Also show queued and in-flight counts
    #[arg(short, long)]
    detailed: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct QueueDepth {
    queued: u64,
    in_flight: u64,
}

/// Body of `GET /health`, returned with 200 or 503.
#[derive(Debug, Deserialize, Serialize)]
struct Health {
    status: String,
    version: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    broker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue: Option<QueueDepth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Health {
    fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let body = client.get_raw("/health").await?;
    let health: Health =
        serde_json::from_value(body).context("Unexpected /health response shape")?;

    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&health, format);
    }

    output::print_header("Service Health");
    output::print_detail("API URL", client.base_url());
    output::print_detail("Version", &health.version);
    output::print_detail("Broker", &health.broker);
    output::print_detail(
        "Checked at",
        &health
            .timestamp
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    );

    if args.detailed {
        if let Some(queue) = &health.queue {
            output::print_detail("Queued", &queue.queued.to_string());
            output::print_detail("In flight", &queue.in_flight.to_string());
        }
    }

    if health.is_healthy() {
        output::print_success("Broker reachable, accepting jobs");
    } else {
        let reason = health.error.as_deref().unwrap_or(&health.status);
        output::print_error(&format!("Service unhealthy: {}", reason));
    }
    Ok(())
}
