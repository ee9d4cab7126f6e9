//! Transmute CLI - Command-line client for the Transmute conversion service.
//!
//! Provides commands for single conversions, batches, health, and configuration.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::config::Settings;
use commands::{batch, config, health, job, ConversionArgs};
use output::OutputFormat;

/// Transmute - image conversion service CLI
#[derive(Parser)]
#[command(
    name = "transmute",
    version,
    about = "Transmute - image conversion service",
    long_about = "Submit HEIC, DNG and JPEG images for conversion, track jobs and batches, and download results.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "TRANSMUTE_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one image for conversion
    Convert(job::ConvertArgs),

    /// Show a job's status
    Status(job::StatusArgs),

    /// Download a finished job's converted image
    Result(job::ResultArgs),

    /// Batch operations
    #[command(subcommand)]
    Batch(batch::BatchCommands),

    /// Check system health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

/// Fill conversion options the user left out from stored settings.
fn apply_defaults(args: &mut ConversionArgs, settings: &Settings) {
    if args.output_format.is_none() {
        args.output_format = settings.output_format.clone();
    }
    if args.quality.is_none() {
        args.quality = settings.quality;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // A broken settings file must not lock the user out of `config reset`.
    let settings = Settings::load().unwrap_or_else(|e| {
        output::print_info(&format!("Ignoring stored settings: {:#}", e));
        Settings::default()
    });
    let api_url = cli
        .api_url
        .clone()
        .or_else(|| settings.api_url.clone())
        .unwrap_or_else(|| "http://localhost:8000".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Convert(mut args) => {
            apply_defaults(&mut args.conversion, &settings);
            job::convert(args, &client, format).await
        }
        Commands::Status(args) => job::status(args, &client, format).await,
        Commands::Result(args) => job::result(args, &client).await,
        Commands::Batch(mut cmd) => {
            if let batch::BatchCommands::Submit { conversion, .. } = &mut cmd {
                apply_defaults(conversion, &settings);
            }
            batch::execute(cmd, &client, format).await
        }
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
