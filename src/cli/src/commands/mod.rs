//! CLI subcommands.

pub mod batch;
pub mod config;
pub mod health;
pub mod job;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::client::Download;

/// Conversion parameters shared by single and batch submission.
#[derive(clap::Args, Debug, Clone)]
pub struct ConversionArgs {
    /// Output format (jpeg or webp)
    #[arg(short = 'f', long = "format")]
    pub output_format: Option<String>,

    /// Encoder quality, 0-100
    #[arg(short, long, value_parser = clap::value_parser!(i64).range(0..=100))]
    pub quality: Option<i64>,

    /// Lossless WebP
    #[arg(long)]
    pub lossless: bool,
}

impl ConversionArgs {
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(format) = &self.output_format {
            query.push(("output_format", format.clone()));
        }
        if let Some(quality) = self.quality {
            query.push(("quality", quality.to_string()));
        }
        if self.lossless {
            query.push(("lossless", "true".to_string()));
        }
        query
    }
}

/// Write a download to `out`, or to the server-suggested name in the current directory.
pub fn save_download(download: Download, out: Option<&Path>, fallback: &str) -> Result<PathBuf> {
    let path = match out {
        Some(path) if path.is_dir() => {
            path.join(download.filename.as_deref().unwrap_or(fallback))
        }
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(download.filename.as_deref().unwrap_or(fallback)),
    };
    std::fs::write(&path, &download.bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
