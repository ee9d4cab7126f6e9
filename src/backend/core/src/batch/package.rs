//! Result packager: zip of the successful members of a batch.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::aggregate::{BatchAggregator, BatchView};
use crate::error::{ErrorCode, ErrorContext, Result, TransmuteError};
use crate::jobs::JobId;
use crate::observability::metrics::record_archive_built;

/// A packaged archive, built fresh for each request.
#[derive(Debug, Clone)]
pub struct Archive {
    /// `batch_{first 8 id chars}_results.zip`
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Entry names in archive order
    pub entries: Vec<String>,
}

#[derive(Clone)]
pub struct ResultPackager {
    aggregator: BatchAggregator,
}

impl ResultPackager {
    pub fn new(aggregator: BatchAggregator) -> Self {
        Self { aggregator }
    }

    /// Package every member that has succeeded so far.
    ///
    /// Only the dispatch has to be complete. Members still running are left
    /// out, so a call made mid-batch returns a partial archive.
    pub async fn package(&self, batch_id: JobId) -> Result<Archive> {
        let summary = match self.aggregator.view(batch_id).await? {
            BatchView::Dispatched(summary) => summary,
            BatchView::Dispatching(_) => {
                return Err(TransmuteError::new(
                    ErrorCode::BatchNotDispatched,
                    "Batch is still being dispatched. Try again shortly.",
                ))
            }
            BatchView::DispatchFailed(failure) => {
                return Err(TransmuteError::new(
                    ErrorCode::JobFailed,
                    format!("Batch dispatch failed: {}", failure.message),
                ))
            }
        };

        let mut namer = EntryNamer::default();
        let files: Vec<(String, Vec<u8>)> = summary
            .successful_outputs()
            .map(|output| (namer.name(&output.filename), output.data.clone()))
            .collect();

        if files.is_empty() {
            return Err(TransmuteError::nothing_to_package(batch_id));
        }

        let entries: Vec<String> = files.iter().map(|(name, _)| name.clone()).collect();
        let bytes = tokio::task::spawn_blocking(move || build_zip(&files)).await??;

        record_archive_built();
        tracing::info!(
            batch_id = %batch_id,
            entries = entries.len(),
            size_bytes = bytes.len(),
            "Batch archive built"
        );

        Ok(Archive {
            filename: format!("batch_{}_results.zip", batch_id.short()),
            bytes,
            entries,
        })
    }
}

/// Zip entry names must be unique; repeats get a ` (n)` suffix on the stem.
#[derive(Default)]
struct EntryNamer {
    seen: HashMap<String, usize>,
}

impl EntryNamer {
    fn name(&mut self, filename: &str) -> String {
        let count = self.seen.entry(filename.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            return filename.to_string();
        }

        let path = Path::new(filename);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{} ({}).{}", stem, count, ext),
            None => format!("{} ({})", stem, count),
        }
    }
}

fn build_zip(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, data) in files {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(data).with_error_code(ErrorCode::ArchiveError)?;
    }

    Ok(writer.finish()?.into_inner())
}
