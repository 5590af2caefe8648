//! Download of export output files to local NDJSON files.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use super::{ExportJob, Exporter, OutputFile};
use crate::transport::BulkTransport;
use crate::{Error, Result};

const NDJSON_EXTENSION: &str = ".ndjson";

/// Local file name for an output file.
///
/// `type` followed by the URL path (query string dropped), every character
/// outside `[A-Za-z0-9]` replaced by `_`, then a single `.ndjson` suffix.
pub fn local_file_name(file: &OutputFile) -> String {
    let path = match url::Url::parse(&file.url) {
        Ok(url) => url.path().to_string(),
        Err(_) => file
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    // Sanitizing removes every '.', so the extension is always appended exactly once.
    let mut name: String = format!("{}{}", file.resource_type, path)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    name.push_str(NDJSON_EXTENSION);
    name
}

/// A download that could not be completed.
#[derive(Debug)]
pub struct FailedDownload {
    pub file: OutputFile,
    pub error: Error,
}

/// Outcome of [`Exporter::download_all`], in manifest order.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub created: Vec<PathBuf>,
    pub failed: Vec<FailedDownload>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl<T: BulkTransport + ?Sized> Exporter<'_, T> {
    /// Download every output file of a completed job into `target_dir`.
    ///
    /// Files are fetched one at a time in manifest order. A failed file is
    /// recorded in the report and the next one is still attempted.
    /// `on_created` sees each file as soon as it is complete, so files that
    /// finished before a cancellation are still announced.
    pub async fn download_all(
        &self,
        job: &ExportJob,
        target_dir: &Path,
        cancel: &CancellationToken,
        mut on_created: impl FnMut(&Path),
    ) -> Result<DownloadReport> {
        let authenticated = job
            .manifest()
            .is_some_and(|m| m.requires_access_token);
        fs::create_dir_all(target_dir).await?;

        let mut report = DownloadReport::default();
        for file in job.output() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let path = target_dir.join(local_file_name(file));

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.download_one(file, &path, authenticated) => result,
            };

            match result {
                Ok(bytes) => {
                    tracing::info!(path = %path.display(), bytes, "Export file downloaded");
                    on_created(&path);
                    report.created.push(path);
                }
                Err(error) => {
                    let _ = fs::remove_file(&path).await;
                    if matches!(error, Error::Cancelled) {
                        return Err(error);
                    }
                    tracing::warn!(url = %file.url, error = %error, "Export file download failed");
                    report.failed.push(FailedDownload {
                        file: file.clone(),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    async fn download_one(&self, file: &OutputFile, path: &Path, authenticated: bool) -> Result<u64> {
        let mut writer = BufWriter::new(File::create(path).await?);
        let written = self
            .transport
            .download_to(&file.url, authenticated, &mut writer)
            .await?;
        writer.flush().await?;
        Ok(written)
    }
}
