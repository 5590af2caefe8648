//! FHIR Bulk Data client for OctoFHIR.
//!
//! This crate drives the client side of two long-running bulk workflows
//! against any FHIR server:
//!
//! - **Export**: kick off a `$export` job, poll its status endpoint until the
//!   completion manifest is available, then stream every output file to disk.
//! - **Import**: read an NDJSON file line by line, group resources into
//!   batches, wrap each batch in a `transaction` Bundle and submit the bundles
//!   one after another.
//!
//! # Components
//!
//! - [`BulkTransport`] - HTTP seam used by both pipelines
//! - [`FhirClient`] - reqwest-backed transport (plus plain REST helpers)
//! - [`Exporter`] - kickoff, polling and download orchestration
//! - [`Importer`] - NDJSON batching and transaction submission
//!
//! # Example
//!
//! ```ignore
//! use octofhir_bulk::{ExportCriteria, Exporter, FhirClient, PollPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = FhirClient::new("https://example.org/fhir/R4", None);
//! let exporter = Exporter::new(&client, PollPolicy::default());
//! let cancel = CancellationToken::new();
//!
//! let mut job = exporter.start_export(&ExportCriteria::default()).await?;
//! exporter.poll_until_complete(&mut job, &cancel).await?;
//! let report = exporter.download_all(&job, ".".as_ref(), &cancel, |_| {}).await?;
//! ```

mod client;
pub mod export;
pub mod import;
mod transport;

pub use client::{AuthHeader, ClientOptions, FhirClient, RequestBody};
pub use export::{
    DownloadReport, ExportCriteria, ExportJob, ExportLevel, ExportManifest, Exporter,
    FailedDownload, KickoffOutcome, OutputFile, PollPolicy, PollStatus, local_file_name,
};
pub use import::{
    BatchAccumulator, BatchReport, EntryOutcome, ImportBatch, ImportSummary, Importer,
    NdjsonReader, build_transaction_bundle, submit_batch,
};
pub use transport::{BulkTransport, HttpReply};

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while running a bulk export or import.
#[derive(Debug, Error)]
pub enum Error {
    /// The server answered with a status or body shape the pipeline does not recognize.
    #[error("Unexpected response from {url} (HTTP {status}): {reason}")]
    UnexpectedResponse {
        url: String,
        status: u16,
        reason: String,
    },

    /// An NDJSON line could not be turned into a resource.
    #[error("Malformed resource on line {line_number} ({reason}): {line}")]
    MalformedResource {
        line_number: usize,
        line: String,
        reason: String,
    },

    /// Network-level failure (connection refused, reset, timeout).
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The export job was still running when the poll policy gave up.
    #[error("Export job not complete after {attempts} status checks ({elapsed:?})")]
    PollLimitExceeded { attempts: u32, elapsed: Duration },

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Local file I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Content type used for FHIR JSON request and response bodies.
pub const FHIR_JSON: &str = "application/fhir+json";
