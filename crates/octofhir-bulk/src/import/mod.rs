//! Bulk import client
//!
//! Turns an NDJSON file into sequential `transaction` Bundle submissions:
//!
//! ```text
//! Idle -> Reading -> Accumulating -> Submitting -> Reporting -> (Reading ...) -> Done
//!                         \                  \
//!                          Aborted (bad line) Aborted (transport / non-2xx)
//! ```
//!
//! Batches go out strictly one after another so later batches can reference
//! resources created by earlier ones. Entry-level failures inside an accepted
//! transaction are reported and the import carries on.

mod batch;
mod reader;
mod submit;

pub use batch::{BatchAccumulator, ImportBatch, build_transaction_bundle};
pub use reader::NdjsonReader;
pub use submit::{BatchReport, EntryOutcome, submit_batch};

use std::num::NonZeroUsize;

use tokio_util::sync::CancellationToken;

use crate::transport::BulkTransport;
use crate::{Error, Result};

/// Totals for a finished import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub batches: usize,
    pub resources: usize,
    pub failed_entries: usize,
}

/// Import orchestrator over a [`BulkTransport`].
pub struct Importer<'a, T: BulkTransport + ?Sized> {
    transport: &'a T,
    batch_size: Option<NonZeroUsize>,
}

impl<'a, T: BulkTransport + ?Sized> Importer<'a, T> {
    /// `batch_size` of `None` submits the whole input as one transaction.
    pub fn new(transport: &'a T, batch_size: Option<NonZeroUsize>) -> Self {
        Self {
            transport,
            batch_size,
        }
    }

    /// Read `reader` to the end, submitting each batch as soon as it is full.
    ///
    /// `on_report` is called after every accepted transaction. A malformed
    /// line stops the import before its batch is sent; a failed transaction
    /// stops it before the next batch.
    pub async fn run<F>(
        &self,
        reader: &mut NdjsonReader,
        cancel: &CancellationToken,
        mut on_report: F,
    ) -> Result<ImportSummary>
    where
        F: FnMut(&BatchReport),
    {
        tracing::info!(
            source = reader.source(),
            batch_size = self.batch_size.map(NonZeroUsize::get),
            "Starting bulk import"
        );

        let mut accumulator = BatchAccumulator::new(self.batch_size);
        let mut summary = ImportSummary::default();

        while let Some((line_number, line)) = reader.next_line().await? {
            if let Some(batch) = accumulator.push(line_number, &line)? {
                self.submit(batch, &mut summary, cancel, &mut on_report)
                    .await?;
            }
        }
        if let Some(batch) = accumulator.finish() {
            self.submit(batch, &mut summary, cancel, &mut on_report)
                .await?;
        }

        tracing::info!(
            batches = summary.batches,
            resources = summary.resources,
            failed_entries = summary.failed_entries,
            "Bulk import finished"
        );
        Ok(summary)
    }

    async fn submit<F>(
        &self,
        batch: ImportBatch,
        summary: &mut ImportSummary,
        cancel: &CancellationToken,
        on_report: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&BatchReport),
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let batch_number = summary.batches + 1;
        tracing::debug!(
            batch_number,
            first_line = batch.first_line(),
            resources = batch.len(),
            "Submitting transaction bundle"
        );

        let entries = submit_batch(self.transport, &batch.to_bundle()).await?;
        if entries.len() != batch.len() {
            tracing::warn!(
                batch_number,
                submitted = batch.len(),
                returned = entries.len(),
                "Transaction response entry count does not match the submitted bundle"
            );
        }

        let report = BatchReport {
            batch_number,
            first_line: batch.first_line(),
            submitted: batch.len(),
            entries,
        };
        for (index, entry) in report.failures() {
            tracing::warn!(
                batch_number,
                entry = index,
                status = %entry.status,
                outcome = entry.outcome_text().unwrap_or("-"),
                "Resource rejected inside transaction"
            );
        }

        summary.batches += 1;
        summary.resources += report.submitted;
        summary.failed_entries += report.failures().count();
        on_report(&report);
        Ok(())
    }
}
