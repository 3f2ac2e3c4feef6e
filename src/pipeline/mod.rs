// In: src/pipeline/mod.rs

//! The pipeline instance: one owner for the canonical schema, the accumulated
//! unit and the open writers.
//!
//! Lifecycle is explicit. [`FirehosePipeline::open`] builds every stage from a
//! shared config, [`FirehosePipeline::process_records`] pushes one batch
//! through normalize, reconcile and merge, [`FirehosePipeline::flush`] hands
//! the unit to the writer, and [`FirehosePipeline::close`] flushes what is
//! pending and finalizes the files. Dropping an open pipeline runs `close`.
//!
//! The streaming entry points (`run`, `process_ids`, `search`, `filter`,
//! `ingest_range`) live in [`orchestrator`].

pub mod accumulator;
pub mod diagnostics;
pub mod orchestrator;
pub mod traits;
pub mod writer;

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arrow::datatypes::SchemaRef;

use crate::config::FirehoseConfig;
use crate::error::{FirehoseError, Result};
use crate::observability::StageTimer;
use crate::schema::{FieldCatalog, Normalizer, SchemaReconciler};
use crate::types::Record;

use accumulator::Accumulator;
use diagnostics::DiagnosticsSink;
use traits::GraphExporter;
use writer::{ColumnarWriter, WriteReport, GENERIC_JOB};

/// What happened to a batch handed to [`FirehosePipeline::process_records`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing was merged and nothing was flushed.
    Empty,
    /// The batch was merged; the unit now holds `unit_rows` rows.
    Accumulated { unit_rows: usize },
    /// The batch was merged and the unit of `rows` rows was flushed.
    Flushed { rows: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub batches_accepted: u64,
    pub batches_dropped: u64,
    pub rows_accepted: u64,
    pub flushes: u64,
    pub rows_flushed: u64,
    pub write_failures: u64,
    pub graph_exports: u64,
    pub graph_export_failures: u64,
}

pub struct FirehosePipeline {
    config: Arc<FirehoseConfig>,
    normalizer: Normalizer,
    reconciler: SchemaReconciler,
    accumulator: Accumulator,
    writer: ColumnarWriter,
    graph_exporter: Option<Box<dyn GraphExporter>>,
    timer: StageTimer,
    stats: PipelineStats,
    current_job: Option<String>,
    last_flush: Instant,
    closed: bool,
}

impl std::fmt::Debug for FirehosePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirehosePipeline")
            .field("locked", &self.reconciler.is_locked())
            .field("pending_rows", &self.accumulator.num_rows())
            .field("writer", &self.writer)
            .field("stats", &self.stats)
            .field("closed", &self.closed)
            .finish()
    }
}

impl FirehosePipeline {
    /// Opens a pipeline over the status-record catalogue.
    pub fn open(config: Arc<FirehoseConfig>) -> Result<Self> {
        Self::open_with_catalog(config, Arc::new(FieldCatalog::statuses()))
    }

    pub fn open_with_catalog(config: Arc<FirehoseConfig>, catalog: Arc<FieldCatalog>) -> Result<Self> {
        config.validate()?;
        log::info!(
            "Opening pipeline: root={} formats={:?} batch={} flush_unit={} interval={:?}",
            config.output_root.display(),
            config.formats,
            config.records_per_batch,
            config.rows_per_flush_unit,
            config.flush_sample_interval_secs
        );
        Ok(Self {
            normalizer: Normalizer::new(catalog.clone()),
            reconciler: SchemaReconciler::new(catalog, DiagnosticsSink::new(&config.diagnostics_dir)),
            accumulator: Accumulator::new(config.rows_per_flush_unit),
            writer: ColumnarWriter::new(&config.output_root, &config.formats, config.time_bucket),
            graph_exporter: None,
            timer: StageTimer::new(),
            stats: PipelineStats::default(),
            current_job: None,
            last_flush: Instant::now(),
            closed: false,
            config,
        })
    }

    /// Attaches the graph export collaborator. It is only called when the
    /// config enables graph export.
    pub fn with_graph_exporter(mut self, exporter: Box<dyn GraphExporter>) -> Self {
        if !self.config.enable_graph_export {
            log::warn!("Graph exporter attached but enable_graph_export is off");
        }
        self.graph_exporter = Some(exporter);
        self
    }

    pub fn config(&self) -> &Arc<FirehoseConfig> {
        &self.config
    }

    pub fn canonical_schema(&self) -> Option<SchemaRef> {
        self.reconciler.canonical_schema()
    }

    pub fn files(&self) -> &[PathBuf] {
        self.writer.files()
    }

    pub fn last_folder(&self) -> Option<&Path> {
        self.writer.last_folder()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn timer(&self) -> &StageTimer {
        &self.timer
    }

    pub fn pending_rows(&self) -> usize {
        self.accumulator.num_rows()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once the configured sampling interval has passed since the last
    /// flush (or since opening). Always false without an interval.
    pub fn flush_interval_elapsed(&self) -> bool {
        self.config
            .flush_sample_interval()
            .is_some_and(|interval| self.last_flush.elapsed() >= interval)
    }

    /// Makes the next flush start a new file set.
    pub fn roll_over(&mut self) {
        self.writer.roll_over();
    }

    /// Normalizes, reconciles and merges one batch, then flushes if the unit
    /// is over its row target or `force_flush` is set.
    ///
    /// A rejected batch ([`FirehoseError::SchemaDrift`] or
    /// [`FirehoseError::Merge`]) leaves the accumulated unit untouched.
    pub fn process_records(&mut self, records: &[Record], job: &str, force_flush: bool) -> Result<BatchOutcome> {
        if self.closed {
            return Err(FirehoseError::Cancelled);
        }
        self.current_job = Some(job.to_string());

        if !records.is_empty() {
            let n = records.len();
            let raw = self.timer.time("normalize", n, || self.normalizer.normalize(records));

            let unit_schema = self.accumulator.schema().cloned();
            let reconciled = self
                .timer
                .time("reconcile", n, || self.reconciler.reconcile(&raw, unit_schema.as_deref()));
            let table = match reconciled {
                Ok(t) => t,
                Err(e) => {
                    if !e.is_fatal() {
                        self.stats.batches_dropped += 1;
                    }
                    return Err(e);
                }
            };

            if let Err(e) = self.timer.time("merge", n, || self.accumulator.merge(table)) {
                self.stats.batches_dropped += 1;
                return Err(e);
            }
            self.stats.batches_accepted += 1;
            self.stats.rows_accepted += n as u64;
        }

        if force_flush && !self.accumulator.is_empty() {
            self.accumulator.request_flush();
        }
        if self.accumulator.should_flush() {
            return match self.flush(job)? {
                Some(report) => Ok(BatchOutcome::Flushed { rows: report.rows }),
                None => Ok(BatchOutcome::Empty),
            };
        }
        if records.is_empty() {
            Ok(BatchOutcome::Empty)
        } else {
            Ok(BatchOutcome::Accumulated {
                unit_rows: self.accumulator.num_rows(),
            })
        }
    }

    /// Writes the accumulated unit, if any, and clears it whatever the write
    /// outcome. Fails only when no format could be written.
    pub fn flush(&mut self, job: &str) -> Result<Option<WriteReport>> {
        let unit = self.accumulator.take_unit();
        self.last_flush = Instant::now();
        let Some(unit) = unit? else {
            return Ok(None);
        };

        let rows = unit.num_rows();
        let mut report = self
            .timer
            .time("write", rows, || self.writer.write_unit(&unit, job))?;
        self.stats.flushes += 1;
        self.stats.write_failures += report.failed.len() as u64;
        self.timer.report();

        if !report.any_written() {
            return match report.failed.pop() {
                Some((_, e)) => Err(e),
                None => Ok(Some(report)),
            };
        }
        self.stats.rows_flushed += rows as u64;
        log::info!(
            "Flushed {} rows to {} ({} format(s))",
            rows,
            report.prefix.display(),
            report.written.len()
        );

        if self.config.enable_graph_export {
            if let Some(exporter) = self.graph_exporter.as_mut() {
                match exporter.export(&unit, job) {
                    Ok(()) => self.stats.graph_exports += 1,
                    Err(e) => {
                        self.stats.graph_export_failures += 1;
                        log::error!("Graph export of {} rows failed: {}", rows, e);
                    }
                }
            }
        }
        Ok(Some(report))
    }

    /// Flushes the pending unit under the last job seen, then finalizes every
    /// open file. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let job = self
            .current_job
            .clone()
            .unwrap_or_else(|| GENERIC_JOB.to_string());

        let flushed = self.flush(&job);
        if let Err(e) = &flushed {
            log::error!("Final flush failed: {}", e);
        }
        let closed = self.writer.close_all();
        log::info!(
            "Pipeline closed: {} flushes, {} rows written, {} batches dropped, {} files",
            self.stats.flushes,
            self.stats.rows_flushed,
            self.stats.batches_dropped,
            self.writer.files().len()
        );
        flushed?;
        closed
    }
}

impl Drop for FirehosePipeline {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                log::error!("Pipeline teardown on drop failed: {}", e);
            }
        }
    }
}
