// In: src/pipeline/orchestrator.rs

//! The streaming driver.
//!
//! Records are pulled one at a time from a producer stream into a
//! [`BatchBuffer`]. The buffer becomes ready when it holds more than
//! `records_per_batch` records, or when the flush sampling interval has
//! elapsed since the last flush. A ready buffer is pushed through
//! [`FirehosePipeline::process_records`]; interval readiness also forces a
//! flush. Per-batch failures are logged and the stream continues. Fatal
//! errors and cancellation tear the pipeline down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::enumerator::IdEnumerator;
use crate::error::{FirehoseError, Result};
use crate::pipeline::traits::{FilterPredicate, RecordProducer};
use crate::pipeline::writer::GENERIC_JOB;
use crate::pipeline::{BatchOutcome, FirehosePipeline};
use crate::types::Record;

//==================================================================================
// I. Cancellation
//==================================================================================

/// Cooperative cancellation flag, checked between records.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

//==================================================================================
// II. Batch Buffer
//==================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The buffer is over its record threshold.
    Count,
    /// The sampling interval has elapsed; the unit must be flushed too.
    Interval,
}

#[derive(Debug)]
pub struct BatchBuffer {
    records: Vec<Record>,
    threshold: usize,
}

impl BatchBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            records: Vec::with_capacity(threshold + 1),
            threshold,
        }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Interval readiness wins over count readiness.
    pub fn readiness(&self, interval_elapsed: bool) -> Option<Readiness> {
        if self.records.is_empty() {
            None
        } else if interval_elapsed {
            Some(Readiness::Interval)
        } else if self.records.len() > self.threshold {
            Some(Readiness::Count)
        } else {
            None
        }
    }

    pub fn take(&mut self) -> Vec<Record> {
        std::mem::replace(&mut self.records, Vec::with_capacity(self.threshold + 1))
    }
}

//==================================================================================
// III. Run Summary
//==================================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub job: String,
    pub records_received: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub producer_errors: u64,
    pub flushes: u64,
    pub cancelled: bool,
    pub files: Vec<PathBuf>,
}

//==================================================================================
// IV. Entry Points
//==================================================================================

impl FirehosePipeline {
    /// Drives any record stream to exhaustion or cancellation.
    ///
    /// At the end of the stream the remaining partial batch is processed with
    /// a forced flush; the writers stay open for further runs. On
    /// cancellation the partial batch is processed too, then the pipeline is
    /// closed and the summary comes back with `cancelled` set. A fatal error
    /// closes the pipeline and is returned.
    pub fn run<I>(&mut self, records: I, job: &str, cancel: &CancellationToken) -> Result<RunSummary>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        let mut summary = RunSummary {
            job: job.to_string(),
            ..Default::default()
        };
        let mut buffer = BatchBuffer::new(self.config().records_per_batch);
        log::info!("Starting job '{}'", job);

        let mut records = records.into_iter();
        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let Some(item) = records.next() else {
                break;
            };
            match item {
                Ok(record) => {
                    summary.records_received += 1;
                    buffer.push(record);
                }
                Err(e) if e.is_fatal() => return Err(self.abort(e)),
                Err(e) => {
                    summary.producer_errors += 1;
                    log::warn!("Producer error in job '{}': {}", job, e);
                    continue;
                }
            }
            if let Some(ready) = buffer.readiness(self.flush_interval_elapsed()) {
                let batch = buffer.take();
                self.dispatch(&batch, job, ready == Readiness::Interval, &mut summary)?;
            }
        }
        let rest = buffer.take();
        self.dispatch(&rest, job, true, &mut summary)?;

        if summary.cancelled {
            log::warn!("Job '{}' cancelled after {} records", job, summary.records_received);
            if let Err(e) = self.close() {
                log::error!("Teardown after cancellation failed: {}", e);
            }
        }
        summary.files = self.files().to_vec();
        log::info!(
            "Job '{}' done: {} records, {} batches ({} failed), {} flushes",
            job,
            summary.records_received,
            summary.batches_processed,
            summary.batches_failed,
            summary.flushes
        );
        Ok(summary)
    }

    /// Hydrates an explicit identifier list in `fetch_batch_size` chunks.
    pub fn process_ids(
        &mut self,
        producer: &mut dyn RecordProducer,
        ids: &[u64],
        job: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let job = match (job, ids.first()) {
            (Some(j), _) => j.to_string(),
            (None, Some(first)) => format!("process_ids_{}", first),
            (None, None) => GENERIC_JOB.to_string(),
        };
        let chunk = self.config().fetch_batch_size;
        let stream = ids.chunks(chunk).flat_map(|ids| hydrate(&mut *producer, ids));
        self.run(stream, &job, cancel)
    }

    /// Streams the results of a search query.
    pub fn search(
        &mut self,
        producer: &mut dyn RecordProducer,
        query: &str,
        job: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let job = job.map_or_else(|| format!("search_{}", head(query)), str::to_string);
        let stream = producer.search(query)?;
        self.run(stream, &job, cancel)
    }

    /// Streams records matching a keyword or location predicate.
    pub fn filter(
        &mut self,
        producer: &mut dyn RecordProducer,
        predicate: &FilterPredicate,
        job: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let job = job.map_or_else(|| format!("filter_{}", head(predicate.label())), str::to_string);
        let stream = producer.filter(predicate)?;
        self.run(stream, &job, cancel)
    }

    /// Enumerates every sequence-0 identifier in `[begin_ms, end_ms)` for the
    /// configured origin tags and hydrates them batch by batch.
    pub fn ingest_range(
        &mut self,
        producer: &mut dyn RecordProducer,
        begin_ms: i64,
        end_ms: i64,
        job: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let job = job.map_or_else(
            || format!("ingest_range_{}_to_{}", begin_ms, end_ms),
            str::to_string,
        );
        let config = self.config().clone();
        let ids = IdEnumerator::new(begin_ms, end_ms, config.snowflake_epoch, &config.origin_tags)?;
        log::info!("Enumerating {} identifiers for job '{}'", ids.total(), job);
        let stream = ids
            .batches(config.fetch_batch_size)
            .flat_map(|batch| hydrate(&mut *producer, &batch));
        self.run(stream, &job, cancel)
    }

    fn dispatch(&mut self, batch: &[Record], job: &str, force_flush: bool, summary: &mut RunSummary) -> Result<()> {
        if batch.is_empty() && !force_flush {
            return Ok(());
        }
        match self.process_records(batch, job, force_flush) {
            Ok(outcome) => {
                if !batch.is_empty() {
                    summary.batches_processed += 1;
                }
                if let BatchOutcome::Flushed { .. } = outcome {
                    summary.flushes += 1;
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(self.abort(e)),
            Err(e) => {
                summary.batches_failed += 1;
                log::warn!("Batch of {} records failed in job '{}': {}", batch.len(), job, e);
                Ok(())
            }
        }
    }

    fn abort(&mut self, cause: FirehoseError) -> FirehoseError {
        log::error!("Fatal error, tearing down: {}", cause);
        if let Err(e) = self.close() {
            log::error!("Teardown failed: {}", e);
        }
        cause
    }
}

fn hydrate(producer: &mut dyn RecordProducer, ids: &[u64]) -> Vec<Result<Record>> {
    match producer.hydrate(ids) {
        Ok(records) => records.into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e)],
    }
}

/// First 20 characters, for default job names.
fn head(s: &str) -> String {
    s.chars().take(20).collect()
}
