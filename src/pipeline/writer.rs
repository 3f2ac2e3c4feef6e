// In: src/pipeline/writer.rs

//! The columnar storage writer.
//!
//! Files live at `<root>/<job>/<bucket>_b<run>.<format>.parquet`, one sibling
//! per configured format. A writer set stays open while consecutive flush
//! units share the job, the time bucket and the schema. Any change, or an
//! explicit [`ColumnarWriter::roll_over`], finalizes the open files and starts
//! a new set at the first `_b<run>` with no existing file for any format.
//! Files are created with `create_new`, so nothing on disk is ever
//! overwritten, and each flush unit becomes exactly one row group per file.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use hashbrown::HashMap;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::config::{OutputFormat, TimeBucket};
use crate::error::{FirehoseError, Result};

/// Job name used when a caller supplies none, or one with no safe characters.
pub const GENERIC_JOB: &str = "generic_job";

/// Keeps ASCII letters, digits, `-` and `_`.
pub fn sanitize_job_name(job: &str) -> String {
    let clean: String = job
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if clean.is_empty() {
        GENERIC_JOB.to_string()
    } else {
        clean
    }
}

struct OpenWriter {
    writer: ArrowWriter<File>,
    path: PathBuf,
}

/// The set of files currently receiving flush units.
#[derive(Debug, Clone, PartialEq)]
struct ActiveSet {
    job: String,
    bucket: String,
    prefix: PathBuf,
    schema: SchemaRef,
}

/// Outcome of one flush unit across all formats.
#[derive(Debug)]
pub struct WriteReport {
    pub prefix: PathBuf,
    pub rows: usize,
    pub written: Vec<OutputFormat>,
    pub failed: Vec<(OutputFormat, FirehoseError)>,
}

impl WriteReport {
    pub fn any_written(&self) -> bool {
        !self.written.is_empty()
    }
}

pub struct ColumnarWriter {
    root: PathBuf,
    formats: Vec<OutputFormat>,
    time_bucket: TimeBucket,
    writers: HashMap<OutputFormat, OpenWriter>,
    active: Option<ActiveSet>,
    files: Vec<PathBuf>,
    last_folder: Option<PathBuf>,
    force_roll: bool,
}

impl std::fmt::Debug for ColumnarWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnarWriter")
            .field("root", &self.root)
            .field("formats", &self.formats)
            .field("open", &self.writers.len())
            .field("active", &self.active.as_ref().map(|a| &a.prefix))
            .field("files", &self.files.len())
            .finish()
    }
}

impl ColumnarWriter {
    pub fn new(root: impl Into<PathBuf>, formats: &[OutputFormat], time_bucket: TimeBucket) -> Self {
        let mut unique: Vec<OutputFormat> = Vec::with_capacity(formats.len());
        for f in formats {
            if !unique.contains(f) {
                unique.push(*f);
            }
        }
        Self {
            root: root.into(),
            formats: unique,
            time_bucket,
            writers: HashMap::new(),
            active: None,
            files: Vec::new(),
            last_folder: None,
            force_roll: false,
        }
    }

    /// Every file created by this writer, in creation order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn last_folder(&self) -> Option<&Path> {
        self.last_folder.as_deref()
    }

    /// Prefix of the open writer set, if any.
    pub fn active_prefix(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.prefix.as_path())
    }

    /// The next write starts a new file set even within the same bucket.
    pub fn roll_over(&mut self) {
        self.force_roll = true;
    }

    /// Writes one flush unit under the current local-time bucket.
    pub fn write_unit(&mut self, unit: &RecordBatch, job: &str) -> Result<WriteReport> {
        let bucket = chrono::Local::now().format(self.time_bucket.pattern()).to_string();
        self.write_unit_in_bucket(unit, job, &bucket)
    }

    /// Writes one flush unit under an explicit bucket label. A format that
    /// fails to open or write is reported and does not stop the others; the
    /// next unit then goes to a fresh file set.
    pub(crate) fn write_unit_in_bucket(
        &mut self,
        unit: &RecordBatch,
        job: &str,
        bucket: &str,
    ) -> Result<WriteReport> {
        let job = sanitize_job_name(job);
        let folder = self.root.join(&job);
        fs::create_dir_all(&folder)?;
        self.last_folder = Some(folder.clone());

        let schema = unit.schema();
        let reuse = !self.force_roll
            && self.active.as_ref().is_some_and(|a| {
                a.job == job && a.bucket == bucket && a.schema == schema
            });

        let mut failed = Vec::new();
        if !reuse {
            if let Err(e) = self.close_all() {
                log::error!("Finalizing previous files failed: {}", e);
            }
            self.force_roll = false;
            let (prefix, run) = next_free_prefix(&folder, bucket, &self.formats);
            if run > 1 {
                log::info!("Starting new batch for existing bucket: {}", prefix.display());
            }
            for format in self.formats.clone() {
                match open_writer(&prefix, format, schema.clone()) {
                    Ok(w) => {
                        self.files.push(w.path.clone());
                        self.writers.insert(format, w);
                    }
                    Err(e) => {
                        log::error!("Could not open {} writer: {}", format.file_token(), e);
                        failed.push((format, FirehoseError::write(format.file_token(), e)));
                        self.force_roll = true;
                    }
                }
            }
            self.active = Some(ActiveSet {
                job,
                bucket: bucket.to_string(),
                prefix,
                schema,
            });
        }

        let prefix = self
            .active
            .as_ref()
            .map(|a| a.prefix.clone())
            .unwrap_or_default();
        let mut written = Vec::new();
        for format in self.formats.clone() {
            let Some(open) = self.writers.get_mut(&format) else {
                // Open failures were already reported above.
                if reuse {
                    log::error!("No open {} writer for {}", format.file_token(), prefix.display());
                    let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "no open writer");
                    failed.push((format, FirehoseError::write(format.file_token(), missing.into())));
                    self.force_roll = true;
                }
                continue;
            };
            log::info!(
                "Writing {} ({} x {})",
                format.file_token(),
                unit.num_rows(),
                unit.num_columns()
            );
            let outcome = open.writer.write(unit).and_then(|_| open.writer.flush());
            match outcome {
                Ok(()) => written.push(format),
                Err(e) => {
                    log::error!("Failed to write {}: {}", open.path.display(), e);
                    failed.push((format, FirehoseError::write(format.file_token(), e.into())));
                    self.force_roll = true;
                }
            }
        }

        crate::log_metric!(
            "event" = "write_unit",
            "job" = self.active.as_ref().map_or("", |a| a.job.as_str()),
            "rows" = unit.num_rows(),
            "formats_ok" = written.len(),
            "formats_failed" = failed.len()
        );

        Ok(WriteReport {
            prefix,
            rows: unit.num_rows(),
            written,
            failed,
        })
    }

    /// Finalizes every open file. Safe to call repeatedly; returns the first
    /// error after attempting all of them.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for (format, open) in self.writers.drain() {
            log::info!("Closing {} writer {}", format.file_token(), open.path.display());
            if let Err(e) = open.writer.close() {
                log::error!("Closing {} failed: {}", open.path.display(), e);
                first_err.get_or_insert(FirehoseError::write(format.file_token(), e.into()));
            }
        }
        self.active = None;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ColumnarWriter {
    fn drop(&mut self) {
        if !self.writers.is_empty() {
            if let Err(e) = self.close_all() {
                log::error!("Closing writers on drop failed: {}", e);
            }
        }
    }
}

fn file_path(prefix: &Path, format: OutputFormat) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!(".{}.parquet", format.file_token()));
    PathBuf::from(name)
}

/// First `<folder>/<bucket>_b<run>` (run from 1) with no file for any format.
fn next_free_prefix(folder: &Path, bucket: &str, formats: &[OutputFormat]) -> (PathBuf, u32) {
    let mut run = 1u32;
    loop {
        let prefix = folder.join(format!("{}_b{}", bucket, run));
        if !formats.iter().any(|f| file_path(&prefix, *f).exists()) {
            return (prefix, run);
        }
        run += 1;
    }
}

fn open_writer(prefix: &Path, format: OutputFormat, schema: SchemaRef) -> Result<OpenWriter> {
    let path = file_path(prefix, format);
    let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    let props = WriterProperties::builder()
        .set_compression(format.compression())
        .set_max_row_group_size(usize::MAX)
        .build();
    let writer = ArrowWriter::try_new(file, schema, Some(props))?;
    log::info!("Created {} writer {}", format.file_token(), path.display());
    Ok(OpenWriter { writer, path })
}
