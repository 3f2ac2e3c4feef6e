// In: src/error.rs

//! This module defines the single, unified error type for the entire firehose pipeline.
//! It uses the `thiserror` crate to provide ergonomic, context-aware error handling.
//!
//! Every stage returns `Result<T, FirehoseError>`. The orchestrator matches on the
//! error kind (see [`FirehoseError::is_fatal`]) to decide whether to drop the
//! offending unit of work and continue the stream, or to tear down and stop.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FirehoseError>;

#[derive(Error, Debug)]
pub enum FirehoseError {
    // =========================================================================
    // === Pipeline Errors (one per stage of the batch lifecycle)
    // =========================================================================
    /// A single column could not be coerced. Normally logged and swallowed by
    /// the normalizer; surfaced only when a caller coerces a column directly.
    #[error("Coercion failed on column '{column}' ({dtype}): {reason}")]
    Normalization {
        column: String,
        dtype: String,
        reason: String,
    },

    /// A batch does not map onto the canonical schema. The batch is dropped.
    #[error("Schema drift: {0}")]
    SchemaDrift(String),

    /// The physical-type override table no longer lines up with the sorted
    /// column order. Fatal for the run.
    #[error("Override table mismatch at column #{index}: expected '{expected}', found '{found}'")]
    SchemaOverrideMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    /// A conformed batch could not be concatenated onto the accumulated unit.
    #[error("Failed to merge batch into accumulated unit: {0}")]
    Merge(String),

    /// A physical write to one output format failed.
    #[error("Write to '{format}' output failed: {source}")]
    Write {
        format: String,
        #[source]
        source: Box<FirehoseError>,
    },

    /// Cooperative cancellation was observed.
    #[error("Pipeline cancelled")]
    Cancelled,

    /// The upstream record producer reported a failure.
    #[error("Producer failed: {0}")]
    Producer(String),

    /// The optional graph export collaborator failed.
    #[error("Graph export failed: {0}")]
    GraphExport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // === External Error Wrappers (Using #[from] for automatic conversion)
    // =========================================================================
    /// An error originating from the Arrow library.
    #[error("Arrow operation failed: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// An error originating from the Parquet writer or reader.
    #[error("Parquet operation failed: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// An error originating from the underlying I/O subsystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the Serde JSON library, typically during config loading
    /// or diagnostic dumps.
    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl FirehoseError {
    /// Returns `true` when the error must stop the run instead of dropping the
    /// current batch and continuing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FirehoseError::SchemaOverrideMismatch { .. }
                | FirehoseError::InvalidConfig(_)
                | FirehoseError::Cancelled
        )
    }

    pub(crate) fn write(format: impl Into<String>, source: FirehoseError) -> Self {
        FirehoseError::Write {
            format: format.into(),
            source: Box::new(source),
        }
    }
}
