//! The seams to the pipeline's external collaborators.
//!
//! The network client that hydrates and streams records, and the optional
//! graph store, live outside this crate. The pipeline only needs the two
//! narrow interfaces below.

use arrow::record_batch::RecordBatch;

use crate::error::{FirehoseError, Result};
use crate::types::Record;

/// A lazily-consumed stream of records. Items may fail individually.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<Record>> + 'a>;

/// A streaming filter handed to [`RecordProducer::filter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterPredicate {
    /// Comma-separated keywords.
    Track(String),
    /// Comma-separated bounding-box coordinates.
    Locations(String),
}

impl FilterPredicate {
    /// The raw predicate text, used to derive a default job name.
    pub fn label(&self) -> &str {
        match self {
            Self::Track(s) | Self::Locations(s) => s,
        }
    }
}

/// Source of raw records. Concurrency across credentials, if any, is the
/// implementor's business; the pipeline sees one logical sequence.
pub trait RecordProducer {
    /// Fetches the records for an explicit identifier list. Identifiers with
    /// no record are simply absent from the result.
    fn hydrate(&mut self, ids: &[u64]) -> Result<Vec<Record>>;

    /// Streams the records matching a search query.
    fn search<'a>(&'a mut self, query: &str) -> Result<RecordStream<'a>> {
        let _ = query;
        Err(FirehoseError::Producer(
            "this producer does not support search".into(),
        ))
    }

    /// Streams records matching a keyword or location filter.
    fn filter<'a>(&'a mut self, predicate: &FilterPredicate) -> Result<RecordStream<'a>> {
        let _ = predicate;
        Err(FirehoseError::Producer(
            "this producer does not support filtering".into(),
        ))
    }
}

/// Optional sink that receives every successfully written flush unit.
pub trait GraphExporter {
    fn export(&mut self, unit: &RecordBatch, job: &str) -> Result<()>;
}
