//! This file is the root of the `firehose` Rust crate.
//!
//! Its responsibilities are strictly limited to:
//! 1.  Declaring all the top-level modules of the library (`schema`, `pipeline`, etc.)
//!     so the Rust compiler knows they exist.
//! 2.  Re-exporting the types a caller needs to open a pipeline, feed it records
//!     and inspect what it wrote.

//==================================================================================
// 0. Constants
//==================================================================================
/// The crate version, automatically set from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
//==================================================================================
// 1. Module Declarations
//==================================================================================
#[macro_use]
pub mod observability; // Make macros available throughout the crate

pub mod config;
pub mod enumerator;
pub mod error;
pub mod pipeline;
pub mod schema;
pub mod types;

//==================================================================================
// 2. Public API
//==================================================================================
pub use config::{FirehoseConfig, OutputFormat, ProducerCredentials, TimeBucket};
pub use enumerator::IdEnumerator;
pub use error::{FirehoseError, Result};
pub use observability::{init_logging, StageTimer};
pub use pipeline::orchestrator::{CancellationToken, RunSummary};
pub use pipeline::traits::{FilterPredicate, GraphExporter, RecordProducer, RecordStream};
pub use pipeline::{BatchOutcome, FirehosePipeline, PipelineStats};
pub use schema::FieldCatalog;
pub use types::{Record, SnowflakeId, Value};
