//! This module defines the core, strongly-typed data representations used
//! throughout the firehose pipeline.
//!
//! It includes the tagged-variant `Value`/`Record` model that replaces
//! runtime duck-typing of producer payloads, and the `SnowflakeId` identifier
//! layout shared by the enumerator and the decoding helpers.

pub mod snowflake;
pub mod value;

// Re-export the main type(s) for easier access.
pub use snowflake::SnowflakeId;
pub use value::{Record, Value};
