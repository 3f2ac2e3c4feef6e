// In: src/config.rs

//! The single source of truth for all firehose pipeline configuration.
//!
//! `FirehoseConfig` is created once at the application boundary (from a JSON
//! file or built in code) and then passed down through the system via a shared,
//! read-only `Arc<FirehoseConfig>`.

use std::path::{Path, PathBuf};

use parquet::basic::{Compression, ZstdLevel};
use serde::{Deserialize, Serialize};

use crate::error::{FirehoseError, Result};

//==================================================================================
// I. Output Enums
//==================================================================================

/// One physical Parquet variant written for every flush unit. Each configured
/// format produces a sibling file sharing the same prefix.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// No page compression.
    Uncompressed,
    /// **Default:** Snappy on every column.
    #[default]
    Snappy,
    /// Zstd on every column at the codec's default level.
    Zstd,
}

impl OutputFormat {
    /// The token used in file names: `<prefix>.<token>.parquet`.
    pub fn file_token(&self) -> &'static str {
        match self {
            Self::Uncompressed => "vanilla",
            Self::Snappy => "snappy",
            Self::Zstd => "zstd",
        }
    }

    /// The codec applied to each column of files in this format.
    pub fn compression(&self) -> Compression {
        match self {
            Self::Uncompressed => Compression::UNCOMPRESSED,
            Self::Snappy => Compression::SNAPPY,
            Self::Zstd => Compression::ZSTD(ZstdLevel::default()),
        }
    }
}

/// Granularity of the time-bucketed file-name prefix.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    #[default]
    Hourly,
    Daily,
}

impl TimeBucket {
    /// `chrono` format string for the bucket prefix.
    pub fn pattern(&self) -> &'static str {
        match self {
            Self::Hourly => "%Y_%m_%d_%H",
            Self::Daily => "%Y_%m_%d",
        }
    }
}

/// An opaque credential set handed through to the record producer. The
/// pipeline itself never reads these fields.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

//==================================================================================
// II. The Unified FirehoseConfig
//==================================================================================

/// The single, unified configuration for a firehose pipeline instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct FirehoseConfig {
    /// The orchestrator hands its record buffer to the pipeline once the buffer
    /// holds more than this many records.
    #[serde(default = "default_records_per_batch")]
    pub records_per_batch: usize,

    /// **The target number of rows per row group.** The accumulated unit is
    /// flushed once it holds more than this many rows.
    #[serde(default = "default_rows_per_flush_unit")]
    pub rows_per_flush_unit: usize,

    /// If set, a flush is forced whenever this many seconds have elapsed since
    /// the previous flush.
    #[serde(default)]
    pub flush_sample_interval_secs: Option<u64>,

    /// Invoke the graph export collaborator after every successful flush.
    #[serde(default)]
    pub enable_graph_export: bool,

    /// Number of identifiers handed to the producer per hydrate call.
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,

    /// Root folder under which `<job>/<bucket>_b<run>.<format>.parquet` files land.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Folder receiving `fail_<uuid>.jsonl` dumps of rejected batches.
    #[serde(default = "default_diagnostics_dir")]
    pub diagnostics_dir: PathBuf,

    /// Physical variants written for every flush unit.
    #[serde(default = "default_formats")]
    pub formats: Vec<OutputFormat>,

    #[serde(default)]
    pub time_bucket: TimeBucket,

    /// Millisecond epoch that Snowflake timestamps are offset from.
    #[serde(default = "default_snowflake_epoch")]
    pub snowflake_epoch: i64,

    /// Origin (machine) tags enumerated for every millisecond of a range.
    #[serde(default = "default_origin_tags")]
    pub origin_tags: Vec<u16>,

    /// Credential sets for the producer.
    #[serde(default)]
    pub credentials: Vec<ProducerCredentials>,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            records_per_batch: default_records_per_batch(),
            rows_per_flush_unit: default_rows_per_flush_unit(),
            flush_sample_interval_secs: None,
            enable_graph_export: false,
            fetch_batch_size: default_fetch_batch_size(),
            output_root: default_output_root(),
            diagnostics_dir: default_diagnostics_dir(),
            formats: default_formats(),
            time_bucket: TimeBucket::default(),
            snowflake_epoch: default_snowflake_epoch(),
            origin_tags: default_origin_tags(),
            credentials: Vec::new(),
        }
    }
}

impl FirehoseConfig {
    /// Parses a config from a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FirehoseConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.records_per_batch == 0 {
            return Err(FirehoseError::InvalidConfig(
                "records_per_batch must be at least 1".into(),
            ));
        }
        if self.rows_per_flush_unit == 0 {
            return Err(FirehoseError::InvalidConfig(
                "rows_per_flush_unit must be at least 1".into(),
            ));
        }
        if self.fetch_batch_size == 0 {
            return Err(FirehoseError::InvalidConfig(
                "fetch_batch_size must be at least 1".into(),
            ));
        }
        if self.formats.is_empty() {
            return Err(FirehoseError::InvalidConfig(
                "at least one output format is required".into(),
            ));
        }
        if let Some(tag) = self.origin_tags.iter().find(|&&t| t > 0x3FF) {
            return Err(FirehoseError::InvalidConfig(format!(
                "origin tag {} does not fit in 10 bits",
                tag
            )));
        }
        Ok(())
    }

    pub fn flush_sample_interval(&self) -> Option<std::time::Duration> {
        self.flush_sample_interval_secs
            .map(std::time::Duration::from_secs)
    }
}

fn default_records_per_batch() -> usize {
    100
}

fn default_rows_per_flush_unit() -> usize {
    5_000
}

fn default_fetch_batch_size() -> usize {
    100
}

fn default_output_root() -> PathBuf {
    PathBuf::from("firehose_data")
}

fn default_diagnostics_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Snappy]
}

fn default_snowflake_epoch() -> i64 {
    crate::types::snowflake::SNOWFLAKE_EPOCH_MS
}

fn default_origin_tags() -> Vec<u16> {
    crate::types::snowflake::DEFAULT_ORIGIN_TAGS.to_vec()
}
