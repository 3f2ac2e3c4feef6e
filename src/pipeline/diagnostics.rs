// In: src/pipeline/diagnostics.rs

//! Side files and log dumps for batches the pipeline rejects.
//!
//! A rejected batch is never retried. Instead its raw form is written to
//! `<dir>/fail_<uuid>.jsonl` (one JSON object per row) so it can be inspected
//! or re-fed offline, and the column-by-column comparison against the
//! canonical schema is logged at warn level.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use arrow::datatypes::Schema;
use uuid::Uuid;

use crate::error::Result;
use crate::schema::arrow_impl::infer_data_type;
use crate::schema::normalize::RawBatch;

#[derive(Debug, Clone)]
pub struct DiagnosticsSink {
    dir: PathBuf,
}

impl DiagnosticsSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the batch's rows to a fresh `fail_<uuid>.jsonl` and returns its path.
    pub fn persist(&self, batch: &RawBatch) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("fail_{}.jsonl", Uuid::new_v4()));
        let mut out = BufWriter::new(File::create(&path)?);
        for record in batch.to_records() {
            serde_json::to_writer(&mut out, &record)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(path)
    }

    /// Logs one line per column: observed shape, inferred type, the canonical
    /// type it had to match and a sample value.
    pub fn report_columns(&self, batch: &RawBatch, canonical: Option<&Schema>) {
        for (i, column) in batch.columns.iter().enumerate() {
            let expected = canonical
                .and_then(|s| s.field_with_name(&column.name).ok())
                .map(|f| format!("{:?}", f.data_type()))
                .unwrap_or_else(|| "<absent>".to_string());
            let sample = column
                .sample()
                .map(|v| truncate(&v.to_json_text(), 120))
                .unwrap_or_else(|| "null".to_string());
            log::warn!(
                "  #{:<3} {:<28} shape={:?} inferred={:?} canonical={} sample={}",
                i,
                column.name,
                column.shape(),
                infer_data_type(column),
                expected,
                sample
            );
        }
        if let Some(schema) = canonical {
            match schema_to_json(schema) {
                Ok(json) => log::warn!("  canonical schema: {}", truncate(&json, 2000)),
                Err(e) => log::warn!("  canonical schema could not be dumped: {}", e),
            }
        }
    }
}

/// The schema as JSON, for comparison dumps.
pub fn schema_to_json(schema: &Schema) -> Result<String> {
    Ok(serde_json::to_string(schema)?)
}

/// Names present only on one side, in the order they appear.
pub fn column_diff<'a>(found: &[&'a str], expected: &[&'a str]) -> (Vec<&'a str>, Vec<&'a str>) {
    let missing = expected
        .iter()
        .filter(|n| !found.contains(*n))
        .copied()
        .collect();
    let extra = found
        .iter()
        .filter(|n| !expected.contains(*n))
        .copied()
        .collect();
    (missing, extra)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Record, Value};

    #[test]
    fn test_persist_writes_one_line_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiagnosticsSink::new(dir.path().join("diag"));
        let records = vec![
            Record::new().with("id", Value::Int(1)).with("zzz", Value::from("a")),
            Record::new().with("id", Value::Int(2)),
        ];
        let path = sink.persist(&RawBatch::from_records(&records)).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("fail_") && name.ends_with(".jsonl"));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first = Record::from_json_str(lines[0]).unwrap();
        assert_eq!(first.get("zzz"), Some(&Value::from("a")));
        let second = Record::from_json_str(lines[1]).unwrap();
        assert_eq!(second.get("zzz"), Some(&Value::Null));
    }

    #[test]
    fn test_column_diff() {
        let (missing, extra) = column_diff(&["a", "c", "x"], &["a", "b", "c"]);
        assert_eq!(missing, vec!["b"]);
        assert_eq!(extra, vec!["x"]);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("ééé", 3), "é...");
    }
}
