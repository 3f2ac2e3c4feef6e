// In: src/pipeline/tests.rs

//! End-to-end scenarios over a real output directory.

use std::cell::RefCell;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use arrow::array::{Array, BooleanArray, Int64Array};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::orchestrator::CancellationToken;
use super::traits::{FilterPredicate, GraphExporter, RecordProducer, RecordStream};
use super::*;
use crate::config::{OutputFormat, TimeBucket};
use crate::types::snowflake::SNOWFLAKE_EPOCH_MS;
use crate::types::{SnowflakeId, Value};

//==================================================================================
// Fixtures
//==================================================================================

fn config(dir: &Path) -> FirehoseConfig {
    FirehoseConfig {
        output_root: dir.join("out"),
        diagnostics_dir: dir.join("diag"),
        formats: vec![OutputFormat::Uncompressed, OutputFormat::Snappy],
        time_bucket: TimeBucket::Daily,
        ..Default::default()
    }
}

fn open(config: FirehoseConfig) -> FirehosePipeline {
    FirehosePipeline::open(Arc::new(config)).unwrap()
}

fn status(id: i64) -> Record {
    Record::new()
        .with("id", Value::Int(id))
        .with("id_str", id.to_string().as_str())
        .with("lang", "en")
        .with("retweet_count", Value::Int(id % 7))
}

fn statuses(ids: std::ops::Range<i64>) -> Vec<Record> {
    ids.map(status).collect()
}

fn read_file(path: &Path) -> (Vec<RecordBatch>, usize) {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap()).unwrap();
    let row_groups = builder.metadata().num_row_groups();
    let batches = builder.build().unwrap().map(|b| b.unwrap()).collect();
    (batches, row_groups)
}

fn rows_in(path: &Path) -> usize {
    read_file(path).0.iter().map(|b| b.num_rows()).sum()
}

fn ids_in(path: &Path) -> Vec<i64> {
    let mut out = Vec::new();
    for batch in read_file(path).0 {
        let idx = batch.schema().index_of("id").unwrap();
        let ids = batch.column(idx).as_any().downcast_ref::<Int64Array>().unwrap();
        out.extend(ids.iter().map(|v| v.unwrap()));
    }
    out
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Hydrates every third identifier; `search` is left unsupported.
struct FakeProducer {
    calls: Vec<usize>,
}

impl RecordProducer for FakeProducer {
    fn hydrate(&mut self, ids: &[u64]) -> crate::error::Result<Vec<Record>> {
        self.calls.push(ids.len());
        Ok(ids
            .iter()
            .filter(|id| *id % 3 == 0)
            .map(|id| Record::new().with("id", Value::Int(*id as i64)))
            .collect())
    }

    fn filter<'a>(&'a mut self, predicate: &FilterPredicate) -> crate::error::Result<RecordStream<'a>> {
        let n = predicate.label().len() as i64;
        Ok(Box::new((0..n).map(|i| Ok(status(i)))))
    }
}

#[derive(Clone, Default)]
struct RecordingExporter {
    calls: Rc<RefCell<Vec<(usize, String)>>>,
}

impl GraphExporter for RecordingExporter {
    fn export(&mut self, unit: &RecordBatch, job: &str) -> crate::error::Result<()> {
        self.calls.borrow_mut().push((unit.num_rows(), job.to_string()));
        Ok(())
    }
}

//==================================================================================
// Flush control
//==================================================================================

#[test]
fn test_threshold_plus_one_flushes_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(FirehoseConfig {
        rows_per_flush_unit: 3,
        ..config(dir.path())
    });

    let first = p.process_records(&statuses(0..3), "job", false).unwrap();
    assert_eq!(first, BatchOutcome::Accumulated { unit_rows: 3 });
    let second = p.process_records(&statuses(3..4), "job", false).unwrap();
    assert_eq!(second, BatchOutcome::Flushed { rows: 4 });

    assert_eq!(p.stats().flushes, 1);
    assert_eq!(p.pending_rows(), 0);
    p.close().unwrap();
    assert_eq!(p.stats().flushes, 1);
    assert_eq!(p.files().len(), 2);
    for f in p.files() {
        assert_eq!(rows_in(f), 4);
    }
}

#[test]
fn test_zero_interval_flushes_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(FirehoseConfig {
        flush_sample_interval_secs: Some(0),
        formats: vec![OutputFormat::Snappy],
        ..config(dir.path())
    });
    let cancel = CancellationToken::new();
    let summary = p
        .run(statuses(0..4).into_iter().map(Ok), "sampled", &cancel)
        .unwrap();

    assert_eq!(summary.flushes, 4);
    assert_eq!(summary.batches_processed, 4);
    p.close().unwrap();
    let (_, row_groups) = read_file(&p.files()[0]);
    assert_eq!(row_groups, 4);
    assert_eq!(ids_in(&p.files()[0]), vec![0, 1, 2, 3]);
}

#[test]
fn test_count_ready_batches_do_not_force_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(FirehoseConfig {
        records_per_batch: 2,
        rows_per_flush_unit: 100,
        formats: vec![OutputFormat::Snappy],
        ..config(dir.path())
    });
    let summary = p
        .run(statuses(0..10).into_iter().map(Ok), "job", &CancellationToken::new())
        .unwrap();

    // 3 + 3 + 3 by count, then the remaining 1 with the final forced flush.
    assert_eq!(summary.batches_processed, 4);
    assert_eq!(summary.flushes, 1);
    assert_eq!(summary.records_received, 10);
    p.close().unwrap();
    let (_, row_groups) = read_file(&p.files()[0]);
    assert_eq!(row_groups, 1);
}

//==================================================================================
// Storage layout
//==================================================================================

#[test]
fn test_two_pipelines_same_job_never_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = open(config(dir.path()));
    let mut b = open(config(dir.path()));

    a.process_records(&statuses(0..2), "same job", true).unwrap();
    b.process_records(&statuses(2..5), "same job", true).unwrap();
    a.close().unwrap();
    b.close().unwrap();

    let name = |p: &PathBuf| p.file_name().unwrap().to_string_lossy().to_string();
    assert!(a.files().iter().all(|f| name(f).contains("_b1.")));
    assert!(b.files().iter().all(|f| name(f).contains("_b2.")));
    assert_eq!(rows_in(&a.files()[0]), 2);
    assert_eq!(rows_in(&b.files()[1]), 3);
    assert_eq!(a.last_folder(), Some(dir.path().join("out").join("samejob").as_path()));
}

#[test]
fn test_round_trip_matches_canonical_schema() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(config(dir.path()));
    p.process_records(&statuses(0..5), "rt", false).unwrap();
    p.close().unwrap();

    let canonical = p.canonical_schema().unwrap();
    for file in p.files() {
        let (batches, _) = read_file(file);
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 5);
        let schema = batches[0].schema();
        let names: Vec<&String> = schema.fields().iter().map(|f| f.name()).collect();
        let expected: Vec<&String> = canonical.fields().iter().map(|f| f.name()).collect();
        assert_eq!(names, expected);
        for (a, b) in schema.fields().iter().zip(canonical.fields().iter()) {
            assert_eq!(a.data_type(), b.data_type(), "column {}", a.name());
        }
    }
}

#[cfg(unix)]
#[test]
fn test_failed_format_is_counted_and_the_rest_still_written() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("out").join("partial");
    std::fs::create_dir_all(&folder).unwrap();
    // Block the snappy file of run 1 for today and tomorrow (midnight rollover).
    let now = chrono::Local::now();
    for day in [now, now + chrono::Duration::days(1)] {
        let bucket = day.format(TimeBucket::Daily.pattern()).to_string();
        let link = folder.join(format!("{}_b1.snappy.parquet", bucket));
        if !link.is_symlink() {
            std::os::unix::fs::symlink(dir.path().join("nowhere"), link).unwrap();
        }
    }

    let mut p = open(config(dir.path()));
    let outcome = p.process_records(&statuses(0..3), "partial", true).unwrap();
    assert_eq!(outcome, BatchOutcome::Flushed { rows: 3 });
    assert_eq!(p.pending_rows(), 0);
    assert_eq!(p.stats().write_failures, 1);
    assert_eq!(p.stats().rows_flushed, 3);
    assert_eq!(p.files().len(), 1);
    assert!(p.files()[0].to_string_lossy().ends_with("_b1.vanilla.parquet"));

    // The next unit lands in a fresh, complete file set.
    p.process_records(&statuses(3..5), "partial", true).unwrap();
    p.close().unwrap();
    assert_eq!(p.stats().write_failures, 1);
    assert_eq!(p.files().len(), 3);
    assert_eq!(ids_in(&p.files()[0]), vec![0, 1, 2]);
    assert_eq!(ids_in(&p.files()[2]), vec![3, 4]);
}

//==================================================================================
// Schema reconciliation through the pipeline
//==================================================================================

#[test]
fn test_later_batch_is_backfilled_from_catalogue() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(config(dir.path()));

    let b1 = [Record::new().with("id", Value::Int(10)).with("lang", "en")];
    let b2 = [Record::new().with("id", Value::Int(20)).with("favorited", true)];
    p.process_records(&b1, "scenario", false).unwrap();
    p.process_records(&b2, "scenario", false).unwrap();

    assert_eq!(p.stats().batches_accepted, 2);
    assert_eq!(p.stats().batches_dropped, 0);
    assert_eq!(p.pending_rows(), 2);
    assert_eq!(count_files(&dir.path().join("diag")), 0);
    p.close().unwrap();
    assert_eq!(ids_in(&p.files()[0]), vec![10, 20]);

    let (batches, _) = read_file(&p.files()[0]);
    let batch = &batches[0];
    let favorited = batch
        .column(batch.schema().index_of("favorited").unwrap())
        .as_any()
        .downcast_ref::<BooleanArray>()
        .unwrap();
    assert!(favorited.is_null(0));
    assert!(favorited.value(1));
}

#[test]
fn test_drifted_batch_is_dropped_and_unit_survives() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(config(dir.path()));

    p.process_records(&statuses(0..3), "drift", false).unwrap();
    let bad = [status(99).with("zzz_unexpected", Value::Int(1))];
    let err = p.process_records(&bad, "drift", false).unwrap_err();
    assert!(matches!(err, FirehoseError::SchemaDrift(_)));

    assert_eq!(p.pending_rows(), 3);
    assert_eq!(p.stats().batches_dropped, 1);
    assert_eq!(count_files(&dir.path().join("diag")), 1);

    p.process_records(&statuses(3..4), "drift", true).unwrap();
    p.close().unwrap();
    assert_eq!(ids_in(&p.files()[0]), vec![0, 1, 2, 3]);
}

#[test]
fn test_run_continues_past_drifted_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(FirehoseConfig {
        records_per_batch: 1,
        ..config(dir.path())
    });
    let mut records = statuses(0..6);
    records[3] = records[3].clone().with("zzz_unexpected", "x");
    records[2] = records[2].clone().with("zzz_unexpected", "x");

    let summary = p
        .run(records.into_iter().map(Ok), "mixed", &CancellationToken::new())
        .unwrap();
    // Batches: [0,1] [2,3] [4,5]; the middle one drifts.
    assert_eq!(summary.batches_processed, 2);
    assert_eq!(summary.batches_failed, 1);
    p.close().unwrap();
    assert_eq!(ids_in(&p.files()[0]), vec![0, 1, 4, 5]);
}

#[test]
fn test_field_arrival_order_does_not_change_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    let base: Vec<Record> = (0..20)
        .map(|i| {
            status(i)
                .with("favorited", i % 2 == 0)
                .with("place", Value::from(serde_json::json!({"name": "x", "id": i})))
        })
        .collect();
    let shuffled: Vec<Record> = base
        .iter()
        .map(|r| {
            let mut pairs: Vec<(String, Value)> =
                r.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
            pairs.shuffle(&mut rng);
            pairs.into_iter().collect()
        })
        .collect();

    let mut outputs = Vec::new();
    for (i, records) in [base, shuffled].iter().enumerate() {
        let mut p = open(FirehoseConfig {
            formats: vec![OutputFormat::Uncompressed],
            ..config(&dir.path().join(i.to_string()))
        });
        p.process_records(records, "order", true).unwrap();
        p.close().unwrap();
        outputs.push(read_file(&p.files()[0]).0);
    }
    assert_eq!(outputs[0], outputs[1]);
}

//==================================================================================
// Lifecycle and collaborators
//==================================================================================

#[test]
fn test_fatal_override_mismatch_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(config(dir.path()));
    let records = vec![Ok(status(1).with("aaa", Value::Int(1))), Ok(status(2))];

    let err = p
        .run(records, "fatal", &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, FirehoseError::SchemaOverrideMismatch { .. }));
    assert!(p.is_closed());
    assert!(p.files().is_empty());
}

#[test]
fn test_cancellation_flushes_partial_batch_then_closes() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(FirehoseConfig {
        formats: vec![OutputFormat::Snappy],
        ..config(dir.path())
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let stream = statuses(0..10).into_iter().enumerate().map(move |(i, r)| {
        if i == 4 {
            trigger.cancel();
        }
        Ok(r)
    });

    let summary = p.run(stream, "cancelled", &cancel).unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.records_received, 5);
    assert!(p.is_closed());
    assert_eq!(ids_in(&summary.files[0]), vec![0, 1, 2, 3, 4]);

    let after = p.process_records(&statuses(10..11), "cancelled", false);
    assert!(matches!(after, Err(FirehoseError::Cancelled)));
}

#[test]
fn test_graph_export_runs_after_successful_flush() {
    let dir = tempfile::tempdir().unwrap();
    let exporter = RecordingExporter::default();
    let calls = exporter.calls.clone();
    let mut p = open(FirehoseConfig {
        enable_graph_export: true,
        rows_per_flush_unit: 2,
        ..config(dir.path())
    })
    .with_graph_exporter(Box::new(exporter));

    p.process_records(&statuses(0..3), "graph", false).unwrap();
    p.process_records(&statuses(3..4), "graph", true).unwrap();
    assert_eq!(*calls.borrow(), vec![(3, "graph".to_string()), (1, "graph".to_string())]);
    assert_eq!(p.stats().graph_exports, 2);
}

#[test]
fn test_graph_export_disabled_is_never_called() {
    let dir = tempfile::tempdir().unwrap();
    let exporter = RecordingExporter::default();
    let calls = exporter.calls.clone();
    let mut p = open(config(dir.path())).with_graph_exporter(Box::new(exporter));
    p.process_records(&statuses(0..3), "graph", true).unwrap();
    assert!(calls.borrow().is_empty());
}

#[test]
fn test_drop_flushes_pending_unit() {
    let dir = tempfile::tempdir().unwrap();
    let files = {
        let mut p = open(config(dir.path()));
        p.process_records(&statuses(0..7), "dropped", false).unwrap();
        assert_eq!(p.pending_rows(), 7);
        let job_folder = dir.path().join("out").join("dropped");
        assert_eq!(count_files(&job_folder), 0);
        drop(p);
        std::fs::read_dir(job_folder)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect::<Vec<_>>()
    };
    assert_eq!(files.len(), 2);
    for f in files {
        assert_eq!(rows_in(&f), 7);
    }
}

//==================================================================================
// Producer-driven entry points
//==================================================================================

#[test]
fn test_ingest_range_hydrates_enumerated_ids() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(FirehoseConfig {
        origin_tags: vec![1, 2],
        fetch_batch_size: 4,
        formats: vec![OutputFormat::Snappy],
        ..config(dir.path())
    });
    let mut producer = FakeProducer { calls: Vec::new() };
    let begin = 1_500_000_000_000i64;

    let summary = p
        .ingest_range(&mut producer, begin, begin + 5, None, &CancellationToken::new())
        .unwrap();
    // 5 ms x 2 tags = 10 ids in batches of 4.
    assert_eq!(producer.calls, vec![4, 4, 2]);
    assert_eq!(summary.job, format!("ingest_range_{}_to_{}", begin, begin + 5));

    p.close().unwrap();
    let ids = ids_in(&p.files()[0]);
    assert_eq!(ids.len() as u64, summary.records_received);
    for id in ids {
        let id = SnowflakeId(id as u64);
        assert_eq!(id.sequence(), 0);
        assert!(id.timestamp_ms(SNOWFLAKE_EPOCH_MS) >= begin);
    }
}

#[test]
fn test_process_ids_default_job_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(config(dir.path()));
    let mut producer = FakeProducer { calls: Vec::new() };
    let summary = p
        .process_ids(&mut producer, &[9, 10, 12], None, &CancellationToken::new())
        .unwrap();
    assert_eq!(summary.job, "process_ids_9");
    assert_eq!(summary.records_received, 2);
    assert!(p.last_folder().unwrap().ends_with("process_ids_9"));
}

#[test]
fn test_search_and_filter_entry_points() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = open(config(dir.path()));
    let mut producer = FakeProducer { calls: Vec::new() };
    let cancel = CancellationToken::new();

    let err = p.search(&mut producer, "rust", None, &cancel).unwrap_err();
    assert!(matches!(err, FirehoseError::Producer(_)));

    let predicate = FilterPredicate::Track("rust,arrow".into());
    let summary = p.filter(&mut producer, &predicate, None, &cancel).unwrap();
    assert_eq!(summary.job, "filter_rust,arrow");
    assert_eq!(summary.records_received, 10);
    assert!(p.last_folder().unwrap().ends_with("filter_rustarrow"));
}
