// In: src/pipeline/accumulator.rs

//! The accumulated unit and the flush decision.
//!
//! Conformed batches are appended in arrival order. Their schemas are merged
//! eagerly so an incompatible batch is refused at merge time, while the
//! physical concatenation is deferred until the unit is taken for writing.
//! A refused batch leaves the unit exactly as it was.

use std::sync::Arc;

use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::error::{FirehoseError, Result};
use crate::schema::catalog::list_of;

#[derive(Debug)]
pub struct Accumulator {
    batches: Vec<RecordBatch>,
    schema: Option<SchemaRef>,
    total_rows: usize,
    rows_per_flush_unit: usize,
    flush_requested: bool,
}

impl Accumulator {
    pub fn new(rows_per_flush_unit: usize) -> Self {
        Self {
            batches: Vec::new(),
            schema: None,
            total_rows: 0,
            rows_per_flush_unit,
            flush_requested: false,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.total_rows
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows == 0
    }

    /// Schema of the unit so far, widened across every merged batch.
    pub fn schema(&self) -> Option<&SchemaRef> {
        self.schema.as_ref()
    }

    /// Appends `batch` to the unit, widening column types where both sides are
    /// compatible. Incompatible columns are logged and reported as
    /// [`FirehoseError::Merge`].
    pub fn merge(&mut self, batch: RecordBatch) -> Result<()> {
        let incoming = batch.schema();
        let merged = match &self.schema {
            None => incoming.clone(),
            Some(current) if current == &incoming => current.clone(),
            Some(current) => match promote_schema(current, &incoming) {
                Some(s) => Arc::new(s),
                None => {
                    log_diff(current, &incoming);
                    return Err(FirehoseError::Merge(format!(
                        "batch with {} columns is incompatible with the accumulated unit of {} columns",
                        incoming.fields().len(),
                        current.fields().len()
                    )));
                }
            },
        };

        let batch = cast_batch(&batch, &merged)?;
        if self.schema.as_ref() != Some(&merged) && !self.batches.is_empty() {
            let widened = self
                .batches
                .iter()
                .map(|b| cast_batch(b, &merged))
                .collect::<Result<Vec<_>>>()?;
            self.batches = widened;
        }

        self.schema = Some(merged);
        if batch.num_rows() > 0 {
            self.total_rows += batch.num_rows();
            self.batches.push(batch);
        }
        Ok(())
    }

    /// Marks the unit for flushing at the next check, whatever its size.
    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    pub fn flush_requested(&self) -> bool {
        self.flush_requested
    }

    /// True once the unit exceeds the row-group target, or when a flush was
    /// requested and there is anything to flush.
    pub fn should_flush(&self) -> bool {
        self.total_rows > self.rows_per_flush_unit || (self.flush_requested && self.total_rows > 0)
    }

    /// Hands the unit over as a single batch and resets the accumulator. The
    /// reset happens even if concatenation fails.
    pub fn take_unit(&mut self) -> Result<Option<RecordBatch>> {
        let batches = std::mem::take(&mut self.batches);
        let schema = self.schema.take();
        self.total_rows = 0;
        self.flush_requested = false;

        match schema {
            Some(schema) if !batches.is_empty() => Ok(Some(concat_batches(&schema, &batches)?)),
            _ => Ok(None),
        }
    }
}

//==================================================================================
// Type Promotion
//==================================================================================

fn promote_schema(current: &Schema, incoming: &Schema) -> Option<Schema> {
    if current.fields().len() != incoming.fields().len() {
        return None;
    }
    let fields = current
        .fields()
        .iter()
        .zip(incoming.fields().iter())
        .map(|(a, b)| {
            if a.name() != b.name() {
                return None;
            }
            promote_type(a.data_type(), b.data_type())
                .map(|t| Field::new(a.name().clone(), t, a.is_nullable() || b.is_nullable()))
        })
        .collect::<Option<Vec<_>>>()?;
    Some(Schema::new(fields))
}

/// The narrowest type both sides convert to without loss of meaning.
pub fn promote_type(a: &DataType, b: &DataType) -> Option<DataType> {
    use DataType::*;
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (Null, t) | (t, Null) => Some(t.clone()),
        (x, y) if is_signed_int(x) && is_signed_int(y) => Some(Int64),
        (x, y) if is_numeric(x) && is_numeric(y) => Some(Float64),
        (List(x), List(y)) => promote_type(x.data_type(), y.data_type()).map(list_of),
        _ => None,
    }
}

fn is_signed_int(t: &DataType) -> bool {
    matches!(t, DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64)
}

fn is_numeric(t: &DataType) -> bool {
    is_signed_int(t) || matches!(t, DataType::Float32 | DataType::Float64)
}

fn cast_batch(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    if &batch.schema() == schema {
        return Ok(batch.clone());
    }
    let columns = batch
        .columns()
        .iter()
        .zip(schema.fields().iter())
        .map(|(col, field)| {
            if col.data_type() == field.data_type() {
                Ok(col.clone())
            } else {
                cast(col.as_ref(), field.data_type())
            }
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

fn log_diff(current: &Schema, incoming: &Schema) {
    log::warn!(
        "Merge refused: unit has {} columns, batch has {}",
        current.fields().len(),
        incoming.fields().len()
    );
    let n = current.fields().len().max(incoming.fields().len());
    for i in 0..n {
        let left = current.fields().get(i);
        let right = incoming.fields().get(i);
        let same = match (left, right) {
            (Some(l), Some(r)) => {
                l.name() == r.name() && promote_type(l.data_type(), r.data_type()).is_some()
            }
            _ => false,
        };
        if !same {
            log::warn!(
                "  #{:<3} unit={} batch={}",
                i,
                left.map_or("<none>".to_string(), |f| format!("{} {:?}", f.name(), f.data_type())),
                right.map_or("<none>".to_string(), |f| format!("{} {:?}", f.name(), f.data_type()))
            );
        }
    }
}
