// In: src/schema/arrow_impl.rs

//! Marshalling between normalized raw columns and Arrow arrays.
//!
//! Two directions of typing exist. Before the canonical schema is locked, a
//! physical type is *inferred* from a column's values. After it is locked,
//! every column is *converted* against the locked type, and a value that does
//! not fit is a conversion failure for the whole batch.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, ListBuilder, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};

use crate::error::{FirehoseError, Result};
use crate::schema::catalog::{list_of, DeclaredType};
use crate::schema::normalize::{ColumnShape, RawBatch, RawColumn};
use crate::types::Value;

//==================================================================================
// I. Type Inference
//==================================================================================

/// Infers the physical type of one column. All-null columns fall back to the
/// declared type, then to text.
pub fn infer_data_type(column: &RawColumn) -> DataType {
    match column.shape() {
        ColumnShape::Empty => column
            .declared
            .map(|d| d.to_arrow_type())
            .unwrap_or(DataType::Utf8),
        ColumnShape::Bool => DataType::Boolean,
        ColumnShape::Int => DataType::Int64,
        ColumnShape::Float => DataType::Float64,
        ColumnShape::Text | ColumnShape::Map | ColumnShape::Mixed => DataType::Utf8,
        ColumnShape::List => {
            let items = column.values.iter().flat_map(|v| match v {
                Value::List(items) => items.as_slice(),
                _ => &[][..],
            });
            let item_type = match ColumnShape::of(items) {
                ColumnShape::Empty => match column.declared {
                    Some(DeclaredType::IntList) => DataType::Int64,
                    _ => DataType::Utf8,
                },
                ColumnShape::Bool => DataType::Boolean,
                ColumnShape::Int => DataType::Int64,
                ColumnShape::Float => DataType::Float64,
                _ => DataType::Utf8,
            };
            list_of(item_type)
        }
    }
}

/// Infers a nullable schema with one field per column, in column order.
pub fn infer_schema(batch: &RawBatch) -> Schema {
    Schema::new(
        batch
            .columns
            .iter()
            .map(|c| Field::new(c.name.clone(), infer_data_type(c), true))
            .collect::<Vec<_>>(),
    )
}

//==================================================================================
// II. Conversion
//==================================================================================

/// Builds a record batch whose columns are converted to `schema`'s types.
/// Column names and order must already match.
pub fn build_record_batch(batch: &RawBatch, schema: SchemaRef) -> Result<RecordBatch> {
    if batch.columns.len() != schema.fields().len() {
        return Err(FirehoseError::SchemaDrift(format!(
            "batch has {} columns, schema has {}",
            batch.columns.len(),
            schema.fields().len()
        )));
    }
    let mut arrays = Vec::with_capacity(batch.columns.len());
    for (column, field) in batch.columns.iter().zip(schema.fields().iter()) {
        if column.name != *field.name() {
            return Err(FirehoseError::SchemaDrift(format!(
                "column '{}' found where schema expects '{}'",
                column.name,
                field.name()
            )));
        }
        arrays.push(build_array(column, field.data_type())?);
    }
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows));
    Ok(RecordBatch::try_new_with_options(schema, arrays, &options)?)
}

/// Converts one column's values to an Arrow array of `data_type`.
pub fn build_array(column: &RawColumn, data_type: &DataType) -> Result<ArrayRef> {
    let array: ArrayRef = match data_type {
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(column.values.len());
            for v in &column.values {
                match v {
                    Value::Null => b.append_null(),
                    other => b.append_value(as_bool(other).ok_or_else(|| mismatch(column, other, data_type))?),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(column.values.len());
            for v in &column.values {
                match v {
                    Value::Null => b.append_null(),
                    other => b.append_value(as_i64(other).ok_or_else(|| mismatch(column, other, data_type))?),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(column.values.len());
            for v in &column.values {
                match v {
                    Value::Null => b.append_null(),
                    other => b.append_value(as_f64(other).ok_or_else(|| mismatch(column, other, data_type))?),
                }
            }
            Arc::new(b.finish())
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::with_capacity(column.values.len(), column.values.len() * 16);
            for v in &column.values {
                match v {
                    Value::Null => b.append_null(),
                    other => b.append_value(other.to_text()),
                }
            }
            Arc::new(b.finish())
        }
        DataType::List(item) => match item.data_type() {
            DataType::Boolean => build_list(column, data_type, BooleanBuilder::new(), |b, v| {
                as_bool(v).map(|x| b.append_value(x))
            })?,
            DataType::Int64 => build_list(column, data_type, Int64Builder::new(), |b, v| {
                as_i64(v).map(|x| b.append_value(x))
            })?,
            DataType::Float64 => build_list(column, data_type, Float64Builder::new(), |b, v| {
                as_f64(v).map(|x| b.append_value(x))
            })?,
            DataType::Utf8 => build_list(column, data_type, StringBuilder::new(), |b, v| {
                b.append_value(v.to_text());
                Some(())
            })?,
            other => {
                return Err(FirehoseError::SchemaDrift(format!(
                    "column '{}': unsupported list item type {:?}",
                    column.name, other
                )))
            }
        },
        other => {
            return Err(FirehoseError::SchemaDrift(format!(
                "column '{}': unsupported physical type {:?}",
                column.name, other
            )))
        }
    };
    Ok(array)
}

/// Shared list assembly. `push` appends one non-null item to the child
/// builder and returns `None` if the item does not fit the item type.
fn build_list<B, F>(
    column: &RawColumn,
    data_type: &DataType,
    values_builder: B,
    mut push: F,
) -> Result<ArrayRef>
where
    B: arrow::array::ArrayBuilder,
    F: FnMut(&mut B, &Value) -> Option<()>,
{
    let mut b = ListBuilder::new(values_builder);
    for v in &column.values {
        match v {
            Value::Null => b.append_null(),
            Value::List(items) => {
                for item in items {
                    if item.is_null() {
                        append_child_null(b.values());
                    } else {
                        push(b.values(), item).ok_or_else(|| mismatch(column, v, data_type))?;
                    }
                }
                b.append(true);
            }
            other => return Err(mismatch(column, other, data_type)),
        }
    }
    Ok(Arc::new(b.finish()))
}

/// Appends a null to any of the child builders used by `build_list`.
fn append_child_null<B: arrow::array::ArrayBuilder>(builder: &mut B) {
    let any = builder.as_any_mut();
    if let Some(b) = any.downcast_mut::<Int64Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<Float64Builder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<BooleanBuilder>() {
        b.append_null();
    } else if let Some(b) = any.downcast_mut::<StringBuilder>() {
        b.append_null();
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.2e18 => Some(*f as i64),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn mismatch(column: &RawColumn, value: &Value, data_type: &DataType) -> FirehoseError {
    FirehoseError::SchemaDrift(format!(
        "column '{}': cannot convert {} value {} to {:?}",
        column.name,
        value.kind_name(),
        value.to_json_text(),
        data_type
    ))
}
