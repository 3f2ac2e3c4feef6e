// In: src/schema/normalize.rs

//! The batch normalizer: heterogeneous records in, a uniform tabular batch out.
//!
//! Policy, in order:
//! 1.  Take the union of the field names observed across the batch.
//! 2.  Drop banned fields.
//! 3.  Synthesize every expected field the batch never mentions, filled with
//!     its declared default.
//! 4.  Sort columns lexically, so arrival order of fields never matters.
//! 5.  Coerce each column with its catalogued rule, else the generic rule.
//!
//! Steps 3-5 live in [`Normalizer::conform`] and are idempotent.

use std::sync::Arc;

use crate::error::{FirehoseError, Result};
use crate::schema::catalog::{Coercion, DeclaredType, FieldCatalog};
use crate::types::{Record, Value};

//==================================================================================
// I. Tabular Batch Representation
//==================================================================================

/// The observed shape of a run of values, ignoring nulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnShape {
    /// No non-null values.
    Empty,
    Bool,
    Int,
    /// Floats, possibly mixed with ints.
    Float,
    Text,
    List,
    Map,
    Mixed,
}

impl ColumnShape {
    pub fn of<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut shape = ColumnShape::Empty;
        for v in values {
            let this = match v {
                Value::Null => continue,
                Value::Bool(_) => ColumnShape::Bool,
                Value::Int(_) => ColumnShape::Int,
                Value::Float(_) => ColumnShape::Float,
                Value::Str(_) => ColumnShape::Text,
                Value::List(_) => ColumnShape::List,
                Value::Map(_) => ColumnShape::Map,
            };
            shape = match (shape, this) {
                (ColumnShape::Empty, t) => t,
                (a, b) if a == b => a,
                (ColumnShape::Int, ColumnShape::Float) | (ColumnShape::Float, ColumnShape::Int) => {
                    ColumnShape::Float
                }
                _ => return ColumnShape::Mixed,
            };
        }
        shape
    }

    /// Uniformly boolean or numeric columns survive the generic rule untouched.
    pub fn is_scalar_native(&self) -> bool {
        matches!(
            self,
            ColumnShape::Empty | ColumnShape::Bool | ColumnShape::Int | ColumnShape::Float
        )
    }
}

/// One column of a raw batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RawColumn {
    pub name: String,
    /// The catalogue's declared type, when the field is catalogued.
    pub declared: Option<DeclaredType>,
    pub values: Vec<Value>,
}

impl RawColumn {
    pub fn shape(&self) -> ColumnShape {
        ColumnShape::of(&self.values)
    }

    /// First non-null value, for diagnostics.
    pub fn sample(&self) -> Option<&Value> {
        self.values.iter().find(|v| !v.is_null())
    }
}

/// A batch converted to columns: one per observed field plus synthesized ones.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawBatch {
    pub columns: Vec<RawColumn>,
    pub num_rows: usize,
}

impl RawBatch {
    /// Builds the column union in first-seen order. A record missing a field
    /// contributes a null to that column.
    pub fn from_records(records: &[Record]) -> Self {
        let mut columns: Vec<RawColumn> = Vec::new();
        for (row, record) in records.iter().enumerate() {
            for (name, value) in record.iter() {
                let idx = match columns.iter().position(|c| c.name == name) {
                    Some(idx) => idx,
                    None => {
                        columns.push(RawColumn {
                            name: name.to_string(),
                            declared: None,
                            values: vec![Value::Null; records.len()],
                        });
                        columns.len() - 1
                    }
                };
                columns[idx].values[row] = value.clone();
            }
        }
        Self {
            columns,
            num_rows: records.len(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&RawColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Rebuilds row-wise records, used when a rejected batch is dumped.
    pub fn to_records(&self) -> Vec<Record> {
        (0..self.num_rows)
            .map(|row| {
                self.columns
                    .iter()
                    .map(|c| (c.name.clone(), c.values[row].clone()))
                    .collect()
            })
            .collect()
    }
}

//==================================================================================
// II. The Normalizer
//==================================================================================

#[derive(Debug, Clone)]
pub struct Normalizer {
    catalog: Arc<FieldCatalog>,
}

impl Normalizer {
    pub fn new(catalog: Arc<FieldCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<FieldCatalog> {
        &self.catalog
    }

    /// Full normalization of a producer batch.
    pub fn normalize(&self, records: &[Record]) -> RawBatch {
        let mut batch = RawBatch::from_records(records);
        batch.columns.retain(|c| !self.catalog.is_banned(&c.name));
        self.conform(batch)
    }

    /// Fills missing expected fields, sorts, and coerces. Applying it to its own
    /// output changes nothing.
    pub fn conform(&self, mut batch: RawBatch) -> RawBatch {
        let num_rows = batch.num_rows;
        for field in &self.catalog.expected {
            if batch.column(&field.name).is_none() {
                batch.columns.push(RawColumn {
                    name: field.name.clone(),
                    declared: Some(field.declared),
                    values: vec![field.default.to_value(); num_rows],
                });
            }
        }

        batch.columns.sort_by(|a, b| a.name.cmp(&b.name));

        batch.columns = batch
            .columns
            .into_iter()
            .map(|mut column| {
                if column.declared.is_none() {
                    column.declared = self
                        .catalog
                        .expected_field(&column.name)
                        .map(|f| f.declared);
                }
                match self.coerce_column(&column) {
                    Ok(Some(values)) => {
                        column.values = values;
                        column
                    }
                    Ok(None) => column,
                    Err(e) => {
                        log::warn!(
                            "coercion failed on column '{}' (shape {:?}); first value: {}; {}",
                            column.name,
                            column.shape(),
                            column.sample().map_or("<none>".to_string(), |v| v.to_json_text()),
                            e
                        );
                        column
                    }
                }
            })
            .collect();
        batch
    }

    /// Applies the column's coercion. `Ok(None)` means the column is already
    /// in coerced form.
    pub fn coerce_column(&self, column: &RawColumn) -> Result<Option<Vec<Value>>> {
        match self.catalog.coercion_for(&column.name) {
            Some(Coercion::Identity) => Ok(None),
            Some(Coercion::ToText) => Ok(stringify(&column.values, false)),
            Some(Coercion::JsonText) => Ok(stringify(&column.values, true)),
            Some(Coercion::FillFalse) => fill_false(column).map(Some),
            Some(Coercion::FillZeroInt64) => fill_zero_int64(column).map(Some),
            None => Ok(generic_coercion(column)),
        }
    }
}

//==================================================================================
// III. Coercion Rules
//==================================================================================

/// Columns declared as text, and columns that are not uniformly boolean or
/// numeric, are turned into text so that a single physical type always
/// exists for them.
fn generic_coercion(column: &RawColumn) -> Option<Vec<Value>> {
    let declared_text = column.declared.is_some_and(|d| d.is_text());
    if !declared_text && column.shape().is_scalar_native() {
        return None;
    }
    stringify(&column.values, false)
}

/// Returns `None` if nothing would change.
fn stringify(values: &[Value], include_nulls: bool) -> Option<Vec<Value>> {
    let needs_change = values.iter().any(|v| match v {
        Value::Str(_) => false,
        Value::Null => include_nulls,
        _ => true,
    });
    if !needs_change {
        return None;
    }
    Some(
        values
            .iter()
            .map(|v| match v {
                Value::Null if !include_nulls => Value::Null,
                other => Value::Str(other.to_text()),
            })
            .collect(),
    )
}

fn fill_false(column: &RawColumn) -> Result<Vec<Value>> {
    column
        .values
        .iter()
        .map(|v| match v {
            Value::Null => Ok(Value::Bool(false)),
            Value::Bool(b) => Ok(Value::Bool(*b)),
            other => Err(coercion_error(column, other, "expected a boolean")),
        })
        .collect()
}

fn fill_zero_int64(column: &RawColumn) -> Result<Vec<Value>> {
    column
        .values
        .iter()
        .map(|v| match v {
            Value::Null => Ok(Value::Int(0)),
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) if f.is_nan() => Ok(Value::Int(0)),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => Ok(Value::Int(*f as i64)),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| coercion_error(column, v, "not an integer")),
            other => Err(coercion_error(column, other, "expected an integer")),
        })
        .collect()
}

fn coercion_error(column: &RawColumn, value: &Value, reason: &str) -> FirehoseError {
    FirehoseError::Normalization {
        column: column.name.clone(),
        dtype: format!("{:?}", column.shape()),
        reason: format!("{} (got {} {})", reason, value.kind_name(), value.to_json_text()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn statuses() -> Normalizer {
        Normalizer::new(Arc::new(FieldCatalog::statuses()))
    }

    #[test]
    fn test_shape_classification() {
        assert_eq!(ColumnShape::of(&[Value::Null]), ColumnShape::Empty);
        assert_eq!(
            ColumnShape::of(&[Value::Int(1), Value::Null, Value::Float(2.5)]),
            ColumnShape::Float
        );
        assert_eq!(
            ColumnShape::of(&[Value::Int(1), Value::from("x")]),
            ColumnShape::Mixed
        );
    }

    #[test]
    fn test_union_fills_missing_with_null() {
        let records = vec![
            Record::new().with("a", Value::Int(1)),
            Record::new().with("b", Value::from("x")),
        ];
        let raw = RawBatch::from_records(&records);
        assert_eq!(raw.column_names(), vec!["a", "b"]);
        assert_eq!(raw.column("a").unwrap().values, vec![Value::Int(1), Value::Null]);
        assert_eq!(raw.column("b").unwrap().values, vec![Value::Null, Value::from("x")]);
    }

    #[test]
    fn test_normalize_synthesizes_and_sorts() {
        let batch = statuses().normalize(&[Record::new()
            .with("lang", "en")
            .with("id", Value::Int(10))]);
        let names = batch.column_names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 34);
        assert_eq!(
            batch.column("favorite_count").unwrap().values,
            vec![Value::Int(0)]
        );
        assert_eq!(
            batch.column("favorite_count").unwrap().declared,
            Some(DeclaredType::Int64)
        );
        assert_eq!(batch.column("lang").unwrap().values, vec![Value::from("en")]);
    }

    #[test]
    fn test_absent_flags_stay_null() {
        let batch = statuses().normalize(&[Record::new().with("id", Value::Int(10))]);
        for flag in ["favorited", "is_quote_status", "retweeted", "truncated"] {
            let column = batch.column(flag).unwrap();
            assert_eq!(column.values, vec![Value::Null], "{}", flag);
            assert_eq!(column.declared, Some(DeclaredType::Boolean));
        }
        assert_eq!(
            batch.column("possibly_sensitive").unwrap().values,
            vec![Value::Bool(false)]
        );
        assert_eq!(
            batch.column("quoted_status").unwrap().values,
            vec![Value::from("0.0")]
        );
    }

    #[test]
    fn test_banned_field_is_replaced_by_default() {
        let batch = statuses().normalize(&[Record::new()
            .with("id", Value::Int(1))
            .with(
                "withheld_in_countries",
                Value::List(vec![Value::from("DE")]),
            )]);
        assert_eq!(
            batch.column("withheld_in_countries").unwrap().values,
            vec![Value::List(vec![])]
        );
    }

    #[test]
    fn test_catalogued_coercions() {
        let mut entities = BTreeMap::new();
        entities.insert("media".to_string(), Value::Float(f64::NAN));
        let records = vec![
            Record::new()
                .with("possibly_sensitive", Value::Null)
                .with("in_reply_to_status_id", Value::Null)
                .with("extended_entities", Value::Map(entities))
                .with("created_at", Value::Int(1234)),
            Record::new()
                .with("possibly_sensitive", Value::Bool(true))
                .with("in_reply_to_status_id", Value::Float(99.0))
                .with("created_at", "Wed Oct 10 20:19:24 +0000 2018"),
        ];
        let batch = statuses().normalize(&records);
        assert_eq!(
            batch.column("possibly_sensitive").unwrap().values,
            vec![Value::Bool(false), Value::Bool(true)]
        );
        assert_eq!(
            batch.column("in_reply_to_status_id").unwrap().values,
            vec![Value::Int(0), Value::Int(99)]
        );
        assert_eq!(
            batch.column("extended_entities").unwrap().values,
            vec![Value::from(r#"{"media":null}"#), Value::from("null")]
        );
        assert_eq!(
            batch.column("created_at").unwrap().values,
            vec![Value::from("1234"), Value::from("Wed Oct 10 20:19:24 +0000 2018")]
        );
    }

    #[test]
    fn test_generic_rule_stringifies_variant_columns() {
        let mut place = BTreeMap::new();
        place.insert("country".to_string(), Value::from("NZ"));
        let records = vec![
            Record::new()
                .with("place", Value::Map(place))
                .with("mystery", Value::Int(1))
                .with("ratio", Value::Float(0.5)),
            Record::new()
                .with("mystery", "one")
                .with("ratio", Value::Int(2)),
        ];
        let batch = statuses().normalize(&records);
        assert_eq!(
            batch.column("place").unwrap().values,
            vec![Value::from(r#"{"country":"NZ"}"#), Value::Null]
        );
        assert_eq!(
            batch.column("mystery").unwrap().values,
            vec![Value::from("1"), Value::from("one")]
        );
        // Numeric columns keep their native values.
        assert_eq!(
            batch.column("ratio").unwrap().values,
            vec![Value::Float(0.5), Value::Int(2)]
        );
    }

    #[test]
    fn test_failed_coercion_passes_column_through() {
        let records = vec![Record::new().with("quoted_status_id", "not-a-number")];
        let batch = statuses().normalize(&records);
        assert_eq!(
            batch.column("quoted_status_id").unwrap().values,
            vec![Value::from("not-a-number")]
        );

        let column = batch.column("quoted_status_id").unwrap();
        let err = statuses().coerce_column(column).unwrap_err();
        assert!(matches!(err, FirehoseError::Normalization { ref column, .. } if column == "quoted_status_id"));
    }

    #[test]
    fn test_conform_is_idempotent() {
        let mut user = BTreeMap::new();
        user.insert("screen_name".to_string(), Value::from("someone"));
        let normalizer = statuses();
        let once = normalizer.normalize(&[
            Record::new()
                .with("id", Value::Int(1))
                .with("user", Value::Map(user))
                .with("scopes", Value::Null)
                .with("display_text_range", Value::List(vec![Value::Int(0), Value::Int(5)])),
            Record::new().with("id", Value::Int(2)).with("extra", Value::Bool(true)),
        ]);
        let twice = normalizer.conform(once.clone());
        assert_eq!(once, twice);
    }
}
