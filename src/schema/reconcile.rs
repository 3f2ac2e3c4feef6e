// In: src/schema/reconcile.rs

//! The schema reconciler.
//!
//! Two states. While **Unset**, the first conformed batch that converts
//! cleanly defines the canonical schema: its inferred types, with the
//! catalogue's type overrides applied. Once **Locked**, every later batch is
//! converted against that schema and never re-inferred. The lock is never
//! relaxed for the life of the reconciler.

use std::sync::Arc;

use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::error::{FirehoseError, Result};
use crate::pipeline::diagnostics::{column_diff, schema_to_json, DiagnosticsSink};
use crate::schema::arrow_impl::{build_record_batch, infer_schema};
use crate::schema::catalog::FieldCatalog;
use crate::schema::normalize::RawBatch;

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaState {
    Unset,
    Locked(SchemaRef),
}

#[derive(Debug)]
pub struct SchemaReconciler {
    catalog: Arc<FieldCatalog>,
    state: SchemaState,
    diagnostics: DiagnosticsSink,
}

impl SchemaReconciler {
    pub fn new(catalog: Arc<FieldCatalog>, diagnostics: DiagnosticsSink) -> Self {
        Self {
            catalog,
            state: SchemaState::Unset,
            diagnostics,
        }
    }

    pub fn state(&self) -> &SchemaState {
        &self.state
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, SchemaState::Locked(_))
    }

    pub fn canonical_schema(&self) -> Option<SchemaRef> {
        match &self.state {
            SchemaState::Locked(schema) => Some(schema.clone()),
            SchemaState::Unset => None,
        }
    }

    /// Converts a conformed batch into an Arrow batch matching the canonical
    /// schema, locking the schema first if needed.
    ///
    /// A batch that cannot be converted is logged column by column (against
    /// `unit_schema`, the accumulated unit's schema, when there is one), dumped
    /// to a side file and reported as [`FirehoseError::SchemaDrift`]. An
    /// override table that no longer matches the sorted columns is fatal and
    /// returned as is.
    pub fn reconcile(&mut self, batch: &RawBatch, unit_schema: Option<&Schema>) -> Result<RecordBatch> {
        let attempt = match self.canonical_schema() {
            None => self.lock(batch),
            Some(schema) => conform_to(batch, schema),
        };
        match attempt {
            Ok(table) => Ok(table),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Err(self.reject(batch, unit_schema, e)),
        }
    }

    fn lock(&mut self, batch: &RawBatch) -> Result<RecordBatch> {
        let inferred = infer_schema(batch);
        let schema = Arc::new(self.apply_overrides(inferred)?);
        let table = build_record_batch(batch, schema.clone())?;
        verify_fields(table.schema().as_ref(), &schema)?;

        log::info!(
            "Canonical schema locked with {} columns over {} rows",
            schema.fields().len(),
            batch.num_rows
        );
        for (i, field) in schema.fields().iter().enumerate() {
            log::debug!("  #{:<3} {:<28} {:?}", i, field.name(), field.data_type());
        }

        self.state = SchemaState::Locked(schema);
        Ok(table)
    }

    /// Forces the catalogued physical types onto the inferred schema. Every
    /// override must still point at the column name it was written for.
    fn apply_overrides(&self, inferred: Schema) -> Result<Schema> {
        let mut fields: Vec<Field> = inferred
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        for o in &self.catalog.overrides {
            match fields.get(o.index) {
                Some(field) if field.name() == &o.name => {
                    fields[o.index] = Field::new(o.name.clone(), o.data_type.clone(), true);
                }
                found => {
                    return Err(FirehoseError::SchemaOverrideMismatch {
                        index: o.index,
                        expected: o.name.clone(),
                        found: found
                            .map(|f| f.name().clone())
                            .unwrap_or_else(|| "<no column>".to_string()),
                    });
                }
            }
        }
        Ok(Schema::new(fields))
    }

    fn reject(&self, batch: &RawBatch, unit_schema: Option<&Schema>, cause: FirehoseError) -> FirehoseError {
        log::warn!(
            "Dropping batch of {} rows ({} columns): {}",
            batch.num_rows,
            batch.columns.len(),
            cause
        );
        let canonical = self.canonical_schema();
        self.diagnostics.report_columns(batch, canonical.as_deref());
        if let Some(unit) = unit_schema {
            match schema_to_json(unit) {
                Ok(json) => log::warn!(
                    "  accumulated unit schema: {}",
                    json.chars().take(2000).collect::<String>()
                ),
                Err(e) => log::warn!("  accumulated unit schema could not be dumped: {}", e),
            }
        }

        let dumped = match self.diagnostics.persist(batch) {
            Ok(path) => path.display().to_string(),
            Err(e) => {
                log::error!("Could not persist rejected batch: {}", e);
                "<not persisted>".to_string()
            }
        };
        log::warn!("  raw batch saved to {}", dumped);

        match cause {
            FirehoseError::SchemaDrift(msg) => {
                FirehoseError::SchemaDrift(format!("{} (raw batch: {})", msg, dumped))
            }
            other => FirehoseError::SchemaDrift(format!("{} (raw batch: {})", other, dumped)),
        }
    }
}

/// Converts a batch against a locked schema. The column set must match
/// exactly and in order.
fn conform_to(batch: &RawBatch, schema: SchemaRef) -> Result<RecordBatch> {
    let found = batch.column_names();
    let expected: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    if found != expected {
        let (missing, extra) = column_diff(&found, &expected);
        return Err(FirehoseError::SchemaDrift(format!(
            "column set differs from canonical schema (missing: {:?}, extra: {:?})",
            missing, extra
        )));
    }
    let table = build_record_batch(batch, schema.clone())?;
    verify_fields(table.schema().as_ref(), &schema)?;
    Ok(table)
}

/// Column-by-column equality of name and physical type.
fn verify_fields(actual: &Schema, canonical: &Schema) -> Result<()> {
    if actual.fields().len() != canonical.fields().len() {
        return Err(FirehoseError::SchemaDrift(format!(
            "table has {} columns, canonical schema has {}",
            actual.fields().len(),
            canonical.fields().len()
        )));
    }
    for (i, (a, c)) in actual.fields().iter().zip(canonical.fields().iter()).enumerate() {
        if a.name() != c.name() || a.data_type() != c.data_type() {
            return Err(FirehoseError::SchemaDrift(format!(
                "column #{} is '{}' {:?}, canonical is '{}' {:?}",
                i,
                a.name(),
                a.data_type(),
                c.name(),
                c.data_type()
            )));
        }
    }
    Ok(())
}
