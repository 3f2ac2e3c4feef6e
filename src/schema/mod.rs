//! Record-shape handling: the field catalogue, batch normalization, Arrow
//! conversion and the canonical-schema reconciler.

pub mod arrow_impl;
pub mod catalog;
pub mod normalize;
pub mod reconcile;

pub use catalog::FieldCatalog;
pub use normalize::{Normalizer, RawBatch, RawColumn};
pub use reconcile::{SchemaReconciler, SchemaState};
