// In: src/schema/catalog.rs

//! The field catalogue for status records.
//!
//! Three tables drive normalization and schema locking:
//! 1.  The **expected fields**: every column a conformed batch must carry, with
//!     the declared physical type and the default used to synthesize it when a
//!     batch does not mention the field at all.
//! 2.  The **banned fields**: dropped from raw input before anything else.
//! 3.  The **type overrides**: `(index, name, type)` triples applied to the
//!     inferred schema of the first batch, where inference from sample values
//!     would be ambiguous (an empty list, an all-null column).

use std::sync::Arc;

use arrow::datatypes::{DataType, Field};

use crate::types::Value;

//==================================================================================
// I. Catalogue Vocabulary
//==================================================================================

/// The physical type a catalogued field is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclaredType {
    Boolean,
    Int64,
    /// Free text, or a nested structure carried as its JSON encoding.
    Text,
    IntList,
    TextList,
}

impl DeclaredType {
    pub fn to_arrow_type(&self) -> DataType {
        match self {
            Self::Boolean => DataType::Boolean,
            Self::Int64 => DataType::Int64,
            Self::Text => DataType::Utf8,
            Self::IntList => list_of(DataType::Int64),
            Self::TextList => list_of(DataType::Utf8),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text)
    }
}

/// The canonical list type: nullable items named `item`.
pub fn list_of(item: DataType) -> DataType {
    DataType::List(Arc::new(Field::new("item", item, true)))
}

/// Value used to fill a synthesized column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldDefault {
    Null,
    False,
    Zero,
    ZeroFloat,
    EmptyList,
}

impl FieldDefault {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::False => Value::Bool(false),
            Self::Zero => Value::Int(0),
            Self::ZeroFloat => Value::Float(0.0),
            Self::EmptyList => Value::List(Vec::new()),
        }
    }
}

/// Per-field coercion applied by the normalizer. Fields without an entry get
/// the generic rule (see `normalize::generic_coercion`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Pass values through untouched; the column keeps its structured shape.
    Identity,
    /// Every non-null value becomes text.
    ToText,
    /// Nulls become `false`.
    FillFalse,
    /// Nulls become `0` and every value is forced to a 64-bit integer.
    FillZeroInt64,
    /// Every value, null included, becomes its JSON text. Values that are
    /// already text are left as they are.
    JsonText,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedField {
    pub name: String,
    pub declared: DeclaredType,
    pub default: FieldDefault,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeOverride {
    /// Position of the column after lexical sorting.
    pub index: usize,
    pub name: String,
    pub data_type: DataType,
}

//==================================================================================
// II. The Catalogue
//==================================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FieldCatalog {
    pub expected: Vec<ExpectedField>,
    pub banned: Vec<String>,
    pub overrides: Vec<TypeOverride>,
    pub coercions: Vec<(String, Coercion)>,
}

impl FieldCatalog {
    /// An empty catalogue: no expected fields, no overrides, generic coercion only.
    pub fn empty() -> Self {
        Self {
            expected: Vec::new(),
            banned: Vec::new(),
            overrides: Vec::new(),
            coercions: Vec::new(),
        }
    }

    /// The status-record catalogue.
    pub fn statuses() -> Self {
        use DeclaredType::*;
        use FieldDefault::*;

        let expected: &[(&str, DeclaredType, FieldDefault)] = &[
            ("contributors", TextList, EmptyList),
            ("coordinates", Text, Null),
            ("created_at", Text, Null),
            ("display_text_range", IntList, Null),
            ("extended_entities", Text, Null),
            ("entities", Text, Null),
            ("favorited", Boolean, Null),
            ("followers", Text, Null),
            ("favorite_count", Int64, Zero),
            ("full_text", Text, Null),
            ("geo", Text, Null),
            ("id", Int64, Null),
            ("id_str", Text, Null),
            ("in_reply_to_screen_name", Text, Null),
            ("in_reply_to_status_id", Int64, Zero),
            ("in_reply_to_status_id_str", Text, Null),
            ("in_reply_to_user_id", Int64, Zero),
            ("in_reply_to_user_id_str", Text, Null),
            ("is_quote_status", Boolean, Null),
            ("lang", Text, Null),
            ("place", Text, Null),
            ("possibly_sensitive", Boolean, False),
            ("quoted_status", Text, ZeroFloat),
            ("quoted_status_id", Int64, Zero),
            ("quoted_status_id_str", Text, Null),
            ("quoted_status_permalink", Text, Null),
            ("retweet_count", Int64, Zero),
            ("retweeted", Boolean, Null),
            ("retweeted_status", Text, Null),
            ("scopes", Text, Null),
            ("source", Text, Null),
            ("truncated", Boolean, Null),
            ("user", Text, Null),
            ("withheld_in_countries", TextList, EmptyList),
        ];

        let overrides: &[(usize, &str, DeclaredType)] = &[
            (1, "coordinates", Text),
            (2, "created_at", Text),
            (3, "display_text_range", IntList),
            (4, "entities", Text),
            (5, "extended_entities", Text),
            (7, "favorited", Boolean),
            (9, "full_text", Text),
            (10, "geo", Text),
            (11, "id", Int64),
            (12, "id_str", Text),
            (13, "in_reply_to_screen_name", Text),
            (14, "in_reply_to_status_id", Int64),
            (15, "in_reply_to_status_id_str", Text),
            (16, "in_reply_to_user_id", Int64),
            (17, "in_reply_to_user_id_str", Text),
            (18, "is_quote_status", Boolean),
            (19, "lang", Text),
        ];

        let coercions: &[(&str, Coercion)] = &[
            ("display_text_range", Coercion::Identity),
            ("contributors", Coercion::Identity),
            ("created_at", Coercion::ToText),
            ("possibly_sensitive", Coercion::FillFalse),
            ("quoted_status_id", Coercion::FillZeroInt64),
            ("extended_entities", Coercion::JsonText),
            ("in_reply_to_status_id", Coercion::FillZeroInt64),
            ("in_reply_to_user_id", Coercion::FillZeroInt64),
            ("scopes", Coercion::JsonText),
            ("followers", Coercion::Identity),
            ("withheld_in_countries", Coercion::Identity),
        ];

        Self {
            expected: expected
                .iter()
                .map(|(name, declared, default)| ExpectedField {
                    name: name.to_string(),
                    declared: *declared,
                    default: *default,
                })
                .collect(),
            banned: vec!["withheld_in_countries".to_string()],
            overrides: overrides
                .iter()
                .map(|(index, name, declared)| TypeOverride {
                    index: *index,
                    name: name.to_string(),
                    data_type: declared.to_arrow_type(),
                })
                .collect(),
            coercions: coercions
                .iter()
                .map(|(name, c)| (name.to_string(), *c))
                .collect(),
        }
    }

    pub fn expected_field(&self, name: &str) -> Option<&ExpectedField> {
        self.expected.iter().find(|f| f.name == name)
    }

    pub fn is_banned(&self, name: &str) -> bool {
        self.banned.iter().any(|b| b == name)
    }

    pub fn coercion_for(&self, name: &str) -> Option<Coercion> {
        self.coercions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| *c)
    }

    /// Expected field names in the lexical order conformed batches use.
    pub fn sorted_expected_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.expected.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl Default for FieldCatalog {
    fn default() -> Self {
        Self::statuses()
    }
}
