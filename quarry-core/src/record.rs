//! Record model: natural keys, an explicit field schema, and tables.
//!
//! Every record carries the natural key `(entity_id, period_key)`, a revision
//! timestamp and a set of typed, nullable field values. The set of fields is
//! declared up front by a [`RecordSchema`]; tables are checked against it at
//! the merge boundary so that loosely-shaped payloads never reach the final
//! dataset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Column names owned by the record envelope; schema fields may not reuse them.
pub const RESERVED_COLUMNS: [&str; 3] = ["entity_id", "period_key", "revision"];

/// The field combination that identifies one logical record across revisions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub entity_id: String,
    pub period_key: String,
}

impl NaturalKey {
    pub fn new(entity_id: impl Into<String>, period_key: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            period_key: period_key.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entity_id, self.period_key)
    }
}

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Float,
    Int,
    Text,
    /// Stored as text, parsed under the configured date format by the calendar rule.
    Date,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Float => "float",
            FieldKind::Int => "int",
            FieldKind::Text => "text",
            FieldKind::Date => "date",
        };
        f.write_str(name)
    }
}

/// A single non-null field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value. Integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value can be stored in a field of `kind`.
    /// Float fields accept integers, since JSON does not distinguish `100` from `100.0`.
    pub fn fits(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (FieldValue::Float(_), FieldKind::Float)
                | (FieldValue::Int(_), FieldKind::Float)
                | (FieldValue::Int(_), FieldKind::Int)
                | (FieldValue::Text(_), FieldKind::Text)
                | (FieldValue::Text(_), FieldKind::Date)
        )
    }
}

fn default_nullable() -> bool {
    true
}

/// One declared field: name, type and nullability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Schema violations found at the merge boundary or when a schema is declared.
#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("field name '{0}' is reserved")]
    ReservedName(String),

    #[error("field '{0}' is declared more than once")]
    DuplicateField(String),

    #[error("record {key} has undeclared field '{field}'")]
    UnknownField { key: NaturalKey, field: String },

    #[error("record {key} field '{field}' does not hold a {expected} value")]
    KindMismatch {
        key: NaturalKey,
        field: String,
        expected: FieldKind,
    },

    #[error("record {key} is missing required field '{field}'")]
    MissingValue { key: NaturalKey, field: String },

    #[error("record has an empty entity id or period key")]
    EmptyKey,

    #[error("table schema does not match the dataset schema")]
    SchemaMismatch,
}

/// Ordered, explicit set of fields every record of a dataset may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub fields: Vec<FieldSpec>,
}

impl RecordSchema {
    /// Build a schema, rejecting reserved and duplicate names.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, SchemaError> {
        let schema = Self { fields };
        schema.check_definition()?;
        Ok(schema)
    }

    /// Check the declaration itself (used after deserializing from config).
    pub fn check_definition(&self) -> Result<(), SchemaError> {
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if RESERVED_COLUMNS.contains(&field.name.as_str()) {
                return Err(SchemaError::ReservedName(field.name.clone()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Check one record against the schema.
    pub fn conform_record(&self, record: &Record) -> Result<(), SchemaError> {
        if record.entity_id.is_empty() || record.period_key.is_empty() {
            return Err(SchemaError::EmptyKey);
        }
        for (name, value) in &record.values {
            let spec = self.field(name).ok_or_else(|| SchemaError::UnknownField {
                key: record.key(),
                field: name.clone(),
            })?;
            if !value.fits(spec.kind) {
                return Err(SchemaError::KindMismatch {
                    key: record.key(),
                    field: name.clone(),
                    expected: spec.kind,
                });
            }
        }
        for spec in self.fields.iter().filter(|f| !f.nullable) {
            if !record.values.contains_key(&spec.name) {
                return Err(SchemaError::MissingValue {
                    key: record.key(),
                    field: spec.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Widen integer values held by float fields, so a record compares equal
    /// to its Parquet round-trip.
    pub fn normalize(&self, record: &mut Record) {
        for spec in self.fields.iter().filter(|f| f.kind == FieldKind::Float) {
            if let Some(value) = record.values.get_mut(&spec.name) {
                if let FieldValue::Int(v) = *value {
                    *value = FieldValue::Float(v as f64);
                }
            }
        }
    }

    /// Check a whole table: same schema, every record conforming.
    pub fn conform(&self, table: &Table) -> Result<(), SchemaError> {
        if &table.schema != self {
            return Err(SchemaError::SchemaMismatch);
        }
        table
            .records
            .iter()
            .try_for_each(|record| self.conform_record(record))
    }
}

/// One row of the external dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity_id: String,
    pub period_key: String,
    /// When this version of the record was announced or produced by the source.
    pub revision: DateTime<Utc>,
    /// Non-null values by field name; an absent name is a null.
    #[serde(default)]
    pub values: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create a record with no field values. The revision is truncated to
    /// millisecond precision, the resolution at which it is persisted.
    pub fn new(
        entity_id: impl Into<String>,
        period_key: impl Into<String>,
        revision: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            period_key: period_key.into(),
            revision: truncate_to_millis(revision),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.values.insert(field.into(), value);
        self
    }

    pub fn key(&self) -> NaturalKey {
        NaturalKey::new(self.entity_id.clone(), self.period_key.clone())
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.values.get(field).and_then(FieldValue::as_f64)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.values.get(field).and_then(FieldValue::as_str)
    }
}

/// Truncate a timestamp to whole milliseconds.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// A schema plus the records that follow it: the in-memory form of
/// partition files and of the final dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub schema: RecordSchema,
    pub records: Vec<Record>,
}

impl Table {
    pub fn new(schema: RecordSchema) -> Self {
        Self {
            schema,
            records: Vec::new(),
        }
    }

    pub fn with_records(schema: RecordSchema, records: Vec<Record>) -> Self {
        Self { schema, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// Distinct entity ids, sorted.
    pub fn entity_ids(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.entity_id.as_str()).collect()
    }

    /// Natural keys in row order (duplicates included).
    pub fn keys(&self) -> Vec<NaturalKey> {
        self.records.iter().map(Record::key).collect()
    }
}
