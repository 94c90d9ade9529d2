//! # Data Frames
//!
//! The columnar result model handed back to the dashboard host. A [`Frame`]
//! is an ordered list of typed [`Column`]s that all share the same length;
//! the column types are fixed when the frame is created and every appended
//! row is checked against them.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Label name to label value, attached to every column of a frame.
pub type Labels = BTreeMap<String, String>;

// =============================================================================
// Field Types
// =============================================================================

/// Cell types accepted by the host, plus `Unknown` for "no type signal".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int32,
    Int64,
    Float64,
    String,
    Bool,
    Time,
    Json,
    NullableInt32,
    NullableInt64,
    NullableFloat64,
    NullableString,
    NullableBool,
    NullableTime,
    NullableJson,
    Unknown,
}

impl FieldType {
    pub fn is_nullable(self) -> bool {
        matches!(
            self,
            Self::NullableInt32
                | Self::NullableInt64
                | Self::NullableFloat64
                | Self::NullableString
                | Self::NullableBool
                | Self::NullableTime
                | Self::NullableJson
        )
    }

    /// The nullable variant of this type. Nullable types and `Unknown` map
    /// to themselves.
    pub fn nullable(self) -> Self {
        match self {
            Self::Int32 => Self::NullableInt32,
            Self::Int64 => Self::NullableInt64,
            Self::Float64 => Self::NullableFloat64,
            Self::String => Self::NullableString,
            Self::Bool => Self::NullableBool,
            Self::Time => Self::NullableTime,
            Self::Json => Self::NullableJson,
            other => other,
        }
    }

    /// The scalar (non-nullable) variant of this type.
    pub fn non_nullable(self) -> Self {
        match self {
            Self::NullableInt32 => Self::Int32,
            Self::NullableInt64 => Self::Int64,
            Self::NullableFloat64 => Self::Float64,
            Self::NullableString => Self::String,
            Self::NullableBool => Self::Bool,
            Self::NullableTime => Self::Time,
            Self::NullableJson => Self::Json,
            other => other,
        }
    }

    /// Short type name as used in query models, e.g. `int64` or `*string`.
    pub fn item_type_string(self) -> &'static str {
        match self {
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Time => "time",
            Self::Json => "json",
            Self::NullableInt32 => "*int32",
            Self::NullableInt64 => "*int64",
            Self::NullableFloat64 => "*float64",
            Self::NullableString => "*string",
            Self::NullableBool => "*bool",
            Self::NullableTime => "*time",
            Self::NullableJson => "*json",
            Self::Unknown => "unknown",
        }
    }

    /// Inverse of [`item_type_string`](Self::item_type_string). Also accepts
    /// the long aliases `time.Time` and `json.RawMessage`.
    pub fn from_item_type_string(s: &str) -> Option<Self> {
        let (nullable, base) = match s.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let scalar = match base {
            "int32" => Self::Int32,
            "int64" => Self::Int64,
            "float64" => Self::Float64,
            "string" => Self::String,
            "bool" => Self::Bool,
            "time" | "time.Time" => Self::Time,
            "json" | "json.RawMessage" => Self::Json,
            _ => return None,
        };
        Some(if nullable { scalar.nullable() } else { scalar })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::Float64 => "Float64",
            Self::String => "String",
            Self::Bool => "Bool",
            Self::Time => "Time",
            Self::Json => "JSON",
            Self::NullableInt32 => "NullableInt32",
            Self::NullableInt64 => "NullableInt64",
            Self::NullableFloat64 => "NullableFloat64",
            Self::NullableString => "NullableString",
            Self::NullableBool => "NullableBool",
            Self::NullableTime => "NullableTime",
            Self::NullableJson => "NullableJSON",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.item_type_string())
    }
}

// =============================================================================
// Cells
// =============================================================================

/// A single non-null frame value. Nulls are represented as `None` in rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bool(bool),
    Time(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Cell {
    /// Scalar type of the cell.
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Int32(_) => FieldType::Int32,
            Self::Int64(_) => FieldType::Int64,
            Self::Float64(_) => FieldType::Float64,
            Self::String(_) => FieldType::String,
            Self::Bool(_) => FieldType::Bool,
            Self::Time(_) => FieldType::Time,
            Self::Json(_) => FieldType::Json,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32(v) => write!(f, "{}", v),
            Self::Int64(v) => write!(f, "{}", v),
            Self::Float64(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Time(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Json(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Int32(v) => serializer.serialize_i32(*v),
            Self::Int64(v) => serializer.serialize_i64(*v),
            Self::Float64(v) => serializer.serialize_f64(*v),
            Self::String(v) => serializer.serialize_str(v),
            Self::Bool(v) => serializer.serialize_bool(*v),
            Self::Time(v) => serializer.serialize_i64(v.timestamp_millis()),
            Self::Json(v) => v.serialize(serializer),
        }
    }
}

// =============================================================================
// Schema Fields, Columns, Frames
// =============================================================================

/// A column declaration: name plus type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Per-column display configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfig {
    #[serde(rename = "displayNameFromDS", skip_serializing_if = "Option::is_none")]
    pub display_name_from_ds: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub labels: Labels,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<FieldConfig>,
    pub values: Vec<Option<Cell>>,
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("Row has {got} values but frame has {expected} fields")]
    Arity { expected: usize, got: usize },
    #[error("Cannot append a {got} value to field {column} of type {expected}")]
    TypeMismatch {
        column: String,
        expected: FieldType,
        got: FieldType,
    },
    #[error("Cannot append null to non-nullable field {column} of type {expected}")]
    NullInNonNullable { column: String, expected: FieldType },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Frame {
    /// Create an empty frame with one column per field, in order.
    pub fn new(name: impl Into<String>, fields: &[Field]) -> Self {
        let columns = fields
            .iter()
            .map(|f| Column {
                name: f.name.clone(),
                field_type: f.field_type,
                labels: Labels::new(),
                config: None,
                values: Vec::new(),
            })
            .collect();
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Append one row. The frame is left untouched when any cell is rejected.
    pub fn append_row(&mut self, row: Vec<Option<Cell>>) -> Result<(), FrameError> {
        if row.len() != self.columns.len() {
            return Err(FrameError::Arity {
                expected: self.columns.len(),
                got: row.len(),
            });
        }
        for (column, cell) in self.columns.iter().zip(&row) {
            match cell {
                None if !column.field_type.is_nullable() => {
                    return Err(FrameError::NullInNonNullable {
                        column: column.name.clone(),
                        expected: column.field_type,
                    });
                }
                None => {}
                Some(cell) => {
                    if cell.field_type() != column.field_type.non_nullable() {
                        return Err(FrameError::TypeMismatch {
                            column: column.name.clone(),
                            expected: column.field_type,
                            got: cell.field_type(),
                        });
                    }
                }
            }
        }
        for (column, cell) in self.columns.iter_mut().zip(row) {
            column.values.push(cell);
        }
        Ok(())
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Frame", 2)?;
        s.serialize_field("name", &self.name)?;
        s.serialize_field("fields", &self.columns)?;
        s.end()
    }
}
