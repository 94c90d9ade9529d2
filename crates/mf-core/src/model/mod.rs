//! # Query Model
//!
//! The declarative description of one query as sent by the dashboard host.
//! A model compiles into an aggregation pipeline ([`pipeline`]) and, once
//! the value schema is known, into a [`ResolvedQueryModel`] that extracts
//! labels and rows from result documents ([`resolved`]).

pub mod pipeline;
pub mod resolved;

pub use resolved::{DocumentError, Extracted, ResolvedQueryModel};

use crate::datefmt::DateFormatError;
use crate::frame::{Field, FieldType};
use crate::template::TemplateError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Table,
    Timeseries,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table => write!(f, "Table"),
            Self::Timeseries => write!(f, "Timeseries"),
        }
    }
}

impl FromStr for QueryType {
    type Err = ModelError;

    /// The empty string selects the default, [`QueryType::Table`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Table" => Ok(Self::Table),
            "Timeseries" => Ok(Self::Timeseries),
            other => Err(ModelError::UnknownQueryType(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("Query type must be one of: Table, Timeseries (got {0:?})")]
    UnknownQueryType(String),
    #[error("Timestamp Field is required for Timeseries queries")]
    MissingTimestampField,
    #[error("Schema Inference Depth must be at least 1 (got {0})")]
    InvalidInferenceDepth(i64),
    #[error("Value Fields and Value Field Types must be the same length ({fields} vs {types})")]
    FieldArity { fields: usize, types: usize },
    #[error("Invalid Type: {0}")]
    InvalidType(String),
    #[error("Failed to parse aggregation pipeline: {0}")]
    Aggregation(String),
    #[error(transparent)]
    DateFormat(#[from] DateFormatError),
    #[error("Failed to parse legend format: {0}")]
    Legend(#[from] TemplateError),
}

/// One query, as deserialized from the host request.
///
/// Every field is optional on the wire; `null` is read as the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryModel {
    #[serde(deserialize_with = "null_as_default")]
    pub database: String,
    #[serde(deserialize_with = "null_as_default")]
    pub collection: String,
    #[serde(deserialize_with = "null_as_default")]
    pub query_type: String,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp_field: String,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp_format: String,
    #[serde(deserialize_with = "null_as_default")]
    pub label_fields: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub legend_format: String,
    #[serde(deserialize_with = "null_as_default")]
    pub value_fields: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub value_field_types: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub auto_time_bound: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub auto_time_bound_at_start: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub auto_time_sort: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub aggregation: String,
    #[serde(deserialize_with = "null_as_default")]
    pub schema_inference: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub schema_inference_depth: i64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl QueryModel {
    /// Check the model's invariants and return its query type.
    pub fn validate(&self) -> Result<QueryType, ModelError> {
        let query_type: QueryType = self.query_type.parse()?;
        if query_type == QueryType::Timeseries && self.timestamp_field.is_empty() {
            return Err(ModelError::MissingTimestampField);
        }
        if self.schema_inference && self.schema_inference_depth < 1 {
            return Err(ModelError::InvalidInferenceDepth(self.schema_inference_depth));
        }
        Ok(query_type)
    }

    pub fn is_timeseries(&self) -> bool {
        self.query_type == "Timeseries"
    }

    /// The declared value schema, used when schema inference is off.
    pub fn fields(&self) -> Result<Vec<Field>, ModelError> {
        if self.value_fields.len() != self.value_field_types.len() {
            return Err(ModelError::FieldArity {
                fields: self.value_fields.len(),
                types: self.value_field_types.len(),
            });
        }
        self.value_fields
            .iter()
            .zip(&self.value_field_types)
            .map(|(name, type_name)| {
                FieldType::from_item_type_string(type_name)
                    .map(|t| Field::new(name.clone(), t))
                    .ok_or_else(|| ModelError::InvalidType(type_name.clone()))
            })
            .collect()
    }

    /// Names schema inference must not type: the timestamp and label
    /// fields of a timeseries query.
    pub fn inference_ignored(&self) -> HashSet<String> {
        if !self.is_timeseries() {
            return HashSet::new();
        }
        std::iter::once(&self.timestamp_field)
            .chain(&self.label_fields)
            .cloned()
            .collect()
    }

    /// Number of documents to sample for inference.
    pub fn inference_depth(&self) -> usize {
        usize::try_from(self.schema_inference_depth).unwrap_or(0)
    }
}
