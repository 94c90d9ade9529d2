//! # Schema Inference
//!
//! Derives a static column schema from a prefix of result documents. The
//! first document is authoritative for types; fields that go missing later,
//! or only show up later, are promoted to their nullable variant. A field
//! whose type changes between documents is a conflict.

use crate::convert::{to_frame_value, ConvertError};
use crate::frame::{Field, FieldType};
use bson::{Bson, Document};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

/// A field that was observed with two incompatible types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeConflict {
    pub name: String,
    pub old: FieldType,
    pub new: FieldType,
}

impl fmt::Display for TypeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} vs {})", self.name, self.old, self.new)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaInferenceError {
    #[error(
        "Field(s) appeared with different types. Please ensure value fields are the same type in each document: {}",
        join_conflicts(.0)
    )]
    Conflicts(Vec<TypeConflict>),
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

fn join_conflicts(conflicts: &[TypeConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Accumulates type observations one document at a time.
///
/// Guesses keep the order in which field names were first seen, so the
/// resulting schema is deterministic for a given document stream.
#[derive(Debug, Default)]
pub struct SchemaInferenceState {
    guesses: Vec<Field>,
    index: HashMap<String, usize>,
    current_row: Vec<(String, FieldType)>,
    ignored: HashSet<String>,
    after_first: bool,
}

impl SchemaInferenceState {
    pub fn new(ignored: HashSet<String>) -> Self {
        Self {
            ignored,
            ..Self::default()
        }
    }

    /// Record the type of one field of the current document. Ignored names
    /// and null/undefined values carry no signal and are skipped.
    pub fn update_field(&mut self, name: &str, value: &Bson) -> Result<(), SchemaInferenceError> {
        if self.ignored.contains(name) {
            return Ok(());
        }
        let (_, guess) = to_frame_value(value)?;
        if guess == FieldType::Unknown {
            return Ok(());
        }
        match self.current_row.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = guess,
            None => self.current_row.push((name.to_string(), guess)),
        }
        Ok(())
    }

    /// Observe every field of `doc`, then reconcile it into the guesses.
    pub fn update_doc(&mut self, doc: &Document) -> Result<(), SchemaInferenceError> {
        for (name, value) in doc {
            self.update_field(name, value)?;
        }
        self.next_doc()
    }

    /// Reconcile the current row into the guesses and start a new row.
    ///
    /// All conflicts of the row are collected before failing.
    pub fn next_doc(&mut self) -> Result<(), SchemaInferenceError> {
        let row = std::mem::take(&mut self.current_row);

        if self.after_first {
            for guess in &mut self.guesses {
                let still_here = row.iter().any(|(n, _)| *n == guess.name);
                if !still_here && !guess.field_type.is_nullable() {
                    tracing::debug!(
                        "Field {} missing after first document, making type nullable",
                        guess.name
                    );
                    guess.field_type = guess.field_type.nullable();
                }
            }
        }

        let mut conflicts = Vec::new();
        for (name, current) in row {
            let known = self.index.get(&name).copied();
            match known {
                _ if !self.after_first => self.insert(name, current),
                None => {
                    tracing::debug!(
                        "Field {} discovered after first document, making type nullable",
                        name
                    );
                    self.insert(name, current.nullable());
                }
                Some(ix) => {
                    let guess = self.guesses[ix].field_type;
                    if guess != current && guess != current.nullable() {
                        conflicts.push(TypeConflict {
                            name,
                            old: guess,
                            new: current,
                        });
                    }
                }
            }
        }

        if !conflicts.is_empty() {
            return Err(SchemaInferenceError::Conflicts(conflicts));
        }
        self.after_first = true;
        Ok(())
    }

    fn insert(&mut self, name: String, field_type: FieldType) {
        match self.index.get(&name) {
            Some(&ix) => self.guesses[ix].field_type = field_type,
            None => {
                self.index.insert(name.clone(), self.guesses.len());
                self.guesses.push(Field::new(name, field_type));
            }
        }
    }

    /// The inferred schema, in first-seen order.
    pub fn finish(self) -> Vec<Field> {
        self.guesses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn infer(docs: &[Document]) -> Result<Vec<Field>, SchemaInferenceError> {
        let mut state = SchemaInferenceState::default();
        for doc in docs {
            state.update_doc(doc)?;
        }
        Ok(state.finish())
    }

    #[test]
    fn test_uniform_stream_is_non_nullable() {
        let docs = [
            doc! { "a": 1_i64, "b": "x", "c": 1.5 },
            doc! { "c": 2.5, "a": 2_i64, "b": "y" },
        ];
        for n in 1..=docs.len() {
            let fields = infer(&docs[..n]).unwrap();
            assert_eq!(
                fields,
                vec![
                    Field::new("a", FieldType::Int64),
                    Field::new("b", FieldType::String),
                    Field::new("c", FieldType::Float64),
                ]
            );
        }
    }

    #[test]
    fn test_missing_later_becomes_nullable() {
        let fields = infer(&[
            doc! { "a": 1_i64, "b": "x" },
            doc! { "a": 2_i64 },
            doc! { "a": 3_i64, "b": "z" },
        ])
        .unwrap();
        assert_eq!(
            fields,
            vec![
                Field::new("a", FieldType::Int64),
                Field::new("b", FieldType::NullableString),
            ]
        );
    }

    #[test]
    fn test_appearing_later_becomes_nullable() {
        let fields = infer(&[doc! { "a": 1_i32 }, doc! { "a": 2_i32, "b": true }]).unwrap();
        assert_eq!(fields[1], Field::new("b", FieldType::NullableBool));
    }

    #[test]
    fn test_null_counts_as_absent() {
        let fields = infer(&[
            doc! { "a": 1_i64, "b": "x" },
            doc! { "a": 2_i64, "b": Bson::Null },
        ])
        .unwrap();
        assert_eq!(fields[1], Field::new("b", FieldType::NullableString));
    }

    #[test]
    fn test_conflicts_are_aggregated() {
        let err = infer(&[
            doc! { "a": 1_i64, "b": "x", "c": true },
            doc! { "a": 2_i64, "b": 5_i64, "c": 1.0 },
        ])
        .unwrap_err();
        assert_eq!(
            err,
            SchemaInferenceError::Conflicts(vec![
                TypeConflict {
                    name: "b".into(),
                    old: FieldType::String,
                    new: FieldType::Int64,
                },
                TypeConflict {
                    name: "c".into(),
                    old: FieldType::Bool,
                    new: FieldType::Float64,
                },
            ])
        );
        assert_eq!(
            err.to_string(),
            "Field(s) appeared with different types. Please ensure value fields are the same type \
             in each document: b (String vs Int64), c (Bool vs Float64)"
        );
    }

    #[test]
    fn test_ignored_fields_are_skipped() {
        let mut state = SchemaInferenceState::new(HashSet::from(["t".to_string()]));
        state.update_doc(&doc! { "t": "now", "v": 1.0 }).unwrap();
        state.update_doc(&doc! { "t": 5_i32, "v": 2.0 }).unwrap();
        assert_eq!(state.finish(), vec![Field::new("v", FieldType::Float64)]);
    }

    #[test]
    fn test_empty_stream_yields_no_fields() {
        assert!(infer(&[]).unwrap().is_empty());
    }
}
