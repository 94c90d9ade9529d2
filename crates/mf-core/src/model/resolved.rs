//! Resolved query models: the per-query extractors that turn one result
//! document into its labels, its labels ID and a typed row.

use super::{ModelError, QueryModel, QueryType};
use crate::convert::{convert_value, to_frame_value, ConvertError};
use crate::datefmt::{parse_timestamp, TimestampParseError};
use crate::frame::{Cell, Field, FieldConfig, FieldType, Frame, FrameError, Labels};
use crate::template::{Template, TemplateError};
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(
        "Field {0} was null or absent, but is not nullable. If using schema inference, please \
         increase the depth to the first document missing this field, or manually specify the schema"
    )]
    NotNullable(String),
    #[error("Failed to convert value for {name}: {source}")]
    Convert { name: String, source: ConvertError },
    #[error("Type mismatch for field {name}: expected {expected}, got {got}")]
    TypeMismatch {
        name: String,
        expected: FieldType,
        got: FieldType,
    },
    #[error("All documents must have the Timestamp Field present")]
    MissingTimestamp,
    #[error("Timestamps must be bson DateTimes")]
    TimestampNotDate,
    #[error("Timestamps must be strings when Timestamp Format is supplied")]
    TimestampNotString,
    #[error(transparent)]
    TimestampParse(#[from] TimestampParseError),
    #[error("Failed to render legend: {0}")]
    Legend(#[from] TemplateError),
    #[error("Failed to extract value columns: {0}")]
    Frame(#[from] FrameError),
    /// A panic caught while handling the document.
    #[error("{0}")]
    Panic(String),
}

/// Labels, labels ID and row extracted from one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub labels: Labels,
    pub labels_id: String,
    pub row: Vec<Option<Cell>>,
}

#[derive(Debug, Clone)]
pub struct TableModel {
    fields: Vec<Field>,
}

#[derive(Debug, Clone)]
pub struct TimeseriesModel {
    timestamp_field: String,
    timestamp_format: String,
    label_fields: Vec<String>,
    legend: Option<Template>,
    fields: Vec<Field>,
}

/// A query model bound to its value schema.
#[derive(Debug, Clone)]
pub enum ResolvedQueryModel {
    Table(TableModel),
    Timeseries(TimeseriesModel),
}

impl QueryModel {
    /// Bind the model to a value schema. Parses the legend template for
    /// timeseries queries.
    pub fn resolve(&self, fields: Vec<Field>) -> Result<ResolvedQueryModel, ModelError> {
        match self.query_type.parse::<QueryType>()? {
            QueryType::Table => Ok(ResolvedQueryModel::Table(TableModel { fields })),
            QueryType::Timeseries => {
                let legend = if self.legend_format.is_empty() {
                    None
                } else {
                    Some(Template::parse("legend", &self.legend_format)?)
                };
                Ok(ResolvedQueryModel::Timeseries(TimeseriesModel {
                    timestamp_field: self.timestamp_field.clone(),
                    timestamp_format: self.timestamp_format.clone(),
                    label_fields: self.label_fields.clone(),
                    legend,
                    fields,
                }))
            }
        }
    }
}

impl ResolvedQueryModel {
    /// Value columns, without the timestamp column of a timeseries model.
    pub fn fields(&self) -> &[Field] {
        match self {
            Self::Table(m) => &m.fields,
            Self::Timeseries(m) => &m.fields,
        }
    }

    /// An empty frame for the label tuple identified by `id`.
    pub fn make_frame(&self, id: &str, labels: &Labels) -> Result<Frame, DocumentError> {
        match self {
            Self::Table(m) => Ok(Frame::new(id, &m.fields)),
            Self::Timeseries(m) => m.make_frame(id, labels),
        }
    }

    /// Labels and labels ID of a document. Table models have none.
    pub fn labels(&self, doc: &Document) -> (Labels, String) {
        match self {
            Self::Table(_) => (Labels::new(), String::new()),
            Self::Timeseries(m) => m.labels(doc),
        }
    }

    /// The typed row for a document, in frame column order.
    pub fn values(&self, doc: &Document) -> Result<Vec<Option<Cell>>, DocumentError> {
        match self {
            Self::Table(m) => extract_fields(&m.fields, doc),
            Self::Timeseries(m) => m.values(doc),
        }
    }

    pub fn extract(&self, doc: &Document) -> Result<Extracted, DocumentError> {
        let (labels, labels_id) = self.labels(doc);
        let row = self.values(doc)?;
        Ok(Extracted {
            labels,
            labels_id,
            row,
        })
    }
}

fn extract_fields(fields: &[Field], doc: &Document) -> Result<Vec<Option<Cell>>, DocumentError> {
    fields
        .iter()
        .map(|field| {
            let nullable = field.field_type.is_nullable();
            let value = match doc.get(&field.name) {
                None | Some(Bson::Null) if nullable => return Ok(None),
                None | Some(Bson::Null) => {
                    return Err(DocumentError::NotNullable(field.name.clone()));
                }
                Some(value) => value,
            };
            let (cell, actual) =
                convert_value(Some(value), nullable).map_err(|source| DocumentError::Convert {
                    name: field.name.clone(),
                    source,
                })?;
            if cell.is_some() && actual != field.field_type {
                return Err(DocumentError::TypeMismatch {
                    name: field.name.clone(),
                    expected: field.field_type,
                    got: actual,
                });
            }
            if cell.is_none() && !nullable {
                return Err(DocumentError::NotNullable(field.name.clone()));
            }
            Ok(cell)
        })
        .collect()
}

/// Label values as shown to the user: strings verbatim, scalars in their
/// natural text form, documents and arrays as JSON.
pub fn format_label_value(value: &Bson) -> String {
    match to_frame_value(value) {
        Ok((Some(cell), _)) => cell.to_string(),
        Ok((None, _)) => "null".to_string(),
        Err(_) => value.clone().into_relaxed_extjson().to_string(),
    }
}

impl TimeseriesModel {
    fn make_frame(&self, id: &str, labels: &Labels) -> Result<Frame, DocumentError> {
        let fields: Vec<Field> = std::iter::once(Field::new(&self.timestamp_field, FieldType::Time))
            .chain(self.fields.iter().cloned())
            .collect();
        let mut frame = Frame::new(id, &fields);
        for column in &mut frame.columns {
            column.labels = labels.clone();
            let Some(legend) = &self.legend else {
                continue;
            };
            let display_name = legend.render_legend(&column.name, labels)?;
            if !display_name.is_empty() {
                column.config = Some(FieldConfig {
                    display_name_from_ds: Some(display_name),
                });
            }
        }
        Ok(frame)
    }

    fn labels(&self, doc: &Document) -> (Labels, String) {
        let mut labels = Labels::new();
        let mut parts = Vec::with_capacity(self.label_fields.len());
        for key in &self.label_fields {
            let Some(value) = doc.get(key) else {
                continue;
            };
            let formatted = format_label_value(value);
            parts.push(format!("{}={}", key, formatted));
            labels.insert(key.clone(), formatted);
        }
        (labels, parts.join(","))
    }

    fn timestamp(&self, value: &Bson) -> Result<DateTime<Utc>, DocumentError> {
        if self.timestamp_format.is_empty() {
            let Bson::DateTime(dt) = value else {
                return Err(DocumentError::TimestampNotDate);
            };
            let millis = dt.timestamp_millis();
            return DateTime::<Utc>::from_timestamp_millis(millis).ok_or(
                DocumentError::Convert {
                    name: self.timestamp_field.clone(),
                    source: ConvertError::DateTimeOutOfRange(millis),
                },
            );
        }
        let Bson::String(text) = value else {
            return Err(DocumentError::TimestampNotString);
        };
        Ok(parse_timestamp(&self.timestamp_format, text)?)
    }

    fn values(&self, doc: &Document) -> Result<Vec<Option<Cell>>, DocumentError> {
        let timestamp = doc
            .get(&self.timestamp_field)
            .ok_or(DocumentError::MissingTimestamp)?;
        let mut row = Vec::with_capacity(1 + self.fields.len());
        row.push(Some(Cell::Time(self.timestamp(timestamp)?)));
        row.extend(extract_fields(&self.fields, doc)?);
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};
    use serde_json::json;

    fn resolve(model: serde_json::Value, fields: Vec<Field>) -> ResolvedQueryModel {
        serde_json::from_value::<QueryModel>(model)
            .unwrap()
            .resolve(fields)
            .unwrap()
    }

    fn ts_model(extra: serde_json::Value) -> ResolvedQueryModel {
        let mut base = json!({"queryType": "Timeseries", "timestampField": "t"});
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        resolve(base, vec![Field::new("v", FieldType::Float64)])
    }

    fn t(secs: i64) -> bson::DateTime {
        bson::DateTime::from_millis(secs * 1000)
    }

    #[test]
    fn test_table_extracts_declared_columns() {
        let model = resolve(
            json!({}),
            vec![
                Field::new("a", FieldType::Int64),
                Field::new("b", FieldType::NullableString),
            ],
        );
        let out = model.extract(&doc! { "a": 1_i64, "b": "x", "c": true }).unwrap();
        assert_eq!(out.labels_id, "");
        assert!(out.labels.is_empty());
        assert_eq!(out.row, vec![Some(Cell::Int64(1)), Some(Cell::String("x".into()))]);

        assert_eq!(
            model.values(&doc! { "a": 2_i64 }).unwrap(),
            vec![Some(Cell::Int64(2)), None]
        );
    }

    #[test]
    fn test_table_rejects_missing_and_mismatched() {
        let model = resolve(json!({}), vec![Field::new("a", FieldType::Int64)]);
        let err = model.values(&doc! { "b": 1 }).unwrap_err();
        assert!(matches!(err, DocumentError::NotNullable(ref n) if n == "a"));
        assert!(err.to_string().starts_with("Field a was null or absent, but is not nullable."));

        let err = model.values(&doc! { "a": "one" }).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Type mismatch for field a: expected Int64, got String"
        );
    }

    #[test]
    fn test_timeseries_labels_id() {
        let model = ts_model(json!({"labelFields": ["host", "dc", "n"]}));
        let (labels, id) = model.labels(&doc! { "host": "a", "n": 3, "t": t(1) });
        assert_eq!(id, "host=a,n=3");
        assert_eq!(labels.get("host").map(String::as_str), Some("a"));
        assert!(!labels.contains_key("dc"));

        let (_, id) = model.labels(&doc! { "dc": "eu", "t": t(1) });
        assert_eq!(id, "dc=eu");

        let oid = ObjectId::from_bytes([1; 12]);
        let (_, id) = model.labels(&doc! { "host": oid, "dc": { "x": 1 } });
        assert_eq!(id, r#"host=010101010101010101010101,dc={"x":1}"#);
    }

    #[test]
    fn test_timeseries_frame_layout() {
        let model = ts_model(json!({"legendFormat": "{{.Value}}@{{.Labels.k}}"}));
        let labels = Labels::from([("k".to_string(), "A".to_string())]);
        let frame = model.make_frame("k=A", &labels).unwrap();
        assert_eq!(frame.name, "k=A");
        assert_eq!(frame.columns[0].name, "t");
        assert_eq!(frame.columns[0].field_type, FieldType::Time);
        assert_eq!(frame.columns[1].labels, labels);
        assert_eq!(
            frame.columns[1].config,
            Some(FieldConfig {
                display_name_from_ds: Some("v@A".into())
            })
        );
    }

    #[test]
    fn test_timeseries_no_legend_no_config() {
        let frame = ts_model(json!({})).make_frame("", &Labels::new()).unwrap();
        assert!(frame.columns.iter().all(|c| c.config.is_none()));
    }

    #[test]
    fn test_timeseries_timestamps() {
        let model = ts_model(json!({}));
        let row = model.values(&doc! { "t": t(10), "v": 1.5 }).unwrap();
        assert_eq!(
            row,
            vec![
                Some(Cell::Time(DateTime::from_timestamp(10, 0).unwrap())),
                Some(Cell::Float64(1.5))
            ]
        );
        assert!(matches!(
            model.values(&doc! { "v": 1.5 }),
            Err(DocumentError::MissingTimestamp)
        ));
        assert!(matches!(
            model.values(&doc! { "t": "yesterday", "v": 1.5 }),
            Err(DocumentError::TimestampNotDate)
        ));

        let model = ts_model(json!({"timestampFormat": "2006-01-02 15:04:05"}));
        let row = model.values(&doc! { "t": "2023-11-14 22:13:20", "v": 1.5 }).unwrap();
        assert_eq!(
            row[0],
            Some(Cell::Time(DateTime::from_timestamp(1_700_000_000, 0).unwrap()))
        );
        assert!(matches!(
            model.values(&doc! { "t": t(1), "v": 1.5 }),
            Err(DocumentError::TimestampNotString)
        ));
        assert!(matches!(
            model.values(&doc! { "t": "garbage", "v": 1.5 }),
            Err(DocumentError::TimestampParse(_))
        ));
    }

    #[test]
    fn test_bad_legend_fails_resolution() {
        let model: QueryModel = serde_json::from_value(json!({
            "queryType": "Timeseries",
            "timestampField": "t",
            "legendFormat": "{{ nosuch }}",
        }))
        .unwrap();
        assert!(matches!(model.resolve(vec![]), Err(ModelError::Legend(_))));
    }
}
