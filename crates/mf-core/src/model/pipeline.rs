//! Pipeline compilation: the user's aggregation stages wrapped with the
//! automatic time bound and sort stages.

use super::{ModelError, QueryModel};
use crate::datefmt::layout_to_mongo;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};

fn bson_date(t: &DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(t.timestamp_millis())
}

/// Parse a relaxed extended-JSON array of stages.
pub fn parse_aggregation(text: &str) -> Result<Vec<Document>, ModelError> {
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ModelError::Aggregation(e.to_string()))?;
    let value = Bson::try_from(json).map_err(|e| ModelError::Aggregation(e.to_string()))?;
    let Bson::Array(stages) = value else {
        return Err(ModelError::Aggregation(format!(
            "expected an array of stages, got {:?}",
            value.element_type()
        )));
    };
    stages
        .into_iter()
        .enumerate()
        .map(|(ix, stage)| match stage {
            Bson::Document(stage) => Ok(stage),
            other => Err(ModelError::Aggregation(format!(
                "stage {} is not a document: {}",
                ix, other
            ))),
        })
        .collect()
}

impl QueryModel {
    /// The `$match` stage restricting documents to `[from, to]`.
    ///
    /// String timestamps are compared through `$dateFromString`, which
    /// requires the layout to translate to MongoDB specifiers.
    pub fn time_bound_stage(
        &self,
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> Result<Document, ModelError> {
        let (from, to) = (bson_date(from), bson_date(to));

        let filter = if self.timestamp_format.is_empty() {
            let mut filter = Document::new();
            filter.insert(&self.timestamp_field, doc! { "$gte": from, "$lte": to });
            filter
        } else {
            let format = layout_to_mongo(&self.timestamp_format)?;
            let parsed = doc! {
                "$dateFromString": {
                    "dateString": format!("${}", self.timestamp_field),
                    "format": format,
                }
            };
            doc! {
                "$expr": {
                    "$and": [
                        { "$gte": [parsed.clone(), from] },
                        { "$lte": [parsed, to] },
                    ]
                }
            }
        };
        Ok(doc! { "$match": filter })
    }

    /// The full pipeline sent to the database.
    pub fn pipeline(
        &self,
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> Result<Vec<Document>, ModelError> {
        let timeseries = self.is_timeseries();
        let bound = timeseries && self.auto_time_bound;
        let mut pipeline = Vec::new();

        if bound && self.auto_time_bound_at_start {
            pipeline.push(self.time_bound_stage(from, to)?);
        }
        pipeline.extend(parse_aggregation(&self.aggregation)?);
        if bound && !self.auto_time_bound_at_start {
            pipeline.push(self.time_bound_stage(from, to)?);
        }
        if timeseries && self.auto_time_sort {
            let mut sort = Document::new();
            sort.insert(&self.timestamp_field, 1_i32);
            pipeline.push(doc! { "$sort": sort });
        }
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn timeseries(extra: serde_json::Value) -> QueryModel {
        let mut base = json!({
            "queryType": "Timeseries",
            "timestampField": "t",
            "aggregation": r#"[{"$project": {"t": 1, "v": 1}}]"#,
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        serde_json::from_value(base).unwrap()
    }

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            DateTime::from_timestamp(1_700_003_600, 0).unwrap(),
        )
    }

    #[test]
    fn test_parse_aggregation_extended_json() {
        let stages = parse_aggregation(
            r#"[{"$match": {"_id": {"$oid": "43784242644d5332374b5730"}, "n": {"$numberLong": "5"}}}]"#,
        )
        .unwrap();
        assert_eq!(stages.len(), 1);
        let filter = stages[0].get_document("$match").unwrap();
        assert!(matches!(filter.get("_id"), Some(Bson::ObjectId(_))));
        assert_eq!(filter.get("n"), Some(&Bson::Int64(5)));
    }

    #[test]
    fn test_parse_aggregation_rejects_garbage() {
        assert!(matches!(parse_aggregation(""), Err(ModelError::Aggregation(_))));
        assert!(matches!(parse_aggregation("{}"), Err(ModelError::Aggregation(_))));
        assert!(matches!(parse_aggregation("[1]"), Err(ModelError::Aggregation(_))));
        assert_eq!(parse_aggregation("[]").unwrap(), Vec::<Document>::new());
    }

    #[test]
    fn test_stage_order() {
        let (from, to) = range();
        let m = timeseries(json!({"autoTimeBound": true, "autoTimeSort": true}));
        let p = m.pipeline(&from, &to).unwrap();
        let keys: Vec<&str> = p.iter().map(|s| s.keys().next().unwrap().as_str()).collect();
        assert_eq!(keys, vec!["$project", "$match", "$sort"]);
        assert_eq!(p[2], doc! { "$sort": { "t": 1 } });

        let m = timeseries(json!({"autoTimeBound": true, "autoTimeBoundAtStart": true}));
        let p = m.pipeline(&from, &to).unwrap();
        let keys: Vec<&str> = p.iter().map(|s| s.keys().next().unwrap().as_str()).collect();
        assert_eq!(keys, vec!["$match", "$project"]);
    }

    #[test]
    fn test_table_ignores_time_options() {
        let (from, to) = range();
        let mut m = timeseries(json!({"autoTimeBound": true, "autoTimeSort": true}));
        m.query_type = "Table".into();
        assert_eq!(m.pipeline(&from, &to).unwrap().len(), 1);
    }

    #[test]
    fn test_native_date_match() {
        let (from, to) = range();
        let stage = timeseries(json!({})).time_bound_stage(&from, &to).unwrap();
        assert_eq!(
            stage,
            doc! { "$match": { "t": {
                "$gte": bson::DateTime::from_millis(1_700_000_000_000),
                "$lte": bson::DateTime::from_millis(1_700_003_600_000),
            } } }
        );
    }

    #[test]
    fn test_string_date_match_uses_date_from_string() {
        let (from, to) = range();
        let m = timeseries(json!({"timestampFormat": "Jan _2 15:04:05 2006"}));
        let stage = m.time_bound_stage(&from, &to).unwrap();
        let parsed = doc! { "$dateFromString": { "dateString": "$t", "format": "%b %d %H:%M:%S %Y" } };
        assert_eq!(
            stage,
            doc! { "$match": { "$expr": { "$and": [
                { "$gte": [parsed.clone(), bson::DateTime::from_millis(1_700_000_000_000)] },
                { "$lte": [parsed, bson::DateTime::from_millis(1_700_003_600_000)] },
            ] } } }
        );
    }

    #[test]
    fn test_unsupported_format_fails_pipeline() {
        let (from, to) = range();
        let m = timeseries(json!({"timestampFormat": "Mon Jan 2 2006", "autoTimeBound": true}));
        let err = m.pipeline(&from, &to).unwrap_err();
        assert_eq!(
            err.to_string(),
            "MongoDB does not have an equivalent for the following date specifiers: Mon, 2"
        );
    }
}
