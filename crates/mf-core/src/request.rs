//! # Host Request / Response Envelope
//!
//! The query request as delivered by the dashboard host and the per-refId
//! response map returned to it.

use crate::error::QueryError;
use crate::frame::Frame;
use crate::settings::{DataSourceSettings, SettingsError};
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDataRequest {
    #[serde(default)]
    pub plugin_context: Option<PluginContext>,
    #[serde(default)]
    pub queries: Vec<DataQuery>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    #[serde(default)]
    pub data_source_instance_settings: Option<DataSourceInstanceSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceInstanceSettings {
    #[serde(default, alias = "jsonData")]
    pub json_data: serde_json::Value,
    #[serde(default, alias = "decryptedSecureJSONData")]
    pub decrypted_secure_json_data: HashMap<String, String>,
}

impl DataSourceInstanceSettings {
    pub fn settings(&self) -> Result<DataSourceSettings, SettingsError> {
        DataSourceSettings::from_raw(&self.json_data, &self.decrypted_secure_json_data)
    }
}

impl QueryDataRequest {
    /// Settings carried by the request, if any.
    pub fn settings(&self) -> Option<Result<DataSourceSettings, SettingsError>> {
        self.plugin_context
            .as_ref()
            .and_then(|ctx| ctx.data_source_instance_settings.as_ref())
            .map(DataSourceInstanceSettings::settings)
    }
}

/// One query. Everything besides `refId` and `timeRange` is the query
/// model, kept as raw JSON until the executor parses it.
#[derive(Debug, Clone, Deserialize)]
pub struct DataQuery {
    #[serde(rename = "refId", alias = "refID")]
    pub ref_id: String,
    #[serde(rename = "timeRange", default)]
    pub time_range: TimeRange,
    #[serde(flatten)]
    pub model: serde_json::Map<String, serde_json::Value>,
}

impl DataQuery {
    pub fn model_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.model.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimeRange {
    #[serde(deserialize_with = "deserialize_instant")]
    pub from: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_instant")]
    pub to: DateTime<Utc>,
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            from: DateTime::UNIX_EPOCH,
            to: DateTime::UNIX_EPOCH,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Instant {
    Millis(i64),
    Text(String),
}

/// RFC 3339 text, epoch milliseconds, or epoch milliseconds as text.
fn deserialize_instant<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    use serde::de::Error;

    let millis = match Instant::deserialize(d)? {
        Instant::Millis(ms) => ms,
        Instant::Text(text) => {
            if let Ok(t) = DateTime::parse_from_rfc3339(&text) {
                return Ok(t.with_timezone(&Utc));
            }
            text.parse::<i64>()
                .map_err(|_| D::Error::custom(format!("invalid time {:?}", text)))?
        }
    };
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| D::Error::custom(format!("time {} out of range", millis)))
}

// =============================================================================
// Response
// =============================================================================

#[derive(Debug)]
pub struct DataResponse {
    pub result: Result<Vec<Frame>, QueryError>,
}

impl DataResponse {
    pub fn frames(frames: Vec<Frame>) -> Self {
        Self { result: Ok(frames) }
    }

    pub fn error(err: QueryError) -> Self {
        Self { result: Err(err) }
    }
}

impl Serialize for DataResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match &self.result {
            Ok(frames) => map.serialize_entry("frames", frames)?,
            Err(err) => map.serialize_entry("error", &err.to_string())?,
        }
        map.end()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct QueryDataResponse {
    pub results: BTreeMap<String, DataResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope() {
        let req: QueryDataRequest = serde_json::from_value(json!({
            "pluginContext": {
                "dataSourceInstanceSettings": {
                    "jsonData": {"url": "mongodb://h:27017"},
                    "decryptedSecureJsonData": {"username": "u", "password": "p"}
                }
            },
            "queries": [{
                "refId": "A",
                "timeRange": {"from": "2023-11-14T22:13:20Z", "to": 1700003600000_i64},
                "database": "db",
                "collection": "c",
                "aggregation": "[]"
            }]
        }))
        .unwrap();

        let settings = req.settings().unwrap().unwrap();
        assert_eq!(settings.json_data.url, "mongodb://h:27017");
        assert_eq!(settings.secure_json_data.password, "p");

        let q = &req.queries[0];
        assert_eq!(q.ref_id, "A");
        assert_eq!(q.time_range.from.timestamp(), 1_700_000_000);
        assert_eq!(q.time_range.to.timestamp(), 1_700_003_600);
        assert_eq!(q.model_json()["collection"], "c");
        assert!(q.model_json().get("refId").is_none());
    }

    #[test]
    fn test_no_plugin_context() {
        let req: QueryDataRequest =
            serde_json::from_value(json!({"queries": [{"refID": "B", "timeRange": {"from": "0", "to": "1000"}}]}))
                .unwrap();
        assert!(req.settings().is_none());
        assert_eq!(req.queries[0].ref_id, "B");
        assert_eq!(req.queries[0].time_range.to.timestamp(), 1);
    }

    #[test]
    fn test_response_shape() {
        let mut resp = QueryDataResponse::default();
        resp.results.insert("A".into(), DataResponse::frames(vec![]));
        resp.results
            .insert("B".into(), DataResponse::error(QueryError::Cancelled));
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"results": {"A": {"frames": []}, "B": {"error": "Query cancelled"}}})
        );
    }
}
