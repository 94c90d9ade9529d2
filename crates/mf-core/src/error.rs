//! Query-level errors. The `Display` text of a [`QueryError`] is what the
//! host shows as the failing query's error.

use crate::model::{DocumentError, ModelError};
use crate::schema::SchemaInferenceError;
use crate::store::{ConnectError, StoreError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid query JSON: {0}")]
    InvalidQueryJson(#[source] serde_json::Error),
    #[error("{0}")]
    InvalidQuery(#[source] ModelError),
    #[error("Failed to produce final pipeline: {0}")]
    Pipeline(#[source] ModelError),
    #[error("Internal failure while {context}: {message}")]
    Internal {
        context: &'static str,
        message: String,
    },
    #[error("Failed to connect to mongo: {0}")]
    Connect(String),
    #[error("Failed to send query to mongo: {0}")]
    Aggregate(#[source] StoreError),
    #[error("Schema Inference Failed: {0}")]
    SchemaInference(#[from] SchemaInferenceError),
    /// A cursor failure while sampling documents for inference.
    #[error("Schema Inference Failed: {0}")]
    InferenceCursor(Box<QueryError>),
    #[error("{0}")]
    Resolve(#[source] ModelError),
    #[error("Failed to convert document number {index}: {source}, {document}")]
    Document {
        index: usize,
        /// The offending document as relaxed extended JSON.
        document: String,
        source: DocumentError,
    },
    #[error("Failed to decode document number {index}: {source}")]
    Decode { index: usize, source: StoreError },
    #[error("Failed to fetch result document number {index}: {source}")]
    Fetch { index: usize, source: StoreError },
    #[error("Query cancelled")]
    Cancelled,
    #[error("Query timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<ConnectError> for QueryError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::User(message) => Self::Connect(message),
            ConnectError::Internal(message) => Self::Internal {
                context: "connecting to mongo",
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_errors_keep_their_prefix() {
        let err: QueryError = ConnectError::Internal("bad secrets".into()).into();
        assert_eq!(
            err.to_string(),
            "Internal failure while connecting to mongo: bad secrets"
        );
        let err: QueryError = ConnectError::User("no route".into()).into();
        assert_eq!(err.to_string(), "Failed to connect to mongo: no route");
    }

    #[test]
    fn test_inference_cursor_errors_are_wrapped() {
        let err = QueryError::InferenceCursor(Box::new(QueryError::Fetch {
            index: 2,
            source: StoreError::new("connection reset"),
        }));
        assert_eq!(
            err.to_string(),
            "Schema Inference Failed: Failed to fetch result document number 2: connection reset"
        );
    }
}
