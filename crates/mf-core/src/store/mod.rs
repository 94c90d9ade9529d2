//! # Document Store Abstraction
//!
//! The seam between the query engine and the database driver. The hub
//! provides the MongoDB implementation; [`memory`] provides a scripted
//! in-process store for tests and offline use.

pub mod memory;

use crate::settings::{DataSourceSettings, SettingsError};
use async_trait::async_trait;
use bson::Document;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// A driver-level failure, carried as its message.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectError {
    /// Bad URL, credentials or TLS material; unreachable server.
    #[error("{0}")]
    User(String),
    /// The host handed over settings that could not be read.
    #[error("{0}")]
    Internal(String),
}

impl From<SettingsError> for ConnectError {
    fn from(err: SettingsError) -> Self {
        if err.is_internal() {
            Self::Internal(err.to_string())
        } else {
            Self::User(err.to_string())
        }
    }
}

// =============================================================================
// Core Traits
// =============================================================================

/// Opens a session against the store described by the settings.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        settings: &DataSourceSettings,
    ) -> Result<Box<dyn DocumentStore>, ConnectError>;
}

/// One open session. Callers must [`close`](DocumentStore::close) it on
/// every path.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run an aggregation pipeline, returning a cursor over its results.
    async fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Box<dyn DocumentCursor>, StoreError>;

    /// Release the session. Errors are logged, not returned.
    async fn close(self: Box<Self>);
}

/// Forward-only cursor over result documents.
#[async_trait]
pub trait DocumentCursor: Send {
    /// Move to the next document. `Ok(false)` at the end of the results;
    /// `Err` when the next document could not be fetched.
    async fn advance(&mut self) -> Result<bool, StoreError>;

    /// Decode the document the cursor is positioned on.
    fn current(&self) -> Result<Document, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_errors_split_by_blame() {
        let err: ConnectError = SettingsError::Parse("expected bool".into()).into();
        assert!(matches!(err, ConnectError::Internal(_)));
        let err: ConnectError = SettingsError::CertificatePair.into();
        assert_eq!(
            err,
            ConnectError::User(
                "Must provide both tlsCertificate and tlsCertificateKey, or neither".into()
            )
        );
    }
}
