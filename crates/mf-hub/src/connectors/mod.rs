//! # Store Connectors
//!
//! The connector the hub queries through. MongoDB support sits behind the
//! `mongodb` feature (on by default); without it every query reports that
//! the driver is missing.

#[cfg(feature = "mongodb")]
pub mod mongo;

use async_trait::async_trait;
use mf_core::settings::DataSourceSettings;
use mf_core::store::{ConnectError, Connector, DocumentStore};
use std::sync::Arc;

/// The connector for this build, with a short name for health output.
pub fn default_connector() -> (Arc<dyn Connector>, &'static str) {
    #[cfg(feature = "mongodb")]
    {
        (Arc::new(mongo::MongoConnector), "mongodb")
    }
    #[cfg(not(feature = "mongodb"))]
    {
        (Arc::new(Unavailable), "unavailable")
    }
}

/// Stands in when the driver is not compiled in.
#[cfg_attr(feature = "mongodb", allow(dead_code))]
pub struct Unavailable;

#[async_trait]
impl Connector for Unavailable {
    async fn connect(
        &self,
        _settings: &DataSourceSettings,
    ) -> Result<Box<dyn DocumentStore>, ConnectError> {
        Err(ConnectError::Internal(
            "MongoDB support not compiled. Rebuild with --features mongodb".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_connector() {
        let err = Unavailable
            .connect(&DataSourceSettings::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Internal(ref m) if m.contains("--features mongodb")));
    }
}
