//! # MongoDB Connector (requires `--features mongodb`)
//!
//! Opens one client per query from the datasource settings. PEM material
//! from the settings is written to temporary files for the driver, which
//! only accepts TLS material by path; the files live as long as the store.

use async_trait::async_trait;
use mf_core::settings::{DataSourceSettings, TlsMaterial};
use mf_core::store::{ConnectError, Connector, DocumentCursor, DocumentStore, StoreError};
use mongodb::bson::Document;
use mongodb::options::{ClientOptions, Tls, TlsOptions};
use mongodb::{Client, Cursor};
use std::io::Write;
use tempfile::NamedTempFile;

pub struct MongoConnector;

#[async_trait]
impl Connector for MongoConnector {
    async fn connect(
        &self,
        settings: &DataSourceSettings,
    ) -> Result<Box<dyn DocumentStore>, ConnectError> {
        let uri = settings.connection_uri()?;
        let tls = settings.tls_material()?;

        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| ConnectError::User(e.to_string()))?;
        options.app_name = Some("mongoframe".into());

        let mut pem_files = Vec::new();
        if let Some(tls) = tls {
            options.tls = Some(Tls::Enabled(tls_options(&tls, &mut pem_files)?));
        }

        let client =
            Client::with_options(options).map_err(|e| ConnectError::User(e.to_string()))?;
        Ok(Box::new(MongoStore {
            client,
            _pem_files: pem_files,
        }))
    }
}

fn tls_options(
    tls: &TlsMaterial,
    pem_files: &mut Vec<NamedTempFile>,
) -> Result<TlsOptions, ConnectError> {
    if let Some(server_name) = &tls.server_name {
        tracing::warn!(
            "tlsServerName {:?} is not supported by the MongoDB driver; the host from the URL is used",
            server_name
        );
    }

    let ca_file_path = match &tls.ca_pem {
        Some(ca) => Some(write_pem(ca, pem_files)?),
        None => None,
    };
    // The driver expects the client certificate and its key in one file.
    let cert_key_file_path = match &tls.client_pem {
        Some((cert, key)) => Some(write_pem(&format!("{}\n{}", cert, key), pem_files)?),
        None => None,
    };

    Ok(TlsOptions::builder()
        .allow_invalid_certificates(Some(tls.insecure))
        .ca_file_path(ca_file_path)
        .cert_key_file_path(cert_key_file_path)
        .build())
}

fn write_pem(
    pem: &str,
    pem_files: &mut Vec<NamedTempFile>,
) -> Result<std::path::PathBuf, ConnectError> {
    let internal =
        |e: std::io::Error| ConnectError::Internal(format!("writing TLS material: {}", e));
    let mut file = NamedTempFile::new().map_err(internal)?;
    file.write_all(pem.as_bytes()).map_err(internal)?;
    file.flush().map_err(internal)?;
    let path = file.path().to_path_buf();
    pem_files.push(file);
    Ok(path)
}

struct MongoStore {
    client: Client,
    _pem_files: Vec<NamedTempFile>,
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Box<dyn DocumentCursor>, StoreError> {
        let cursor = self
            .client
            .database(database)
            .collection::<Document>(collection)
            .aggregate(pipeline, None)
            .await
            .map_err(|e| StoreError::new(e.to_string()))?;
        Ok(Box::new(MongoCursor { cursor }))
    }

    async fn close(self: Box<Self>) {
        let MongoStore { client, _pem_files } = *self;
        client.shutdown().await;
        tracing::debug!("Disconnected from MongoDB");
    }
}

struct MongoCursor {
    cursor: Cursor<Document>,
}

#[async_trait]
impl DocumentCursor for MongoCursor {
    async fn advance(&mut self) -> Result<bool, StoreError> {
        self.cursor
            .advance()
            .await
            .map_err(|e| StoreError::new(e.to_string()))
    }

    fn current(&self) -> Result<Document, StoreError> {
        self.cursor
            .deserialize_current()
            .map_err(|e| StoreError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_tls_material_is_written_to_files() {
        let tls = TlsMaterial {
            ca_pem: Some(CA.into()),
            client_pem: Some(("CERT".into(), "KEY".into())),
            insecure: true,
            server_name: None,
        };
        let mut files = Vec::new();
        let options = tls_options(&tls, &mut files).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(options.allow_invalid_certificates, Some(true));

        let ca_path = options.ca_file_path.unwrap();
        assert_eq!(std::fs::read_to_string(ca_path).unwrap(), CA);
        let pair = std::fs::read_to_string(options.cert_key_file_path.unwrap()).unwrap();
        assert_eq!(pair, "CERT\nKEY");
    }
}
