//! # Datasource Settings
//!
//! Connection settings as stored by the host: a public JSON object and a
//! map of decrypted secrets. Parsing failures here are internal errors;
//! bad values (URL, TLS material) are the user's to fix.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JsonData {
    pub url: String,
    pub tls: bool,
    pub tls_ca: String,
    pub tls_certificate: String,
    pub tls_insecure: bool,
    pub tls_server_name: String,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecureJsonData {
    pub username: String,
    pub password: String,
    pub tls_certificate_key: String,
}

impl std::fmt::Debug for SecureJsonData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureJsonData")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tls_certificate_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("Failed to parse data source settings: {0}")]
    Parse(String),
    #[error("Failed to remarshal secure data source settings: {0}")]
    Remarshal(String),
    #[error("Invalid Datasource URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to add tlsCA")]
    InvalidCa,
    #[error("Must provide both tlsCertificate and tlsCertificateKey, or neither")]
    CertificatePair,
}

impl SettingsError {
    /// Whether the failure lies with the host rather than the user's input.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Remarshal(_))
    }
}

/// TLS material and flags for a connection with `tls` enabled.
#[derive(Clone, PartialEq)]
pub struct TlsMaterial {
    pub ca_pem: Option<String>,
    /// Client certificate and its key, always supplied together.
    pub client_pem: Option<(String, String)>,
    pub insecure: bool,
    pub server_name: Option<String>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_pem", &self.ca_pem.as_ref().map(|_| "<pem>"))
            .field("client_pem", &self.client_pem.as_ref().map(|_| "<pem>"))
            .field("insecure", &self.insecure)
            .field("server_name", &self.server_name)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceSettings {
    pub json_data: JsonData,
    pub secure_json_data: SecureJsonData,
}

const PEM_CERTIFICATE: &str = "-----BEGIN CERTIFICATE-----";

impl DataSourceSettings {
    /// Build settings from the host's raw JSON and secret payloads.
    pub fn from_raw(
        json_data: &serde_json::Value,
        secrets: &HashMap<String, String>,
    ) -> Result<Self, SettingsError> {
        let json_data = if json_data.is_null() {
            JsonData::default()
        } else {
            serde_json::from_value(json_data.clone())
                .map_err(|e| SettingsError::Parse(e.to_string()))?
        };
        let secrets =
            serde_json::to_value(secrets).map_err(|e| SettingsError::Remarshal(e.to_string()))?;
        let secure_json_data =
            serde_json::from_value(secrets).map_err(|e| SettingsError::Parse(e.to_string()))?;
        Ok(Self {
            json_data,
            secure_json_data,
        })
    }

    /// The connection URI with the configured credentials applied.
    ///
    /// Seed lists (`mongodb://a:27017,b:27017`) are not valid URLs, so
    /// credentials are spliced into the authority instead of set through
    /// the parsed URL.
    pub fn connection_uri(&self) -> Result<String, SettingsError> {
        let raw = &self.json_data.url;
        let invalid = |reason: &str| SettingsError::InvalidUrl {
            url: raw.clone(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = raw.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);
        let hosts = authority.rsplit_once('@').map_or(authority, |(_, hosts)| hosts);
        if hosts.is_empty() {
            return Err(invalid("missing host"));
        }
        if !hosts.contains(',') {
            Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        }

        let username = &self.secure_json_data.username;
        if username.is_empty() {
            return Ok(raw.clone());
        }
        let user_info = encode_user_info(username, &self.secure_json_data.password)
            .ok_or_else(|| invalid("cannot carry credentials"))?;
        Ok(format!("{}://{}@{}{}", scheme, user_info, hosts, tail))
    }

    /// Validate and collect TLS material. `None` when TLS is off.
    pub fn tls_material(&self) -> Result<Option<TlsMaterial>, SettingsError> {
        let json = &self.json_data;
        if !json.tls {
            return Ok(None);
        }
        let ca_pem = non_empty(&json.tls_ca);
        if let Some(ca) = &ca_pem {
            if !ca.contains(PEM_CERTIFICATE) {
                return Err(SettingsError::InvalidCa);
            }
        }
        let client_pem = match (
            non_empty(&json.tls_certificate),
            non_empty(&self.secure_json_data.tls_certificate_key),
        ) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => return Err(SettingsError::CertificatePair),
        };
        Ok(Some(TlsMaterial {
            ca_pem,
            client_pem,
            insecure: json.tls_insecure,
            server_name: non_empty(&json.tls_server_name),
        }))
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Percent-encode `user:password` using a scratch URL.
fn encode_user_info(username: &str, password: &str) -> Option<String> {
    let mut scratch = Url::parse("mongodb://placeholder").ok()?;
    scratch.set_username(username).ok()?;
    scratch.set_password(Some(password)).ok()?;
    Some(format!(
        "{}:{}",
        scratch.username(),
        scratch.password().unwrap_or_default()
    ))
}
