//! Hub configuration, read from a TOML file. Every key is optional.

use mf_core::{DataSourceSettings, QueryOptions};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Default, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Datasource used when a request carries no plugin context.
    #[serde(default)]
    pub datasource: Option<DataSourceSettings>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_max_parallel_queries")]
    pub max_parallel_queries: usize,
    /// Zero disables the deadline.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_parallel_queries: default_max_parallel_queries(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

fn default_max_parallel_queries() -> usize {
    8
}
fn default_query_timeout() -> u64 {
    60
}

impl Config {
    /// Load from `path`. A missing file yields the defaults; an unreadable
    /// or malformed one is logged and also yields the defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| toml::from_str(&content).map_err(|e| e.to_string()));
        match parsed {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring config at {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            max_parallel_queries: self.server.max_parallel_queries,
            query_timeout: (self.server.query_timeout_secs > 0)
                .then(|| Duration::from_secs(self.server.query_timeout_secs)),
            default_settings: self.datasource.clone(),
        }
    }
}
