use std::fs;

use serde::Deserialize;

use crate::errors::ConfigError;

/// Top-level service configuration, deserialized from a YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db: DbConfig,
    /// Metric names *matching* this pattern are rejected.
    pub metric_name_validation_regexp: String,
    /// Slice names *matching* this pattern are rejected.
    pub slice_name_validation_regexp: String,
    /// IANA zone used for date keys and minute-of-day derivation.
    pub time_zone: String,
    /// Seconds between flushes of the per-minute tables.
    #[serde(default = "default_flush_interval")]
    pub flush_to_db_interval: u64,
    /// Seconds between flushes of the daily totals tables.
    #[serde(default = "default_totals_interval")]
    pub flush_totals_interval: u64,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub pool_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: ServerMode,
    /// Basic auth credentials for /track.
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_cert_file_path: Option<String>,
    #[serde(default)]
    pub tls_key_file_path: Option<String>,
}

/// Mirrors the usual debug/release switch of HTTP frameworks; its only
/// effect is the default log filter when RUST_LOG is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Debug,
    #[default]
    Release,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

impl HttpConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_flush_interval() -> u64 {
    10
}

fn default_totals_interval() -> u64 {
    60
}

fn default_db_port() -> u16 {
    5432
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}
