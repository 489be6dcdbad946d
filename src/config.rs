// src/config.rs
use clap::Parser;
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::local_store::DEFAULT_STORAGE_DIR;
use crate::remote::{DEFAULT_IMAGE_BUCKET, DEFAULT_SETTLEMENT_IMAGE_BUCKET};

pub const ENV_PREFIX: &str = "LEDGER_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid environment configuration: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid bind address '{addr}': {source}")]
    BindAddr {
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("Both cert_path and key_path must be set to enable HTTPS")]
    IncompleteTls,
}

/// Settings read from `LEDGER_*` environment variables (after `.env`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Absent means offline mode with an in-process remote store.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub remote_api_key: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,
    #[serde(default = "default_image_bucket")]
    pub image_bucket: String,
    #[serde(default = "default_settlement_image_bucket")]
    pub settlement_image_bucket: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_query_cache_ttl_ms")]
    pub query_cache_ttl_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_DIR)
}
fn default_remote_timeout_secs() -> u64 {
    15
}
fn default_image_bucket() -> String {
    DEFAULT_IMAGE_BUCKET.to_string()
}
fn default_settlement_image_bucket() -> String {
    DEFAULT_SETTLEMENT_IMAGE_BUCKET.to_string()
}
fn default_user_id() -> String {
    "local".to_string()
}
fn default_query_cache_ttl_ms() -> u64 {
    5000
}
fn default_debounce_ms() -> u64 {
    300
}
fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

#[derive(Debug, Clone, Parser)]
#[command(name = "labor-ledger", about = "Labor ledger reconciliation server")]
pub struct Cli {
    /// Address to listen on, overrides LEDGER_BIND_ADDR.
    #[arg(long)]
    pub bind: Option<String>,
    /// Local cache directory, overrides LEDGER_STORAGE_DIR.
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,
    /// Print the worker view of a project as CSV and exit.
    #[arg(long, value_name = "PROJECT_ID")]
    pub export_csv: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed(ENV_PREFIX).from_iter(vars)?)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bind) = &cli.bind {
            self.bind_addr = bind.clone();
        }
        if let Some(dir) = &cli.storage_dir {
            self.storage_dir = dir.clone();
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|source| ConfigError::BindAddr {
                addr: self.bind_addr.clone(),
                source,
            })
    }

    /// `Some` when HTTPS is configured; one path without the other is an error.
    pub fn tls_paths(&self) -> Result<Option<(&Path, &Path)>, ConfigError> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Ok(Some((cert.as_path(), key.as_path()))),
            (None, None) => Ok(None),
            _ => Err(ConfigError::IncompleteTls),
        }
    }

    pub fn query_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.query_cache_ttl_ms as i64)
    }

    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms)
    }
}
