//! Configuration module for InfraMap.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;

use crate::storage::DEFAULT_LOG_CAPACITY;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Directory holding the board, the credential store and its key (default: "data")
    pub data_dir: PathBuf,
    /// Directory of static UI assets served at `/` (default: "public")
    pub static_dir: PathBuf,
    /// Capacity of the in-memory event log (default: 500)
    pub log_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_dir: PathBuf::from("data"),
            static_dir: PathBuf::from("public"),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `INFRAMAP_HTTP_PORT`: HTTP port (default: 8080)
    /// - `INFRAMAP_DATA_DIR`: data directory (default: "data")
    /// - `INFRAMAP_STATIC_DIR`: static asset directory (default: "public")
    /// - `INFRAMAP_LOG_CAPACITY`: event log capacity (default: 500)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = lookup("INFRAMAP_HTTP_PORT").and_then(|v| v.trim().parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(dir) = lookup("INFRAMAP_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            cfg.data_dir = PathBuf::from(dir);
        }

        if let Some(dir) = lookup("INFRAMAP_STATIC_DIR").filter(|v| !v.trim().is_empty()) {
            cfg.static_dir = PathBuf::from(dir);
        }

        if let Some(capacity) = lookup("INFRAMAP_LOG_CAPACITY").and_then(|v| v.trim().parse::<i64>().ok()) {
            if capacity > 0 {
                cfg.log_capacity = capacity as usize;
            }
        }

        cfg
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.data_dir.join("secrets.json")
    }

    pub fn secrets_key_path(&self) -> PathBuf {
        self.data_dir.join("secrets.key")
    }
}
