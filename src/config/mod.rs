//! Server configuration, loadable from TOML.
//!
//! ```toml
//! bind_addr = "127.0.0.1"
//! port = 8081
//! workers = 4
//! timeout_secs = 5
//! server_name = "explorer"
//! ```
//!
//! Missing keys take their defaults.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings shared by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Worker event loops; defaults to the number of available cores.
    pub workers: usize,
    /// Idle deadline and timer tick, in seconds.
    pub timeout_secs: u64,
    /// Value of the `Server` response header.
    pub server_name: String,
    /// Bodies larger than this many bytes are written in chunks.
    pub stream_threshold: usize,
    /// Largest accepted request head, in bytes.
    pub max_head_size: usize,
    /// Default `tracing` filter directive for binaries built on the crate.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 18080,
            workers: default_workers(),
            timeout_secs: 5,
            server_name: "corvid".to_owned(),
            stream_threshold: 1024 * 1024,
            max_head_size: 64 * 1024,
            log_level: "info".to_owned(),
        }
    }
}

fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, usize::from)
}

impl ServerConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be at least 1".into()));
        }
        if self.server_name.trim().is_empty() {
            return Err(ConfigError::Invalid("server_name must not be empty".into()));
        }
        if self.max_head_size == 0 {
            return Err(ConfigError::Invalid("max_head_size must be positive".into()));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
