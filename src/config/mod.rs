//! Configuration management

use crate::http::DEFAULT_OBFS_HOST;
use crate::pool::{ConnPool, DEFAULT_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for one tunnel endpoint.
///
/// Supplies the disguise host names and the pool used by the dial path.
/// Cipher and proxy settings belong to the layers above and are not
/// represented here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local listen address
    pub localaddr: Option<String>,
    /// Upstream address dialed by the outbound path
    pub remoteaddr: Option<String>,
    /// Disguise host names for the obfuscation handshake; one is chosen
    /// uniformly at random per dial when several are configured
    #[serde(default)]
    pub obfs_host: Vec<String>,
    /// Idle connections kept for reuse
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Single backend, folded into `backends` by [`normalize`](Config::normalize)
    #[serde(default)]
    pub backend: Option<Box<Config>>,
    /// Backend targets this endpoint forwards to
    #[serde(default)]
    pub backends: Vec<Config>,
    /// Runtime pool handle, wired in after load
    #[serde(skip)]
    pub pool: Option<ConnPool>,
}

fn default_pool_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Config {
    /// Load configuration from a TOML file and normalize it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.normalize();
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Fold `backend` into `backends` and recurse; idempotent
    pub fn normalize(&mut self) {
        if let Some(backend) = self.backend.take() {
            self.backends.push(*backend);
        }
        for backend in &mut self.backends {
            backend.normalize();
        }
    }

    /// Create the reuse pool according to `pool_capacity`; keeps an already
    /// attached pool
    pub fn ensure_pool(&mut self) {
        if self.pool.is_none() {
            self.pool = Some(ConnPool::new(self.pool_capacity));
        }
    }

    /// Disguise host for the next dial: the default when none is
    /// configured, the single configured one, or a uniformly random pick.
    pub fn pick_obfs_host(&self) -> &str {
        match self.obfs_host.len() {
            0 => DEFAULT_OBFS_HOST,
            1 => &self.obfs_host[0],
            n => &self.obfs_host[crate::obfs::pick_host_index(n)],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            localaddr: None,
            remoteaddr: None,
            obfs_host: Vec::new(),
            pool_capacity: DEFAULT_CAPACITY,
            backend: None,
            backends: Vec::new(),
            pool: None,
        }
    }
}
