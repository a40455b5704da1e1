//! Process-level tuning for sessions, the session cache and output capture,
//! read from a TOML file. Missing keys fall back to the defaults.

use std::{path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cache::{SessionCache, DEFAULT_CACHE_CAPACITY, DEFAULT_IDLE_TTL},
    connection::RemoteFileResolver,
    error::{Result, TransportError},
    executor::{OutputLog, DEFAULT_LINE_CAPACITY},
    session::SessionManager,
    transport::SshTransport,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Session connect timeout in seconds, zero for none.
    pub connect_timeout_secs: u64,
    /// Command timeout in seconds, zero for none.
    pub command_timeout_secs: u64,
    /// Seconds a cached session may sit unused, zero to keep it until it drops.
    pub cache_idle_secs: u64,
    pub cache_capacity: usize,
    /// Output lines retained per stream.
    pub output_lines: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout_secs: 0,
            command_timeout_secs: 0,
            cache_idle_secs: DEFAULT_IDLE_TTL.as_secs(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            output_lines: DEFAULT_LINE_CAPACITY,
        }
    }
}

impl TransportConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| TransportError::InvalidSettings(err.to_string()))
    }

    /// Loads the file at `path`, or the defaults if there is none.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "transport config not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        seconds(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        seconds(self.command_timeout_secs)
    }

    pub fn session_cache(&self) -> SessionCache {
        SessionCache::new(self.cache_capacity, seconds(self.cache_idle_secs))
    }

    pub fn output_log(&self) -> OutputLog {
        OutputLog::new(self.output_lines)
    }

    /// A resolver with its own session manager and cache, both tuned by this config.
    pub fn resolver(&self, transport: Arc<dyn SshTransport>) -> RemoteFileResolver {
        let sessions = SessionManager::new(transport).with_timeout(self.connect_timeout());
        RemoteFileResolver::new(Arc::new(sessions), Arc::new(self.session_cache()))
    }
}

fn seconds(value: u64) -> Option<Duration> {
    match value {
        0 => None,
        value => Some(Duration::from_secs(value)),
    }
}
