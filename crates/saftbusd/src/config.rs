//! Broker configuration.
//!
//! Loaded from an optional TOML file; the `SAFTBUS_SOCKET_PATH` environment
//! variable overrides the file's socket path.
//!
//! ```toml
//! socket_path = "/run/saftbus/saftbus.sock"
//! socket_mode = 0o660
//! max_clients = 64
//! track_flight_time = true
//! state_dir = "/var/lib/saftbus"   # PID and log file of the daemon
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use saftbus_protocol::{DEFAULT_SOCKET_PATH, SOCKET_PATH_ENV};

use crate::broker::{BrokerOptions, DEFAULT_MAX_CLIENTS};
use crate::pidfile::PidFile;

/// Default permission bits of the rendezvous socket.
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    pub max_clients: usize,
    pub track_flight_time: bool,
    /// Defaults to `$XDG_STATE_HOME/saftbus`, or `/tmp/saftbus`.
    pub state_dir: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: DEFAULT_SOCKET_MODE,
            max_clients: DEFAULT_MAX_CLIENTS,
            track_flight_time: false,
            state_dir: None,
        }
    }
}

impl BrokerConfig {
    /// Loads the configuration file at `path` (if any) and applies the
    /// environment override.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };

        if let Some(socket) = std::env::var_os(SOCKET_PATH_ENV) {
            config.socket_path = PathBuf::from(socket);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket_path is empty".to_string()));
        }
        if self.socket_mode > 0o777 {
            return Err(ConfigError::Invalid(format!(
                "socket_mode {:#o} has bits outside 0o777",
                self.socket_mode
            )));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::state_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("saftbus"),
        }
    }

    pub fn pid_file(&self) -> PidFile {
        PidFile::new(self.state_dir().join("saftbusd.pid"))
    }

    /// Where a daemonized broker writes its output.
    pub fn log_path(&self) -> PathBuf {
        self.state_dir().join("saftbusd.log")
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            max_clients: self.max_clients,
            track_flight_time: self.track_flight_time,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Invalid config file: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
