//! Connection and transfer settings.
//!
//! Both structs deserialize with serde, so any field may be omitted in a
//! config document, and [`ConnectionConfig::from_env`] fills the connection
//! details from `TABLEBRIDGE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Default server port.
pub const DEFAULT_PORT: u16 = 4064;

/// Environment variable holding the server host.
pub const ENV_SERVER: &str = "TABLEBRIDGE_SERVER";
/// Environment variable holding the server port.
pub const ENV_PORT: &str = "TABLEBRIDGE_PORT";
/// Environment variable holding the username.
pub const ENV_USERNAME: &str = "TABLEBRIDGE_USERNAME";
/// Environment variable holding the password.
pub const ENV_PASSWORD: &str = "TABLEBRIDGE_PASSWORD";
/// Environment variable holding an existing session key.
pub const ENV_SESSION_KEY: &str = "TABLEBRIDGE_SESSION_KEY";

/// Errors loading configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// A variable holds a value of the wrong shape.
    #[snafu(display("Invalid value '{value}' for {variable}"))]
    InvalidValue {
        /// Variable name.
        variable: String,
        /// Offending value.
        value: String,
    },

    /// A JSON config document could not be parsed.
    #[snafu(display("Invalid configuration document: {source}"))]
    Document {
        /// Underlying parse error.
        source: serde_json::Error,
    },
}

/// How to reach and authenticate against the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server host.
    #[serde(default)]
    pub server: Option<String>,

    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for password logins.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for password logins.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Key of an existing session to join.
    #[serde(default, skip_serializing)]
    pub session_key: Option<String>,

    /// Whether a locally stored user token may be used.
    #[serde(default = "default_true")]
    pub allow_token: bool,

    /// Heartbeat interval in seconds; `0` disables the heartbeat.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    60
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: default_port(),
            username: None,
            password: None,
            session_key: None,
            allow_token: true,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl ConnectionConfig {
    /// Heartbeat interval, or `None` when disabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }

    /// Parse a JSON document; omitted fields take their defaults.
    pub fn from_json(doc: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(doc).context(DocumentSnafu)
    }

    /// Defaults overridden by the `TABLEBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `TABLEBRIDGE_*` variable name. Empty values are ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.server = get(ENV_SERVER);
        config.username = get(ENV_USERNAME);
        config.password = get(ENV_PASSWORD);
        config.session_key = get(ENV_SESSION_KEY);
        if let Some(port) = get(ENV_PORT) {
            config.port = port.trim().parse().ok().context(InvalidValueSnafu {
                variable: ENV_PORT,
                value: port.clone(),
            })?;
        }
        Ok(config)
    }
}

/// Chunking parameters for reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Rows per remote read.
    #[serde(default = "default_chunk_rows")]
    pub read_chunk_rows: usize,

    /// Rows scanned to infer column kinds.
    #[serde(default = "default_chunk_rows")]
    pub scan_chunk_rows: usize,

    /// Rows per remote append; `None` derives it from the column count.
    #[serde(default)]
    pub push_chunk_rows: Option<usize>,

    /// Rows per row group when writing a registration artifact.
    #[serde(default = "default_chunk_rows")]
    pub artifact_chunk_rows: usize,

    /// Bytes per raw file read.
    #[serde(default = "default_raw_chunk_bytes")]
    pub raw_chunk_bytes: usize,
}

fn default_chunk_rows() -> usize {
    1000
}

fn default_raw_chunk_bytes() -> usize {
    1024 * 1024
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_chunk_rows: default_chunk_rows(),
            scan_chunk_rows: default_chunk_rows(),
            push_chunk_rows: None,
            artifact_chunk_rows: default_chunk_rows(),
            raw_chunk_bytes: default_raw_chunk_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn omitted_fields_take_defaults() {
        let config = ConnectionConfig::from_json(r#"{"server": "example.org"}"#).unwrap();
        assert_eq!(config.server.as_deref(), Some("example.org"));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(60)));
        assert!(config.allow_token);

        let transfer: TransferConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(transfer, TransferConfig::default());
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars = HashMap::from([
            (ENV_SERVER, "omero.example.org"),
            (ENV_PORT, "4080"),
            (ENV_USERNAME, "alice"),
            (ENV_PASSWORD, ""),
        ]);
        let config =
            ConnectionConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.server.as_deref(), Some("omero.example.org"));
        assert_eq!(config.port, 4080);
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.password, None);
    }

    #[test]
    fn bad_port_is_reported() {
        let err = ConnectionConfig::from_lookup(|name| {
            (name == ENV_PORT).then(|| "http".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_interval_disables_heartbeat() {
        let config = ConnectionConfig {
            keep_alive_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.keep_alive(), None);
    }
}
