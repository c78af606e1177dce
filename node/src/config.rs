//! # Node Configuration
//!
//! Loads `config.toml` into a [`NodeConfig`]. Every section is optional;
//! anything missing falls back to the defaults below, so an empty file is a
//! valid configuration.
//!
//! ```toml
//! [api]
//! listen_addr = "0.0.0.0:8741"
//! metrics_addr = "0.0.0.0:8742"
//!
//! [logging]
//! level = "covenant_node=info,covenant_contracts=info"
//! format = "json"
//!
//! [escrow]
//! min_timeout_secs = 3600
//! max_timeout_secs = 31536000
//! max_description_len = 1024
//!
//! [ledger.genesis]
//! alice = 1000000
//! bob = 250000
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use covenant_contracts::config::ConfigError as EscrowConfigError;
use covenant_contracts::EscrowConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogFormat;

/// Default API listen address.
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8741";

/// Default Prometheus listen address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8742";

/// Default tracing directive when `RUST_LOG` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "covenant_node=info,covenant_contracts=info,tower_http=info";

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors that can occur while loading the node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("failed to access {path}: {error}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        error: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A listen address could not be parsed.
    #[error("invalid listen address {addr:?}: {reason}")]
    Address {
        /// The offending value.
        addr: String,
        /// Parser message.
        reason: String,
    },

    /// The `[escrow]` section violates the protocol limits.
    #[error("invalid escrow config: {0}")]
    Escrow(#[from] EscrowConfigError),
}

/// `[api]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the REST/WebSocket API binds to.
    pub listen_addr: String,
    /// Address the Prometheus endpoint binds to.
    pub metrics_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_API_ADDR.to_string(),
            metrics_addr: DEFAULT_METRICS_ADDR.to_string(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// `[ledger]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Balances credited on a fresh start (ignored when a snapshot exists).
    pub genesis: BTreeMap<String, u64>,
}

/// Complete node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub escrow: EscrowConfig,
    pub ledger: LedgerConfig,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|error| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the listen addresses and the escrow limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api_addr()?;
        self.metrics_addr()?;
        self.escrow.validate()?;
        Ok(())
    }

    pub fn api_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.api.listen_addr)
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.api.metrics_addr)
    }

    /// Renders the configuration as TOML, e.g. for `covenant-node init`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse().map_err(|e: std::net::AddrParseError| ConfigError::Address {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = NodeConfig::parse("").unwrap();
        assert_eq!(cfg, NodeConfig::default());
        assert_eq!(cfg.api_addr().unwrap().port(), 8741);
        assert_eq!(cfg.metrics_addr().unwrap().port(), 8742);
    }

    #[test]
    fn full_file_parses() {
        let cfg = NodeConfig::parse(
            r#"
            [api]
            listen_addr = "127.0.0.1:9000"

            [logging]
            format = "json"

            [escrow]
            min_timeout_secs = 7200

            [ledger.genesis]
            alice = 1000
            bob = 5
            "#,
        )
        .unwrap();

        assert_eq!(cfg.api.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.api.metrics_addr, DEFAULT_METRICS_ADDR);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.level, DEFAULT_LOG_LEVEL);
        assert_eq!(cfg.escrow.min_timeout_secs, 7200);
        assert_eq!(cfg.ledger.genesis.get("alice"), Some(&1000));
        assert_eq!(cfg.ledger.genesis.len(), 2);
    }

    #[test]
    fn escrow_floor_is_enforced() {
        let err = NodeConfig::parse("[escrow]\nmin_timeout_secs = 60\n").unwrap_err();
        assert!(matches!(err, ConfigError::Escrow(_)));
    }

    #[test]
    fn escrow_ceiling_is_enforced() {
        let err = NodeConfig::parse("[escrow]\nmax_timeout_secs = 9223372036854775807\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Escrow(_)));
    }

    #[test]
    fn bad_address_rejected() {
        let err = NodeConfig::parse("[api]\nlisten_addr = \"not-an-addr\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Address { .. }));
    }

    #[test]
    fn malformed_toml_rejected() {
        assert!(matches!(
            NodeConfig::parse("[api\nlisten_addr = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rendered_config_parses_back() {
        let mut cfg = NodeConfig::default();
        cfg.ledger.genesis.insert("alice".into(), 42);
        let rendered = cfg.to_toml().unwrap();
        assert_eq!(NodeConfig::parse(&rendered).unwrap(), cfg);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
