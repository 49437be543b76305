//! Signaling node configuration.
//!
//! Configuration is loaded from environment variables. The cluster part is
//! shared with the media node (see [`common::config::ClusterConfig`]).

use common::config::{parse_or, ClusterConfig};
use common::types::SERVICE_BIZ;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Default websocket signaling bind address.
pub const DEFAULT_SIGNAL_BIND_ADDRESS: &str = "0.0.0.0:8443";

/// Default room reconciliation interval in seconds.
pub const DEFAULT_CHECK_ROOM_INTERVAL_SECONDS: u64 = 10;

/// Signaling node configuration.
///
/// `Debug` is safe to log: the substrate URL inside `cluster` is redacted.
#[derive(Clone, Debug)]
pub struct Config {
    /// Cluster membership and substrate settings.
    pub cluster: ClusterConfig,

    /// Websocket signaling bind address (default: "0.0.0.0:8443").
    pub signal_bind_address: SocketAddr,

    /// Debug listener (health + metrics). Disabled when unset.
    pub debug_bind_address: Option<SocketAddr>,

    /// Interval between room reconciliation passes.
    pub check_room_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let cluster = ClusterConfig::from_vars(SERVICE_BIZ, vars);

        let signal_bind_address = parse_addr(
            vars.get("BIZ_SIGNAL_BIND_ADDRESS")
                .map_or(DEFAULT_SIGNAL_BIND_ADDRESS, String::as_str),
            "BIZ_SIGNAL_BIND_ADDRESS",
        )?;

        let debug_bind_address = vars
            .get("DEBUG_BIND_ADDRESS")
            .filter(|addr| !addr.is_empty())
            .map(|addr| parse_addr(addr, "DEBUG_BIND_ADDRESS"))
            .transpose()?;

        let check_room_seconds = parse_or(
            vars,
            "BIZ_CHECK_ROOM_INTERVAL_SECONDS",
            DEFAULT_CHECK_ROOM_INTERVAL_SECONDS,
        );
        if check_room_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "BIZ_CHECK_ROOM_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            cluster,
            signal_bind_address,
            debug_bind_address,
            check_room_interval: Duration::from_secs(check_room_seconds),
        })
    }
}

fn parse_addr(value: &str, key: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("{key}={value}: {e}")))
}
