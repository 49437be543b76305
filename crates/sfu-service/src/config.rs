//! Media node configuration.
//!
//! Configuration is loaded from environment variables. The cluster part is
//! shared with the signaling node (see [`common::config::ClusterConfig`]).

use common::config::{parse_or, ClusterConfig};
use common::types::SERVICE_SFU;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Default ICE server list.
pub const DEFAULT_ICE_SERVERS: &str = "stun:stun.l.google.com:19302";

/// Default per-kind RTP queue capacity, in packets.
pub const DEFAULT_RTP_QUEUE_CAPACITY: u64 = 100;

/// Default interval between dead-publisher sweeps, in seconds.
pub const DEFAULT_REAP_INTERVAL_SECONDS: u64 = 5;

/// Media node configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Cluster membership and substrate settings.
    pub cluster: ClusterConfig,

    /// Debug listener (health + metrics). Disabled when unset.
    pub debug_bind_address: Option<SocketAddr>,

    /// ICE server URLs handed to every transport session.
    pub ice_servers: Vec<String>,

    /// Inclusive UDP port range for ICE candidates; `None` leaves it to the OS.
    pub ice_port_range: Option<(u16, u16)>,

    /// Capacity of each publisher's audio and video queue.
    pub rtp_queue_capacity: usize,

    /// Interval between dead-publisher sweeps.
    pub reap_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
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
        let cluster = ClusterConfig::from_vars(SERVICE_SFU, vars);

        let debug_bind_address = vars
            .get("DEBUG_BIND_ADDRESS")
            .filter(|addr| !addr.is_empty())
            .map(|addr| {
                addr.parse().map_err(|e| {
                    ConfigError::InvalidValue(format!("DEBUG_BIND_ADDRESS={addr}: {e}"))
                })
            })
            .transpose()?;

        let ice_servers: Vec<String> = vars
            .get("SFU_ICE_SERVERS")
            .map_or(DEFAULT_ICE_SERVERS, String::as_str)
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect();

        let port_start = parse_port(vars, "SFU_ICE_PORT_START")?;
        let port_end = parse_port(vars, "SFU_ICE_PORT_END")?;
        // Both bounds must be set for the range to apply
        let ice_port_range = match (port_start, port_end) {
            (0, _) | (_, 0) => None,
            (start, end) if start > end => {
                return Err(ConfigError::InvalidValue(format!(
                    "SFU_ICE_PORT_START ({start}) is greater than SFU_ICE_PORT_END ({end})"
                )));
            }
            (start, end) => Some((start, end)),
        };

        let rtp_queue_capacity = usize::try_from(parse_or(
            vars,
            "SFU_RTP_QUEUE_CAPACITY",
            DEFAULT_RTP_QUEUE_CAPACITY,
        ))
        .map_err(|e| ConfigError::InvalidValue(format!("SFU_RTP_QUEUE_CAPACITY: {e}")))?;
        if rtp_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_RTP_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }

        let reap_seconds = parse_or(vars, "SFU_REAP_INTERVAL_SECONDS", DEFAULT_REAP_INTERVAL_SECONDS);
        if reap_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_REAP_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            cluster,
            debug_bind_address,
            ice_servers,
            ice_port_range,
            rtp_queue_capacity,
            reap_interval: Duration::from_secs(reap_seconds),
        })
    }
}

fn parse_port(vars: &HashMap<String, String>, key: &str) -> Result<u16, ConfigError> {
    match vars.get(key) {
        None => Ok(0),
        Some(value) => value
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{key}={value}: {e}"))),
    }
}
