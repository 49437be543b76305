//! Cluster configuration shared by every node type.
//!
//! Loaded from environment variables. The service crates embed a
//! [`ClusterConfig`] in their own `Config` and add service-specific fields.

use crate::secret::SecretString;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Default datacenter name.
pub const DEFAULT_DC: &str = "dc1";

/// Default TTL of the node registration record, in seconds.
pub const DEFAULT_NODE_TTL_SECONDS: u64 = 30;

/// Default interval between load reports / record refreshes, in seconds.
pub const DEFAULT_REPORT_INTERVAL_SECONDS: u64 = 10;

/// Default discovery poll interval, in milliseconds.
pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 1000;

/// Default RPC timeout, in milliseconds.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5000;

/// Cluster membership and substrate settings.
#[derive(Clone)]
pub struct ClusterConfig {
    /// Redis URL for the coordination store and bus. `None` selects the
    /// in-memory substrate (single-process deployments).
    pub redis_url: Option<SecretString>,

    /// Unique id of this node.
    pub node_id: String,

    /// Datacenter of this node.
    pub dc: String,

    /// Service name of this node (`biz`, `sfu`).
    pub service_name: String,

    /// TTL of the registration record.
    pub node_ttl: Duration,

    /// Interval between registration refreshes (and load reports).
    pub report_interval: Duration,

    /// Discovery poll interval.
    pub watch_interval: Duration,

    /// Timeout for synchronous RPC calls.
    pub rpc_timeout: Duration,
}

/// Custom Debug implementation that redacts the substrate URL.
impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("node_id", &self.node_id)
            .field("dc", &self.dc)
            .field("service_name", &self.service_name)
            .field("node_ttl", &self.node_ttl)
            .field("report_interval", &self.report_interval)
            .field("watch_interval", &self.watch_interval)
            .field("rpc_timeout", &self.rpc_timeout)
            .finish()
    }
}

impl ClusterConfig {
    /// Load cluster settings for `service_name` from a variable map.
    ///
    /// Never fails: every field has a default. Unparseable numbers fall back
    /// to their default.
    #[must_use]
    pub fn from_vars(service_name: &str, vars: &HashMap<String, String>) -> Self {
        let redis_url = vars
            .get("REDIS_URL")
            .filter(|url| !url.is_empty())
            .map(|url| SecretString::from(url.clone()));

        let node_id = vars.get("NODE_ID").cloned().unwrap_or_else(|| {
            let hostname = vars
                .get("HOSTNAME")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{service_name}-{hostname}-{short_suffix}")
        });

        let dc = vars
            .get("NODE_DC")
            .cloned()
            .unwrap_or_else(|| DEFAULT_DC.to_string());

        let node_ttl = Duration::from_secs(parse_or(
            vars,
            "NODE_TTL_SECONDS",
            DEFAULT_NODE_TTL_SECONDS,
        ));
        let report_interval = Duration::from_secs(parse_or(
            vars,
            "NODE_REPORT_INTERVAL_SECONDS",
            DEFAULT_REPORT_INTERVAL_SECONDS,
        ));
        let watch_interval = Duration::from_millis(parse_or(
            vars,
            "WATCH_INTERVAL_MS",
            DEFAULT_WATCH_INTERVAL_MS,
        ));
        let rpc_timeout =
            Duration::from_millis(parse_or(vars, "RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS));

        Self {
            redis_url,
            node_id,
            dc,
            service_name: service_name.to_string(),
            node_ttl,
            report_interval,
            watch_interval,
            rpc_timeout,
        }
    }
}

/// Parse a numeric variable, falling back to `default` when absent or invalid.
#[must_use]
pub fn parse_or(vars: &HashMap<String, String>, key: &str, default: u64) -> u64 {
    vars.get(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::secret::ExposeSecret;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::from_vars("sfu", &HashMap::new());

        assert!(config.redis_url.is_none());
        assert!(config.node_id.starts_with("sfu-unknown-"));
        assert_eq!(config.dc, DEFAULT_DC);
        assert_eq!(config.service_name, "sfu");
        assert_eq!(config.node_ttl, Duration::from_secs(30));
        assert_eq!(config.report_interval, Duration::from_secs(10));
        assert_eq!(config.watch_interval, Duration::from_millis(1000));
        assert_eq!(config.rpc_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_custom_values() {
        let vars = HashMap::from([
            ("REDIS_URL".to_string(), "redis://:pw@cache:6379".to_string()),
            ("NODE_ID".to_string(), "biz-7".to_string()),
            ("NODE_DC".to_string(), "eu-west".to_string()),
            ("NODE_TTL_SECONDS".to_string(), "12".to_string()),
            ("WATCH_INTERVAL_MS".to_string(), "250".to_string()),
            ("RPC_TIMEOUT_MS".to_string(), "not-a-number".to_string()),
        ]);

        let config = ClusterConfig::from_vars("biz", &vars);

        assert_eq!(
            config.redis_url.as_ref().unwrap().expose_secret(),
            "redis://:pw@cache:6379"
        );
        assert_eq!(config.node_id, "biz-7");
        assert_eq!(config.dc, "eu-west");
        assert_eq!(config.node_ttl, Duration::from_secs(12));
        assert_eq!(config.watch_interval, Duration::from_millis(250));
        // Invalid values fall back to the default
        assert_eq!(config.rpc_timeout, Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS));
    }

    #[test]
    fn test_empty_redis_url_means_in_memory() {
        let vars = HashMap::from([("REDIS_URL".to_string(), String::new())]);
        let config = ClusterConfig::from_vars("biz", &vars);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_debug_redacts_redis_url() {
        let vars = HashMap::from([("REDIS_URL".to_string(), "redis://:pw@cache:6379".to_string())]);
        let config = ClusterConfig::from_vars("biz", &vars);

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains(":pw@"));
    }
}
