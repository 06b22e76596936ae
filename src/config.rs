//! WolfMeta Configuration
//!
//! This module provides configuration structures for a WolfMeta node.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main WolfMeta configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfMetaConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique member name
    pub name: String,

    /// Data directory for local state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Comma-separated URLs clients use to reach this member
    pub client_urls: String,

    /// Comma-separated URLs used for peer traffic
    pub peer_urls: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Minimum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// TTL of the leader lease in milliseconds
    #[serde(default = "default_leader_lease_ms")]
    pub leader_lease_ms: u64,

    /// Deadline for a node to join the store and start serving
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Deadline for the whole cluster to converge after bootstrap
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path prefix for all API routes
    #[serde(default = "default_api_prefix")]
    pub prefix: String,

    /// Deadline for a single store operation made on behalf of a request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_election_timeout_min_ms() -> u64 {
    300
}

fn default_election_timeout_max_ms() -> u64 {
    600
}

fn default_leader_lease_ms() -> u64 {
    3000
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_settle_timeout_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

fn default_api_prefix() -> String {
    "/pd/api/v1".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmeta")
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            leader_lease_ms: default_leader_lease_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            settle_timeout_ms: default_settle_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_api_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Split a comma-joined URL list, dropping empty items
pub fn split_urls(urls: &str) -> Vec<String> {
    urls.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

impl WolfMetaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMetaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }

        for (field, urls) in [
            ("node.client_urls", self.client_urls()),
            ("node.peer_urls", self.peer_urls()),
        ] {
            if urls.is_empty() {
                return Err(crate::Error::Config(format!("{} cannot be empty", field)));
            }
            for url in &urls {
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    crate::Error::Config(format!("{} has invalid URL {}: {}", field, url, e))
                })?;
                if parsed.host_str().is_none() || parsed.port_or_known_default().is_none() {
                    return Err(crate::Error::Config(format!(
                        "{} URL {} needs a host and port",
                        field, url
                    )));
                }
            }
        }

        if self.cluster.election_timeout_min_ms > self.cluster.election_timeout_max_ms {
            return Err(crate::Error::Config(
                "cluster.election_timeout_min_ms exceeds election_timeout_max_ms".into(),
            ));
        }

        if !self.api.prefix.starts_with('/') || self.api.prefix.ends_with('/') {
            return Err(crate::Error::Config(
                "api.prefix must start with '/' and not end with one".into(),
            ));
        }

        Ok(())
    }

    /// Client URLs in configured order
    pub fn client_urls(&self) -> Vec<String> {
        split_urls(&self.node.client_urls)
    }

    /// Peer URLs in configured order
    pub fn peer_urls(&self) -> Vec<String> {
        split_urls(&self.node.peer_urls)
    }

    /// Address advertised as the leader address (first client URL)
    pub fn advertise_client_url(&self) -> String {
        self.client_urls().into_iter().next().unwrap_or_default()
    }

    /// host:port the HTTP API binds to, taken from the first client URL
    pub fn api_bind_address(&self) -> crate::Result<String> {
        let url = self.advertise_client_url();
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| crate::Error::Config(format!("invalid client URL {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| crate::Error::Config(format!("client URL {} has no host", url)))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| crate::Error::Config(format!("client URL {} has no port", url)))?;
        Ok(format!("{}:{}", host, port))
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Deadline for a single store operation
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.api.request_timeout_ms)
    }

    /// Leader lease TTL
    pub fn leader_lease(&self) -> Duration {
        Duration::from_millis(self.cluster.leader_lease_ms)
    }

    /// Join deadline for this node
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.join_timeout_ms)
    }

    /// Convergence deadline for cluster bootstrap
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.settle_timeout_ms)
    }

    /// Build configs for an `n`-node local cluster rooted at `base_dir`
    ///
    /// Each node gets its own data directory and a distinct pair of free
    /// localhost ports for its client and peer URLs.
    pub fn test_cluster(n: usize, base_dir: &Path) -> crate::Result<Vec<Self>> {
        let ports = free_ports(n * 2)?;
        let mut configs = Vec::with_capacity(n);
        for i in 1..=n {
            let client_port = ports[(i - 1) * 2];
            let peer_port = ports[(i - 1) * 2 + 1];
            configs.push(Self {
                node: NodeConfig {
                    name: format!("pd{}", i),
                    data_dir: base_dir.join(format!("pd{}", i)),
                    client_urls: format!("http://127.0.0.1:{}", client_port),
                    peer_urls: format!("http://127.0.0.1:{}", peer_port),
                },
                cluster: ClusterConfig {
                    election_timeout_min_ms: 100,
                    election_timeout_max_ms: 250,
                    leader_lease_ms: 1000,
                    ..ClusterConfig::default()
                },
                api: ApiConfig::default(),
                logging: LoggingConfig::default(),
            });
        }
        Ok(configs)
    }
}

/// Ask the OS for `count` distinct unused localhost ports
///
/// All listeners stay open until every port is picked so the OS cannot hand
/// out the same port twice.
fn free_ports(count: usize) -> crate::Result<Vec<u16>> {
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        listeners.push(std::net::TcpListener::bind("127.0.0.1:0")?);
    }
    listeners
        .iter()
        .map(|l| Ok(l.local_addr()?.port()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
name = "pd1"
data_dir = "/var/lib/wolfmeta"
client_urls = "http://10.0.0.1:2379, http://10.0.0.1:2479"
peer_urls = "http://10.0.0.1:2380"

[api]
request_timeout_ms = 2000
"#;

        let config = WolfMetaConfig::from_str(toml).unwrap();
        assert_eq!(config.node.name, "pd1");
        assert_eq!(config.client_urls().len(), 2);
        assert_eq!(config.advertise_client_url(), "http://10.0.0.1:2379");
        assert_eq!(config.api_bind_address().unwrap(), "10.0.0.1:2379");
        assert_eq!(config.api.prefix, "/pd/api/v1");
        assert_eq!(config.request_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_empty_urls() {
        let toml = r#"
[node]
name = "pd1"
client_urls = ""
peer_urls = "http://10.0.0.1:2380"
"#;

        assert!(WolfMetaConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_rejects_bad_prefix() {
        let toml = r#"
[node]
name = "pd1"
client_urls = "http://10.0.0.1:2379"
peer_urls = "http://10.0.0.1:2380"

[api]
prefix = "api/"
"#;

        assert!(WolfMetaConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_cluster_configs_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let configs = WolfMetaConfig::test_cluster(3, dir.path()).unwrap();
        assert_eq!(configs.len(), 3);

        let mut names: Vec<_> = configs.iter().map(|c| c.node.name.clone()).collect();
        names.dedup();
        assert_eq!(names.len(), 3);

        let mut dirs: Vec<_> = configs.iter().map(|c| c.node.data_dir.clone()).collect();
        dirs.sort();
        dirs.dedup();
        assert_eq!(dirs.len(), 3);

        for config in &configs {
            config.validate().unwrap();
        }
    }
}
