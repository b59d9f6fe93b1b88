//! WolfNFS Configuration
//!
//! This module provides configuration structures for a WolfNFS node:
//! local storage layout, static cluster membership, replication tuning
//! and network timeouts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfNFS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NfsConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Local file storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cluster membership configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Background replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Peer network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Address to bind for peer communication
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Advertised address other nodes use to reach this one
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Data directory for files and the fingerprint index
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// File name of the persisted fingerprint index (inside `index/`)
    #[serde(default = "default_index_file")]
    pub index_file: String,

    /// Store new files under a generated name, keeping only the extension
    #[serde(default)]
    pub rename: bool,
}

/// Static cluster membership
///
/// The engine takes membership as ground truth from outside. When running
/// the bundled daemon, this section is that source.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    /// All peer node addresses (may include this node's own address)
    #[serde(default)]
    pub peers: Vec<String>,

    /// Address of the master node
    #[serde(default)]
    pub master: Option<String>,

    /// Whether this node is the master
    #[serde(default)]
    pub is_master: bool,
}

/// Background replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of replication worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum number of queued replication tasks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum attempts per task (including the first)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for retry delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Interval between full inventory queries on the master (0 = disabled)
    #[serde(default = "default_query_interval_ms")]
    pub query_interval_ms: u64,
}

/// Peer network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds (covers the full round trip)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
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
fn default_node_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "node-1".to_string())
}

fn default_bind_address() -> String {
    "0.0.0.0:7660".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfnfs")
}

fn default_index_file() -> String {
    "fingerprints.json".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_query_interval_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            bind_address: default_bind_address(),
            advertise_address: None,
            data_dir: default_data_dir(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
            rename: false,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            query_interval_ms: default_query_interval_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
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

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            storage: StorageConfig::default(),
            cluster: ClusterConfig::default(),
            replication: ReplicationConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NfsConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: NfsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.storage.index_file.is_empty() || self.storage.index_file.contains('/') {
            return Err(crate::Error::Config(
                "storage.index_file must be a plain file name".into(),
            ));
        }

        if self.replication.workers == 0 {
            return Err(crate::Error::Config("replication.workers must be at least 1".into()));
        }

        if self.replication.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "replication.queue_capacity must be at least 1".into(),
            ));
        }

        if self.replication.max_retries == 0 {
            return Err(crate::Error::Config(
                "replication.max_retries must be at least 1".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or compact, got {}",
                self.logging.format
            )));
        }

        if self.cluster.is_master && self.cluster.master.is_some()
            && self.cluster.master.as_deref() != Some(self.advertise_address())
        {
            return Err(crate::Error::Config(
                "cluster.is_master is set but cluster.master names another node".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the master address, treating this node as master when flagged
    pub fn master_address(&self) -> Option<String> {
        if self.cluster.is_master {
            Some(self.advertise_address().to_string())
        } else {
            self.cluster.master.clone()
        }
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the directory holding replicated file bytes
    pub fn files_dir(&self) -> PathBuf {
        self.node.data_dir.join("files")
    }

    /// Get the directory holding the fingerprint index
    pub fn index_dir(&self) -> PathBuf {
        self.node.data_dir.join("index")
    }

    /// Get the full path of the fingerprint index file
    pub fn index_path(&self) -> PathBuf {
        self.index_dir().join(&self.storage.index_file)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.network.request_timeout_ms)
    }
}

impl ReplicationConfig {
    /// Delay before retry number `attempt` (1-indexed): doubles each time,
    /// capped at `max_backoff_ms`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Get the inventory query interval, if periodic queries are enabled
    pub fn query_interval(&self) -> Option<Duration> {
        if self.query_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.query_interval_ms))
        }
    }
}
