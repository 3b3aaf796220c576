//! txrelay Configuration
//!
//! TOML configuration for a replication node: identity, transaction log,
//! replication tuning, static cluster layout and logging.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::replication::HaSettings;
use crate::transport::Endpoint;

/// Main txrelay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRelayConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Transaction log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Replication tuning
    #[serde(default)]
    pub ha: HaConfig,

    /// Static cluster layout
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Data directory for the transaction log
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Transaction log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable LZ4 compression for log records
    #[serde(default = "default_true")]
    pub compression: bool,

    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_true")]
    pub fsync: bool,
}

/// Replication tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfig {
    /// Interval between timed pulls ("0" disables them)
    #[serde(with = "duration_format", default = "default_pull_interval")]
    pub pull_interval: Duration,

    /// Replicas notified per commit
    #[serde(default = "default_push_factor")]
    pub tx_push_factor: usize,

    /// Per-commit deadline for push acknowledgements
    #[serde(with = "duration_format", default = "default_push_timeout")]
    pub push_timeout: Duration,

    /// Pull retries after the first failed attempt
    #[serde(default = "default_pull_retry_max")]
    pub pull_retry_max: u32,

    #[serde(with = "duration_format", default = "default_backoff_initial")]
    pub pull_backoff_initial: Duration,

    #[serde(with = "duration_format", default = "default_backoff_max")]
    pub pull_backoff_max: Duration,

    /// Records read from the log per chunk while serving a pull
    #[serde(default = "default_pull_batch_size")]
    pub pull_batch_size: usize,

    /// Most records in one pull response
    #[serde(default = "default_pull_max_records")]
    pub pull_max_records: usize,

    /// Concurrent push notifications
    #[serde(default = "default_push_workers")]
    pub push_workers: usize,
}

/// Static cluster layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Member id of the initial primary
    #[serde(default)]
    pub primary: Option<String>,

    /// Cluster members (may include this node)
    #[serde(default)]
    pub members: Vec<MemberConfig>,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// One cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: String,
    pub address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/txrelay")
}

fn default_pull_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_push_factor() -> usize {
    1
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_pull_retry_max() -> u32 {
    6
}

fn default_backoff_initial() -> Duration {
    Duration::from_millis(100)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(5)
}

fn default_pull_batch_size() -> usize {
    1000
}

fn default_pull_max_records() -> usize {
    100_000
}

fn default_push_workers() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            compression: true,
            fsync: true,
        }
    }
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            pull_interval: default_pull_interval(),
            tx_push_factor: default_push_factor(),
            push_timeout: default_push_timeout(),
            pull_retry_max: default_pull_retry_max(),
            pull_backoff_initial: default_backoff_initial(),
            pull_backoff_max: default_backoff_max(),
            pull_batch_size: default_pull_batch_size(),
            pull_max_records: default_pull_max_records(),
            push_workers: default_push_workers(),
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

impl From<&HaConfig> for HaSettings {
    fn from(ha: &HaConfig) -> Self {
        Self {
            pull_interval: ha.pull_interval,
            push_factor: ha.tx_push_factor,
            push_timeout: ha.push_timeout,
            pull_retry_max: ha.pull_retry_max,
            backoff_initial: ha.pull_backoff_initial,
            backoff_max: ha.pull_backoff_max,
            pull_batch_size: ha.pull_batch_size,
            pull_max_records: ha.pull_max_records,
            push_workers: ha.push_workers,
        }
    }
}

impl TxRelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: TxRelayConfig = toml::from_str(content)?;
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

        if self.ha.pull_batch_size == 0 {
            return Err(crate::Error::Config("ha.pull_batch_size must be at least 1".into()));
        }

        if self.ha.pull_max_records == 0 {
            return Err(crate::Error::Config("ha.pull_max_records must be at least 1".into()));
        }

        if self.ha.push_workers == 0 {
            return Err(crate::Error::Config("ha.push_workers must be at least 1".into()));
        }

        if self.ha.pull_backoff_initial > self.ha.pull_backoff_max {
            return Err(crate::Error::Config(
                "ha.pull_backoff_initial cannot exceed ha.pull_backoff_max".into(),
            ));
        }

        if self.request_timeout() <= self.ha.push_timeout {
            return Err(crate::Error::Config(
                "cluster.request_timeout_ms must be longer than ha.push_timeout".into(),
            ));
        }

        let mut seen = HashSet::new();
        for member in &self.cluster.members {
            if member.id.is_empty() || member.address.is_empty() {
                return Err(crate::Error::Config(
                    "cluster.members entries need an id and an address".into(),
                ));
            }
            if !seen.insert(member.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "cluster member {} is listed twice",
                    member.id
                )));
            }
        }

        if let Some(primary) = &self.cluster.primary {
            if *primary != self.node.id && !seen.contains(primary.as_str()) {
                return Err(crate::Error::Config(format!(
                    "cluster.primary {} is not a cluster member",
                    primary
                )));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be \"pretty\" or \"json\", got {}",
                self.logging.format
            )));
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

    /// This node as other members reach it
    pub fn self_endpoint(&self) -> Endpoint {
        Endpoint::new(self.node.id.clone(), self.advertise_address())
    }

    /// Other cluster members
    pub fn peers(&self) -> Vec<Endpoint> {
        self.cluster
            .members
            .iter()
            .filter(|m| m.id != self.node.id)
            .map(|m| Endpoint::new(m.id.clone(), m.address.clone()))
            .collect()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the transaction log file path
    pub fn log_path(&self) -> PathBuf {
        self.node.data_dir.join("txlog").join("tx.log")
    }

    pub fn ha_settings(&self) -> HaSettings {
        HaSettings::from(&self.ha)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }
}

/// Parse a duration: bare milliseconds or a number with `ms`, `s`, `m` or `h`
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {:?}", text))?;
    let secs = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("invalid duration: {:?}", text))
    };
    match unit.trim() {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => secs(60),
        "h" => secs(3600),
        other => Err(format!("unknown duration unit {:?} in {:?}", other, text)),
    }
}

/// Render a duration the way [`parse_duration`] reads it back
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

mod duration_format {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(millis) => Ok(Duration::from_millis(millis)),
            Raw::Text(text) => super::parse_duration(&text).map_err(D::Error::custom),
        }
    }
}
