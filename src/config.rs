//! Configuration Loader
//! - Reads poolkeeper.toml for cluster topology and supervisor tuning
//! - Provides CLI argument parsing with clap

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Hard cap on the number of configured backends. The shared backend table
/// is sized for this many slots regardless of how many are configured.
pub const MAX_BACKENDS: usize = 128;

/// Listen backlog is capped here no matter what the multiplier says.
pub const MAX_LISTEN_BACKLOG: i32 = 10000;

// =============================================================================
// CLI Configuration
// =============================================================================

/// Poolkeeper - connection pool supervisor for replicated PostgreSQL backends
#[derive(Parser)]
#[command(name = "poolkeeper", version, about = "Connection pool supervisor")]
pub struct Cli {
    /// Path to the cluster configuration file
    #[arg(short = 'f', long, default_value = "poolkeeper.toml", env = "POOLKEEPER_CONFIG")]
    pub config: PathBuf,

    /// Discard the persisted backend status file and start every backend
    /// in connect-wait state
    #[arg(short = 'D', long)]
    pub discard_status: bool,

    /// Wipe the query-cache OID maps on startup
    #[arg(short = 'C', long)]
    pub clear_oidmaps: bool,
}

// =============================================================================
// Cluster Configuration
// =============================================================================

/// Replication topology the backends are running.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// One writable primary, WAL-streaming standbys.
    #[default]
    StreamingReplication,
    /// Logical replication; still a single writable primary.
    LogicalReplication,
    /// Statement-level replication driven by the proxy itself.
    NativeReplication,
    /// No replication awareness at all.
    Raw,
}

impl ClusterMode {
    /// True for the modes where exactly one backend is writable and a
    /// primary node id is meaningful.
    pub fn supports_primary(self) -> bool {
        matches!(
            self,
            ClusterMode::StreamingReplication | ClusterMode::LogicalReplication
        )
    }

    pub fn is_streaming(self) -> bool {
        self == ClusterMode::StreamingReplication
    }

    pub fn is_raw(self) -> bool {
        self == ClusterMode::Raw
    }
}

/// One `[[backend]]` table from the configuration file.
#[derive(Deserialize, Clone, Debug)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub data_directory: String,
    /// Trust this node as primary without probing.
    #[serde(default)]
    pub always_primary: bool,
    /// Never fail this node over automatically.
    #[serde(default)]
    pub disallow_to_failover: bool,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "backend")]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub mode: ClusterMode,

    // ---- fleet sizing ----
    /// Number of long-lived query worker processes (M).
    #[serde(default = "default_num_init_children")]
    pub num_init_children: usize,
    /// Per-worker connection pool depth (P).
    #[serde(default = "default_max_pool")]
    pub max_pool: usize,

    // ---- listeners ----
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_listen_addresses")]
    pub listen_addresses: Vec<String>,
    #[serde(default = "default_backlog_multiplier")]
    pub listen_backlog_multiplier: u32,

    #[serde(default = "default_pcp_port")]
    pub pcp_port: u16,
    #[serde(default = "default_socket_dir")]
    pub pcp_socket_dir: PathBuf,
    #[serde(default)]
    pub pcp_listen_addresses: Vec<String>,

    #[serde(default = "default_logdir")]
    pub logdir: PathBuf,

    // ---- failover ----
    #[serde(default)]
    pub failover_command: String,
    #[serde(default)]
    pub failback_command: String,
    #[serde(default)]
    pub follow_primary_command: String,
    /// Seconds to keep retrying primary discovery. 0 means retry forever.
    #[serde(default = "default_search_primary_node_timeout")]
    pub search_primary_node_timeout: u64,
    /// Automatically demote split-brain primaries.
    #[serde(default)]
    pub detach_false_primary: bool,

    // ---- probe credentials (streaming replication checks) ----
    #[serde(default = "default_sr_check_user")]
    pub sr_check_user: String,
    #[serde(default)]
    pub sr_check_password: String,
    #[serde(default = "default_sr_check_database")]
    pub sr_check_database: String,

    // ---- health checks ----
    #[serde(default = "default_health_check_period")]
    pub health_check_period: u64,

    // ---- watchdog ----
    #[serde(default)]
    pub use_watchdog: bool,

    // ---- query / relation cache regions ----
    #[serde(default)]
    pub memory_cache_enabled: bool,
    #[serde(default)]
    pub enable_shared_relcache: bool,
    /// Size of the shared query-cache region when enabled.
    #[serde(default = "default_cache_region_bytes")]
    pub cache_region_bytes: usize,
}

fn default_num_init_children() -> usize {
    32
}
fn default_max_pool() -> usize {
    4
}
fn default_port() -> u16 {
    9999
}
fn default_pcp_port() -> u16 {
    9898
}
fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_listen_addresses() -> Vec<String> {
    vec!["localhost".to_string()]
}
fn default_backlog_multiplier() -> u32 {
    2
}
fn default_logdir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_search_primary_node_timeout() -> u64 {
    300
}
fn default_sr_check_user() -> String {
    "postgres".to_string()
}
fn default_sr_check_database() -> String {
    "postgres".to_string()
}
fn default_health_check_period() -> u64 {
    30
}
fn default_cache_region_bytes() -> usize {
    64 * 1024 * 1024
}

impl Config {
    /// Load and validate a configuration file. Invalid configuration is
    /// fatal at startup.
    pub fn load(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("at least one [[backend]] must be configured");
        }
        if self.backends.len() > MAX_BACKENDS {
            bail!(
                "{} backends configured, maximum is {}",
                self.backends.len(),
                MAX_BACKENDS
            );
        }
        if self.num_init_children == 0 {
            bail!("num_init_children must be greater than zero");
        }
        if self.max_pool == 0 {
            bail!("max_pool must be greater than zero");
        }
        Ok(())
    }

    /// Listen backlog: workers times multiplier, capped.
    pub fn listen_backlog(&self) -> i32 {
        let backlog = (self.num_init_children as u64) * (self.listen_backlog_multiplier as u64);
        backlog.min(MAX_LISTEN_BACKLOG as u64) as i32
    }

    pub fn cache_region_enabled(&self) -> bool {
        self.memory_cache_enabled || self.enable_shared_relcache
    }

    /// Apply the reloadable subset of a freshly parsed configuration.
    ///
    /// Topology and sizing are fixed for the life of the supervisor; only
    /// commands, timeouts and probe credentials may change on SIGHUP.
    pub fn apply_reload(&mut self, fresh: Config) {
        self.failover_command = fresh.failover_command;
        self.failback_command = fresh.failback_command;
        self.follow_primary_command = fresh.follow_primary_command;
        self.search_primary_node_timeout = fresh.search_primary_node_timeout;
        self.detach_false_primary = fresh.detach_false_primary;
        self.sr_check_user = fresh.sr_check_user;
        self.sr_check_password = fresh.sr_check_password;
        self.sr_check_database = fresh.sr_check_database;
        self.health_check_period = fresh.health_check_period;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[[backend]]
host = "db0.example"
port = 5432

[[backend]]
host = "db1.example"
port = 5432
data_directory = "/var/lib/pg/1"
always_primary = false
"#
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].host, "db0.example");
        assert_eq!(config.backends[1].data_directory, "/var/lib/pg/1");
        assert_eq!(config.mode, ClusterMode::StreamingReplication);
        assert_eq!(config.num_init_children, 32);
        assert_eq!(config.max_pool, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_mode_parsing() {
        let toml_content = format!("mode = \"raw\"\n{}", minimal_toml());
        let config: Config = toml::from_str(&toml_content).unwrap();
        assert!(config.mode.is_raw());
        assert!(!config.mode.supports_primary());
    }

    #[test]
    fn test_streaming_mode_flags() {
        assert!(ClusterMode::StreamingReplication.supports_primary());
        assert!(ClusterMode::LogicalReplication.supports_primary());
        assert!(!ClusterMode::NativeReplication.supports_primary());
        assert!(ClusterMode::StreamingReplication.is_streaming());
        assert!(!ClusterMode::LogicalReplication.is_streaming());
    }

    #[test]
    fn test_no_backends_rejected() {
        let config: Result<Config, _> = toml::from_str("backend = []\n");
        let config = config.unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_children_rejected() {
        let toml_content = format!("num_init_children = 0\n{}", minimal_toml());
        let config: Config = toml::from_str(&toml_content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_listen_backlog_cap() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.num_init_children = 4000;
        config.listen_backlog_multiplier = 100;
        assert_eq!(config.listen_backlog(), MAX_LISTEN_BACKLOG);

        config.num_init_children = 10;
        config.listen_backlog_multiplier = 2;
        assert_eq!(config.listen_backlog(), 20);
    }

    #[test]
    fn test_apply_reload_keeps_topology() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        let mut fresh = config.clone();
        fresh.failover_command = "/bin/true %d".to_string();
        fresh.num_init_children = 99;
        config.apply_reload(fresh);
        assert_eq!(config.failover_command, "/bin/true %d");
        assert_eq!(config.num_init_children, 32);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Config::load(&dir.path().join("nope.toml")).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("poolkeeper.toml");
        std::fs::write(&path, minimal_toml()).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.backends.len(), 2);
    }
}
