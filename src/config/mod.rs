//! # Configuration
//!
//! `aerofn.json`, loaded once at startup. Every field has a default so an
//! empty object is a valid configuration.

mod errors;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::replication::CoordinatorConfig;
use crate::scheduler::SchedulerConfig;

pub use errors::{ConfigError, ConfigResult};

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Largest accepted request body
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Allowed CORS origins; empty allows any
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
            body_limit_bytes: default_body_limit(),
            cors_origins: Vec::new(),
        }
    }
}

impl HttpConfig {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Worker protocol listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_address")]
    pub address: String,
}

fn default_rpc_address() -> String {
    "127.0.0.1:7070".to_string()
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            address: default_rpc_address(),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Worker executable; the running binary when unset
    #[serde(default)]
    pub worker_program: Option<PathBuf>,

    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,

    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// How long a worker's pop waits for its event
    #[serde(default = "default_pop_wait_ms")]
    pub pop_wait_ms: u64,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_worker_args() -> Vec<String> {
    vec!["worker".to_string()]
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_pop_wait_ms() -> u64 {
    5000
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            worker_program: None,
            worker_args: default_worker_args(),
            default_timeout_secs: default_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            pop_wait_ms: default_pop_wait_ms(),
        }
    }
}

/// Ownership coordination between replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Generated at startup when unset
    #[serde(default)]
    pub replica_id: Option<String>,

    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_lease_ttl_secs() -> u64 {
    30
}

fn default_wait_timeout_secs() -> u64 {
    10
}

fn default_retention_secs() -> u64 {
    600
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_id: None,
            lease_ttl_secs: default_lease_ttl_secs(),
            wait_timeout_secs: default_wait_timeout_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

/// Definition polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// In-memory change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Collections that can be watched before any change arrives
    #[serde(default)]
    pub collections: Vec<String>,

    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

fn default_feed_capacity() -> usize {
    1024
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            feed_capacity: default_feed_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one sub-directory per function
    #[serde(default = "default_functions_root")]
    pub functions_root: PathBuf,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub scheduler: WorkerPoolConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_functions_root() -> PathBuf {
    PathBuf::from("./functions")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            functions_root: default_functions_root(),
            http: HttpConfig::default(),
            rpc: RpcConfig::default(),
            scheduler: WorkerPoolConfig::default(),
            replication: ReplicationConfig::default(),
            engine: EngineConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrency must be > 0".into(),
            ));
        }
        if self.rpc.address.trim().is_empty() {
            return Err(ConfigError::Invalid("rpc.address must not be empty".into()));
        }
        if self.http.host.trim().is_empty() {
            return Err(ConfigError::Invalid("http.host must not be empty".into()));
        }
        if self.functions_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("functions_root must not be empty".into()));
        }
        if self.scheduler.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.default_timeout_secs must be > 0".into(),
            ));
        }
        if self.replication.lease_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "replication.lease_ttl_secs must be > 0".into(),
            ));
        }
        if self.replication.retention_secs < self.replication.lease_ttl_secs {
            return Err(ConfigError::Invalid(format!(
                "replication.retention_secs ({}) must not be shorter than lease_ttl_secs ({})",
                self.replication.retention_secs, self.replication.lease_ttl_secs
            )));
        }
        if self.engine.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "engine.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.database.feed_capacity == 0 {
            return Err(ConfigError::Invalid(
                "database.feed_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: self.scheduler.max_concurrency,
            rpc_address: self.rpc.address.clone(),
            default_timeout: Duration::from_secs(self.scheduler.default_timeout_secs),
            kill_grace: Duration::from_secs(self.scheduler.kill_grace_secs),
        }
    }

    pub fn coordinator_config(&self, replica_id: impl Into<String>) -> CoordinatorConfig {
        CoordinatorConfig {
            replica_id: replica_id.into(),
            lease_ttl: Duration::from_secs(self.replication.lease_ttl_secs),
            wait_timeout: Duration::from_secs(self.replication.wait_timeout_secs),
            retention: Duration::from_secs(self.replication.retention_secs),
        }
    }

    pub fn pop_wait(&self) -> Duration {
        Duration::from_millis(self.scheduler.pop_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.engine.poll_interval_ms)
    }
}
