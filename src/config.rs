//! Middleware configuration parsed from the `MISHARD_CONFIG` env var.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{ShardError, ShardResult};
use crate::meta::MetricKind;

/// Name of the environment variable holding the JSON configuration.
pub const CONFIG_ENV: &str = "MISHARD_CONFIG";

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:19530";
pub const DEFAULT_POOL_SIZE: usize = 100;
pub const DEFAULT_POOL_RECYCLE_SECS: u64 = 5;
pub const DEFAULT_POOL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_TOPK: i64 = 2048;
pub const DEFAULT_MAX_NPROBE: i64 = 2048;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Top-level middleware configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MishardConfig {
    /// Address the gRPC server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Backend endpoints used for administrative pass-through operations.
    #[serde(default)]
    pub backends: Vec<String>,
    /// Worker-pool parallelism for sub-query fan-out. Defaults to the
    /// number of logical CPUs.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Maximum backend connections per address.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Seconds an idle connection may rest before it is recycled.
    #[serde(default = "default_pool_recycle")]
    pub pool_recycle: u64,
    /// Seconds a caller may wait for a connection before `Unavailable`.
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout: u64,
    /// Upper bound for the `topk` search parameter.
    #[serde(default = "default_max_topk")]
    pub max_topk: i64,
    /// Upper bound for the `nprobe` search parameter.
    #[serde(default = "default_max_nprobe")]
    pub max_nprobe: i64,
    /// Whether the binary installs a tracing subscriber at startup.
    #[serde(default)]
    pub tracing_enabled: bool,
    /// Static shard topology backing the bundled metadata store.
    #[serde(default)]
    pub tables: HashMap<String, TableConfig>,
}

/// Static metadata for one logical table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub dimension: i64,
    #[serde(default = "default_index_file_size")]
    pub index_file_size: i64,
    pub metric: MetricKind,
    #[serde(default)]
    pub shards: Vec<ShardConfig>,
}

/// One file shard: which backend owns it and the calendar date its vectors
/// were written under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub address: String,
    pub file_id: String,
    /// `YYYY-MM-DD`; used by time-range restricted lookups.
    pub date: chrono::NaiveDate,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_max_workers() -> usize {
    num_cpus::get()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_pool_recycle() -> u64 {
    DEFAULT_POOL_RECYCLE_SECS
}

fn default_pool_timeout() -> u64 {
    DEFAULT_POOL_TIMEOUT_SECS
}

fn default_max_topk() -> i64 {
    DEFAULT_MAX_TOPK
}

fn default_max_nprobe() -> i64 {
    DEFAULT_MAX_NPROBE
}

fn default_index_file_size() -> i64 {
    1024
}

impl Default for MishardConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backends: Vec::new(),
            max_workers: default_max_workers(),
            pool_size: default_pool_size(),
            pool_recycle: default_pool_recycle(),
            pool_timeout: default_pool_timeout(),
            max_topk: default_max_topk(),
            max_nprobe: default_max_nprobe(),
            tracing_enabled: false,
            tables: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

impl MishardConfig {
    /// Read `MISHARD_CONFIG` from the environment, parse it as JSON, and
    /// validate the result.
    pub fn from_env() -> ShardResult<Self> {
        let raw = env::var(CONFIG_ENV).map_err(|_| {
            ShardError::invalid_argument(format!("{CONFIG_ENV} environment variable is not set"))
        })?;
        Self::from_json(&raw)
    }

    /// Parse a configuration from a raw JSON string and validate it.
    pub fn from_json(json: &str) -> ShardResult<Self> {
        let config: MishardConfig = serde_json::from_str(json).map_err(|e| {
            ShardError::invalid_argument(format!("failed to parse {CONFIG_ENV} JSON: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the parsed configuration, returning the first problem found.
    pub fn validate(&self) -> ShardResult<()> {
        self.listen_addr.parse::<SocketAddr>().map_err(|e| {
            ShardError::invalid_argument(format!(
                "listen_addr '{}' is not a valid socket address: {e}",
                self.listen_addr
            ))
        })?;

        if self.max_workers == 0 {
            return Err(ShardError::invalid_argument("max_workers must be positive"));
        }
        if self.pool_size == 0 {
            return Err(ShardError::invalid_argument("pool_size must be positive"));
        }
        if self.max_topk <= 0 {
            return Err(ShardError::invalid_argument("max_topk must be positive"));
        }
        if self.max_nprobe <= 0 {
            return Err(ShardError::invalid_argument("max_nprobe must be positive"));
        }

        for backend in &self.backends {
            if backend.trim().is_empty() {
                return Err(ShardError::invalid_argument("backend address must be non-empty"));
            }
        }

        for (name, table) in &self.tables {
            if table.dimension <= 0 {
                return Err(ShardError::invalid_argument(format!(
                    "table '{name}': dimension must be positive"
                )));
            }
            // A file owned by two addresses would break routing-plan
            // disjointness at the source.
            let mut seen_files = std::collections::HashSet::new();
            for shard in &table.shards {
                if shard.address.trim().is_empty() {
                    return Err(ShardError::invalid_argument(format!(
                        "table '{name}': shard '{}' has an empty address",
                        shard.file_id
                    )));
                }
                if !seen_files.insert(shard.file_id.as_str()) {
                    return Err(ShardError::invalid_argument(format!(
                        "table '{name}': file id '{}' is mapped more than once",
                        shard.file_id
                    )));
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
