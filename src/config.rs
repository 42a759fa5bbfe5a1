//! Control plane configuration.
//!
//! Every field has a default, so an empty YAML document is a valid
//! configuration:
//!
//! ```yaml
//! k: 20
//! search_concurrency: 5
//! lookup_concurrency: 10
//! encode_keys: true
//! refresh_accuracy_divisor: 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Length in bytes of every node id and encoded key.
    pub node_id_len: usize,
    /// Bucket size and default replication factor.
    pub k: usize,
    /// Bits per routing step (passed through to routers that care).
    pub b: usize,
    pub max_rep_per_node: usize,
    /// Probe parallelism of a single lookup.
    pub search_concurrency: usize,
    /// Capacity of the internal lookup and put pools.
    pub lookup_concurrency: usize,
    pub cache_at_closest_n: usize,
    /// Hash application keys down to the id length instead of truncating.
    pub encode_keys: bool,
    pub enable_random_poking: bool,
    /// Refresh lookups run with `k / refresh_accuracy_divisor` accuracy.
    pub refresh_accuracy_divisor: usize,
    pub external_lookup_pool: usize,
    pub external_put_pool: usize,
    pub external_put_pool_sleeping: usize,
    /// Stores widen their acceptance window by half on large networks.
    pub large_network: bool,
    pub integration_wait_ms: u64,
    pub random_query_period_ms: u64,
    pub refresh_lookup_timeout_ms: u64,
    pub maintenance_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            node_id_len: 20,
            k: 20,
            b: 4,
            max_rep_per_node: 1,
            search_concurrency: 5,
            lookup_concurrency: 10,
            cache_at_closest_n: 1,
            encode_keys: true,
            enable_random_poking: true,
            refresh_accuracy_divisor: 2,
            external_lookup_pool: 16,
            external_put_pool: 8,
            external_put_pool_sleeping: 4,
            large_network: false,
            integration_wait_ms: 15_000,
            random_query_period_ms: 5 * 60 * 1000,
            refresh_lookup_timeout_ms: 5 * 60 * 1000,
            maintenance_interval_ms: 60_000,
        }
    }
}

impl ControlConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ControlConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, usize); 8] = [
            ("node_id_len", self.node_id_len),
            ("k", self.k),
            ("search_concurrency", self.search_concurrency),
            ("lookup_concurrency", self.lookup_concurrency),
            ("refresh_accuracy_divisor", self.refresh_accuracy_divisor),
            ("external_lookup_pool", self.external_lookup_pool),
            ("external_put_pool", self.external_put_pool),
            ("external_put_pool_sleeping", self.external_put_pool_sleeping),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }

    /// Accuracy used by router-driven refresh lookups.
    pub fn refresh_accuracy(&self) -> usize {
        (self.k / self.refresh_accuracy_divisor.max(1)).max(1)
    }

    pub fn integration_wait(&self) -> Duration {
        Duration::from_millis(self.integration_wait_ms)
    }

    pub fn random_query_period(&self) -> Duration {
        Duration::from_millis(self.random_query_period_ms)
    }

    pub fn refresh_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_lookup_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}
