//! Controller configuration

use anyhow::{Context, Result};
use fabric_lib::{FatTree, SchedulerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix, e.g. `FABRIC_FAT_TREE_K=8`
pub const ENV_PREFIX: &str = "FABRIC";

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "FABRIC_CONFIG";

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Name reported in structured logs
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// Fat-Tree arity
    #[serde(default = "default_fat_tree_k")]
    pub fat_tree_k: u8,

    /// Seconds between scheduler ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_congestion_threshold")]
    pub congestion_threshold_bytes: u64,

    /// Remediate on every Nth tick
    #[serde(default = "default_remediation_every")]
    pub remediation_every: u64,

    #[serde(default = "default_flow_ttl")]
    pub flow_ttl: u32,

    #[serde(default = "default_route_idle_timeout")]
    pub route_idle_timeout_secs: u16,

    /// API server port for health, metrics and events
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON placement table shared with the service tooling
    #[serde(default = "default_placement_path")]
    pub placement_path: PathBuf,

    /// Optional JSON seed of the slice table
    #[serde(default)]
    pub slices_path: Option<PathBuf>,

    /// Capacity of the southbound command channel
    #[serde(default = "default_southbound_buffer")]
    pub southbound_buffer: usize,
}

fn default_controller_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "fabric-controller".to_string())
}

fn default_fat_tree_k() -> u8 {
    4
}

fn default_tick_interval() -> u64 {
    10
}

fn default_congestion_threshold() -> u64 {
    1000
}

fn default_remediation_every() -> u64 {
    4
}

fn default_flow_ttl() -> u32 {
    1
}

fn default_route_idle_timeout() -> u16 {
    30
}

fn default_api_port() -> u16 {
    8080
}

fn default_placement_path() -> PathBuf {
    PathBuf::from("services.json")
}

fn default_southbound_buffer() -> usize {
    1024
}

impl ControllerConfig {
    /// Load configuration from the optional `FABRIC_CONFIG` file and the
    /// `FABRIC_*` environment, the environment taking precedence.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::from_sources(file.as_deref(), ENV_PREFIX)
    }

    pub fn from_sources(file: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(env_prefix).try_parsing(true))
            .build()
            .context("Failed to read controller configuration")?;

        config
            .try_deserialize()
            .context("Invalid controller configuration")
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let fabric = FatTree::new(self.fat_tree_k)?;
        Ok(SchedulerConfig {
            fabric,
            tick_interval: Duration::from_secs(self.tick_interval_secs.max(1)),
            congestion_threshold_bytes: self.congestion_threshold_bytes,
            remediation_every: self.remediation_every.max(1),
            flow_ttl: self.flow_ttl.max(1),
            route_idle_timeout_secs: self.route_idle_timeout_secs,
        })
    }
}
