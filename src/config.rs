//! Panel configuration: tunable intervals, thresholds, and concurrency
//! caps, loaded from an optional TOML file and overridable from the CLI.
//! Every field defaults to the value spec'd for its subsystem so the
//! panel runs sensibly with no config file at all.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "panel-core", about = "Proxy fleet control plane")]
pub struct Cli {
    /// Path to a TOML config file. Missing file falls back to defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to bind the admin HTTP surface on.
    #[arg(long)]
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub listen_addr: String,

    pub auth_max_failures: u32,
    pub auth_failure_window_secs: u64,
    pub auth_block_duration_secs: u64,

    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub health_max_concurrent_checks: usize,
    pub health_unhealthy_threshold: u32,
    pub health_healthy_threshold: u32,
    pub health_retention_days: i64,

    pub failover_max_concurrent_migrations: usize,
    pub failover_migration_timeout_secs: u64,
    pub failover_prefer_same_group: bool,
    pub failover_allow_cross_group: bool,

    pub sync_max_retries: u32,
    pub sync_retry_delay_secs: u64,
    pub sync_timeout_secs: u64,
    pub sync_validate: bool,

    pub default_node_port: u16,
    pub default_node_weight: u8,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),

            auth_max_failures: 5,
            auth_failure_window_secs: 5 * 60,
            auth_block_duration_secs: 15 * 60,

            health_interval_secs: 10,
            health_timeout_secs: 5,
            health_max_concurrent_checks: 10,
            health_unhealthy_threshold: 3,
            health_healthy_threshold: 2,
            health_retention_days: 7,

            failover_max_concurrent_migrations: 10,
            failover_migration_timeout_secs: 10,
            failover_prefer_same_group: true,
            failover_allow_cross_group: true,

            sync_max_retries: 3,
            sync_retry_delay_secs: 2,
            sync_timeout_secs: 10,
            sync_validate: true,

            default_node_port: 18443,
            default_node_weight: 1,
        }
    }
}

impl PanelConfig {
    /// Loads from `path` if given and present, falling back to defaults
    /// for any field the file omits. A missing path is not an error.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::warn!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let cfg: PanelConfig = toml::from_str(&text)?;
        Ok(cfg)
    }

    pub fn auth_failure_window(&self) -> Duration {
        Duration::from_secs(self.auth_failure_window_secs)
    }

    pub fn auth_block_duration(&self) -> Duration {
        Duration::from_secs(self.auth_block_duration_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn failover_migration_timeout(&self) -> Duration {
        Duration::from_secs(self.failover_migration_timeout_secs)
    }

    pub fn sync_retry_delay(&self) -> Duration {
        Duration::from_secs(self.sync_retry_delay_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}
