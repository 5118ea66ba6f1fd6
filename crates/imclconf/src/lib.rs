//! Configuration loading for the IMCL control plane.
//!
//! Every bound the control plane enforces lives here so that hosts can tune
//! them without recompiling: queue depths, the recurring-buffer retry guard,
//! the per-poll drain cap, low-power pool sizing, and the thresholds that
//! decide whether a container offloads graph commands to a worker pool.
//!
//! # Usage
//!
//! ```rust,no_run
//! use imclconf::ImclConfig;
//!
//! let config = ImclConfig::load().expect("Failed to load config");
//! println!("drain limit: {}", config.limits.drain_limit);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/imcl/config.toml` (system)
//! 2. `~/.config/imcl/config.toml` (user)
//! 3. `./imcl.toml` (local override)
//! 4. Environment variables (`IMCL_*`)
//!
//! # Example Config
//!
//! ```toml
//! [limits]
//! queue_depth = 16
//! recurring_retry_limit = 1000
//! drain_limit = 50
//!
//! [offload]
//! stack_threshold_bytes = 16384
//! frame_threshold_us = 1000
//! worker_threads = 1
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod limits;
pub mod loader;

pub use limits::{LimitsConfig, OffloadConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value in {path}: {field} {reason}")]
    Invalid {
        path: PathBuf,
        field: &'static str,
        reason: &'static str,
    },

    #[error("Invalid value in environment variable {var}: {field} {reason}")]
    InvalidEnv {
        var: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

/// Complete control-plane configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImclConfig {
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub offload: OffloadConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl ImclConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/imcl/config.toml`
    /// 3. `~/.config/imcl/config.toml`
    /// 4. `./imcl.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` replacing the local override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = ImclConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::overlay_env(&mut config, &mut sources)?;

        Ok((config, sources))
    }

    /// Reject values the control plane cannot run with.
    pub fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        self.check().map_err(|(field, reason)| ConfigError::Invalid {
            path: path.to_path_buf(),
            field,
            reason,
        })
    }

    /// First field that is out of range, with why.
    pub(crate) fn check(&self) -> Result<(), (&'static str, &'static str)> {
        const AT_LEAST_ONE: &str = "must be at least 1";
        if self.limits.queue_depth == 0 {
            return Err(("limits.queue_depth", AT_LEAST_ONE));
        }
        if self.limits.intra_queue_depth == 0 {
            return Err(("limits.intra_queue_depth", AT_LEAST_ONE));
        }
        if self.limits.drain_limit == 0 {
            return Err(("limits.drain_limit", AT_LEAST_ONE));
        }
        if self.offload.worker_threads == 0 {
            return Err(("offload.worker_threads", AT_LEAST_ONE));
        }
        if self.offload.job_queue_depth == 0 {
            return Err(("offload.job_queue_depth", AT_LEAST_ONE));
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# IMCL Configuration\n\n");

        output.push_str("[limits]\n");
        output.push_str(&format!("queue_depth = {}\n", self.limits.queue_depth));
        output.push_str(&format!("intra_queue_depth = {}\n", self.limits.intra_queue_depth));
        output.push_str(&format!("intents_per_port = {}\n", self.limits.intents_per_port));
        output.push_str(&format!(
            "recurring_retry_limit = {}\n",
            self.limits.recurring_retry_limit
        ));
        output.push_str(&format!("drain_limit = {}\n", self.limits.drain_limit));
        output.push_str(&format!("general_pool_bytes = {}\n", self.limits.general_pool_bytes));
        output.push_str(&format!("island_pool_nodes = {}\n", self.limits.island_pool_nodes));
        output.push_str(&format!("island_node_bytes = {}\n", self.limits.island_node_bytes));

        output.push_str("\n[offload]\n");
        output.push_str(&format!(
            "stack_threshold_bytes = {}\n",
            self.offload.stack_threshold_bytes
        ));
        output.push_str(&format!("frame_threshold_us = {}\n", self.offload.frame_threshold_us));
        output.push_str(&format!("worker_threads = {}\n", self.offload.worker_threads));
        output.push_str(&format!("worker_stack_bytes = {}\n", self.offload.worker_stack_bytes));
        output.push_str(&format!("job_queue_depth = {}\n", self.offload.job_queue_depth));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output
    }
}
