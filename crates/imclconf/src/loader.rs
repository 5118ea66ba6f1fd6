//! Config file discovery, loading, and environment variable overlay.

use crate::limits::{LimitsConfig, OffloadConfig, TelemetryConfig};
use crate::{ConfigError, ImclConfig};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with an explicit override path.
///
/// If `explicit` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/explicit).
pub fn discover_config_files_with_override(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/imcl/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("imcl/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = explicit {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("imcl.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<ImclConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from a TOML string. Missing sections and fields take defaults.
pub(crate) fn parse_toml(contents: &str, path: &Path) -> Result<ImclConfig, ConfigError> {
    let config: ImclConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    config.validate(path)?;
    Ok(config)
}

/// Keep `overlay` where it differs from the compiled default, else `base`.
fn pick<T: PartialEq>(base: T, overlay: T, default: &T) -> T {
    if overlay != *default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence field by field.
pub fn merge_configs(base: ImclConfig, overlay: ImclConfig) -> ImclConfig {
    let dl = LimitsConfig::default();
    let dofl = OffloadConfig::default();
    let dt = TelemetryConfig::default();
    let (bl, ol) = (base.limits, overlay.limits);
    let (bo, oo) = (base.offload, overlay.offload);

    ImclConfig {
        limits: LimitsConfig {
            queue_depth: pick(bl.queue_depth, ol.queue_depth, &dl.queue_depth),
            intra_queue_depth: pick(bl.intra_queue_depth, ol.intra_queue_depth, &dl.intra_queue_depth),
            intents_per_port: pick(bl.intents_per_port, ol.intents_per_port, &dl.intents_per_port),
            recurring_retry_limit: pick(
                bl.recurring_retry_limit,
                ol.recurring_retry_limit,
                &dl.recurring_retry_limit,
            ),
            drain_limit: pick(bl.drain_limit, ol.drain_limit, &dl.drain_limit),
            general_pool_bytes: pick(bl.general_pool_bytes, ol.general_pool_bytes, &dl.general_pool_bytes),
            island_pool_nodes: pick(bl.island_pool_nodes, ol.island_pool_nodes, &dl.island_pool_nodes),
            island_node_bytes: pick(bl.island_node_bytes, ol.island_node_bytes, &dl.island_node_bytes),
        },
        offload: OffloadConfig {
            stack_threshold_bytes: pick(
                bo.stack_threshold_bytes,
                oo.stack_threshold_bytes,
                &dofl.stack_threshold_bytes,
            ),
            frame_threshold_us: pick(bo.frame_threshold_us, oo.frame_threshold_us, &dofl.frame_threshold_us),
            worker_threads: pick(bo.worker_threads, oo.worker_threads, &dofl.worker_threads),
            worker_stack_bytes: pick(bo.worker_stack_bytes, oo.worker_stack_bytes, &dofl.worker_stack_bytes),
            job_queue_depth: pick(bo.job_queue_depth, oo.job_queue_depth, &dofl.job_queue_depth),
        },
        telemetry: TelemetryConfig {
            log_level: pick(base.telemetry.log_level, overlay.telemetry.log_level, &dt.log_level),
        },
    }
}

/// Config fields an environment variable can set, by variable name.
const ENV_FIELDS: &[(&str, &str)] = &[
    ("IMCL_QUEUE_DEPTH", "limits.queue_depth"),
    ("IMCL_INTRA_QUEUE_DEPTH", "limits.intra_queue_depth"),
    ("IMCL_INTENTS_PER_PORT", "limits.intents_per_port"),
    ("IMCL_RECURRING_RETRY_LIMIT", "limits.recurring_retry_limit"),
    ("IMCL_DRAIN_LIMIT", "limits.drain_limit"),
    ("IMCL_OFFLOAD_STACK_THRESHOLD", "offload.stack_threshold_bytes"),
    ("IMCL_OFFLOAD_FRAME_THRESHOLD_US", "offload.frame_threshold_us"),
    ("IMCL_WORKER_THREADS", "offload.worker_threads"),
    ("IMCL_LOG_LEVEL", "telemetry.log_level"),
];

fn env_parse<T: FromStr>(
    name: &str,
    target: &mut T,
    sources: &mut ConfigSources,
    lookup: &impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup(name) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
            sources.env_overrides.push(name.to_string());
        }
    }
}

/// Apply environment variable overrides to config.
fn apply_overrides_from(
    config: &mut ImclConfig,
    sources: &mut ConfigSources,
    lookup: &impl Fn(&str) -> Option<String>,
) {
    let limits = &mut config.limits;
    env_parse("IMCL_QUEUE_DEPTH", &mut limits.queue_depth, sources, lookup);
    env_parse("IMCL_INTRA_QUEUE_DEPTH", &mut limits.intra_queue_depth, sources, lookup);
    env_parse("IMCL_INTENTS_PER_PORT", &mut limits.intents_per_port, sources, lookup);
    env_parse("IMCL_RECURRING_RETRY_LIMIT", &mut limits.recurring_retry_limit, sources, lookup);
    env_parse("IMCL_DRAIN_LIMIT", &mut limits.drain_limit, sources, lookup);

    let offload = &mut config.offload;
    env_parse("IMCL_OFFLOAD_STACK_THRESHOLD", &mut offload.stack_threshold_bytes, sources, lookup);
    env_parse("IMCL_OFFLOAD_FRAME_THRESHOLD_US", &mut offload.frame_threshold_us, sources, lookup);
    env_parse("IMCL_WORKER_THREADS", &mut offload.worker_threads, sources, lookup);

    if let Some(v) = lookup("IMCL_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("IMCL_LOG_LEVEL".to_string());
    }
}

/// Overlay the process environment and check the result.
pub(crate) fn overlay_env(config: &mut ImclConfig, sources: &mut ConfigSources) -> Result<(), ConfigError> {
    overlay_env_from(config, sources, &|name: &str| env::var(name).ok())
}

fn overlay_env_from(
    config: &mut ImclConfig,
    sources: &mut ConfigSources,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    apply_overrides_from(config, sources, lookup);
    let Err((field, reason)) = config.check() else {
        return Ok(());
    };
    // files were checked as they loaded, so the bad value came from a variable
    let var = ENV_FIELDS
        .iter()
        .find(|(_, f)| *f == field)
        .map(|(var, _)| *var)
        .unwrap_or("IMCL_*");
    Err(ConfigError::InvalidEnv { var, field, reason })
}
