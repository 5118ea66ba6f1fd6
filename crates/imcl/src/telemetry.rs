//! Logging setup for hosts that do not install their own subscriber.

use crate::error::{ImclError, ImclResult};
use imclconf::TelemetryConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins over the configured level. Fails if a global subscriber is
/// already set.
pub fn init(config: &TelemetryConfig) -> ImclResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| ImclError::Logging(e.to_string()))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| ImclError::Logging(e.to_string()))?;

    tracing::info!("imcl logging at {}", config.log_level);
    Ok(())
}
