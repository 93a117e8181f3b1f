use tracing_subscriber::{fmt, EnvFilter};

use crate::core::errors::{ChainError, Result};

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (e.g. "info" or "chainwatch=debug").
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| ChainError::configuration(format!("invalid log filter: {}", e)))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| ChainError::Other(anyhow::anyhow!("tracing already initialised: {}", e)))
}
