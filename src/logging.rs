//! Tracing bootstrap for hosts and tests

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize a compact stdout subscriber with env-filter support.
///
/// The engine only emits `tracing` events; hosts that want file logging or
/// JSON output should install their own subscriber instead of calling this.
///
/// # Log Targets
/// - `manager` - task fleet lifecycle
/// - `task` - per-task state transitions
/// - `task::chunk` - chunk dispatch, retries, dedup probes
/// - `limiter` - job pool scheduling
/// - `store` - resume store reads/writes
/// - `hasher` - digest progress
///
/// # Example
/// ```bash
/// RUST_LOG=task=debug,task::chunk=trace cargo test
/// ```
pub fn init() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().compact().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {e}"))?;

    Ok(())
}
