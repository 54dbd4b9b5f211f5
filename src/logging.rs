//! Tracing setup for the binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Levels accepted by `--log-level` and the settings file
pub const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn level_is_valid(level: &str) -> bool {
    LEVELS.iter().any(|l| l.eq_ignore_ascii_case(level))
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
