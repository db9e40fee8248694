//! Tracing setup shared by every subcommand.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Builds the filter: `RUST_LOG` wins, then `level` (from `LOG_LEVEL` or
/// `--log-level`), then `info`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. The `audit` target carries audit events
/// and is always shown at `info` unless `RUST_LOG` says otherwise.
pub fn init(level: &str) -> anyhow::Result<()> {
    let mut filter = filter(level);
    if std::env::var_os("RUST_LOG").is_none() {
        filter = filter.add_directive("audit=info".parse()?);
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    Ok(())
}

