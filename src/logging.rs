//! Logging setup.
//!
//! All logs go to **stderr**; stdout belongs to the host protocol.
//!
//! Filtering follows `RUST_LOG` when set, otherwise the provider block's
//! `log_level`, otherwise `info`. Lock acquisition and release log at
//! `debug`, lifecycle start/finish at `info`, tombstoning at `warn`, and SDK
//! failures at `error`.
//!
//! # Example
//!
//! ```ignore
//! use vcd_provider::{config::ProviderConfig, logging::init_logging_with_config};
//!
//! let config = ProviderConfig::from_env()?;
//! init_logging_with_config(&config);
//! tracing::info!("provider starting");
//! ```
//!
//! ```bash
//! # Trace lock traffic only
//! RUST_LOG=info,vcd_provider::mutex=debug ./terraform-provider-vcd
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ProviderConfig;

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn try_install(default_level: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .try_init()
        .is_ok()
}

/// Install the stderr subscriber at `info` unless `RUST_LOG` says otherwise.
///
/// Returns false if a global subscriber was already set.
pub fn init_logging() -> bool {
    try_install("info")
}

/// Install the stderr subscriber with a custom default level.
///
/// Returns false if a global subscriber was already set.
pub fn init_logging_with_default(default_level: &str) -> bool {
    try_install(default_level)
}

/// Install the stderr subscriber using the provider block's `log_level`.
pub fn init_logging_with_config(config: &ProviderConfig) -> bool {
    try_install(config.log_level())
}

#[cfg(test)]
mod tests {
    // The global subscriber can only be set once per process, so only the
    // filter construction is tested here.

    use super::*;

    #[test]
    fn test_env_filter_parsing() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("vcd_provider=debug").is_ok());
        assert!(EnvFilter::try_new("warn,vcd_provider::mutex=debug").is_ok());
    }

    #[test]
    fn test_invalid_default_level_falls_back() {
        let _ = filter("not a [valid filter");
    }
}
