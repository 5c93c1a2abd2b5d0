//! # Logging
//!
//! Process-wide structured logging built on `tracing-subscriber`.
//!
//! The verbosity is chosen from the `--debug` flag, with `RUST_LOG` directives
//! layered on top. Components log under their own target (`setup`, `manager`,
//! `controllers.SecretAgentConfiguration`, ...), so a line can always be traced
//! back to the component that emitted it.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Discrete verbosity levels selectable at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Debug,
}

impl LogLevel {
    pub fn from_debug(debug: bool) -> Self {
        if debug {
            Self::Debug
        } else {
            Self::Info
        }
    }

    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
        }
    }
}

/// Install the process-wide subscriber; returns `false` when one was already installed
pub fn init_logging(level: LogLevel) -> bool {
    let installed = tracing_subscriber::registry()
        .with(build_filter(level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(false),
        )
        .try_init();

    if installed.is_ok() {
        tracing::debug!(target: crate::constants::SETUP_LOG, level = ?level, "logging initialized");
    }
    installed.is_ok()
}

/// Default level from the flag, with `RUST_LOG` directives layered on top
fn build_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.as_level_filter().into())
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_debug_flag() {
        assert_eq!(LogLevel::from_debug(true), LogLevel::Debug);
        assert_eq!(LogLevel::from_debug(false), LogLevel::Info);
        assert_eq!(LogLevel::Debug.as_level_filter(), LevelFilter::DEBUG);
        assert_eq!(LogLevel::Info.as_level_filter(), LevelFilter::INFO);
    }

    #[test]
    fn test_second_install_is_ignored() {
        init_logging(LogLevel::Info);
        assert!(!init_logging(LogLevel::Debug));
    }
}
