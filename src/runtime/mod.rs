//! # Runtime
//!
//! Process entry logic for the operator manager: configuration, logging, the
//! type registry, signal handling and the startup sequence.

pub mod error;
pub mod startup;

pub use error::StartupError;
pub use startup::{
    exit_code, exit_status, run_startup, Lifecycle, OperatorSteps, Phase, StartupSteps,
    HEALTH_CHECK, READY_CHECK,
};

use crate::config::{ConfigError, Configuration};
use crate::constants::SETUP_LOG;
use crate::manager::SignalHandler;
use crate::observability::{init_logging, LogLevel};
use crate::scheme::Scheme;
use std::process::ExitCode;
use tracing::{debug, error, info};

/// Run the operator until it is told to stop
pub async fn run() -> ExitCode {
    let lifecycle = Lifecycle::new();

    let config = match Configuration::load() {
        Ok(config) => config,
        Err(ConfigError::Args(e)) if !e.use_stderr() => {
            // --help and --version
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            init_logging(LogLevel::Info);
            error!(target: SETUP_LOG, error = %e, "invalid configuration");
            lifecycle.enter(Phase::Stopped);
            return ExitCode::from(1);
        }
    };

    init_logging(LogLevel::from_debug(config.debug));
    info!(
        target: SETUP_LOG,
        version = env!("CARGO_PKG_VERSION"),
        metrics_addr = %config.metrics_addr,
        health_addr = %config.health_addr,
        leader_election = config.enable_leader_election,
        webhooks_enabled = config.webhooks_enabled,
        "Starting secret-agent manager"
    );

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!(target: SETUP_LOG, "rustls crypto provider already installed");
    }

    let scheme = Scheme::for_operator();
    debug!(target: SETUP_LOG, kinds = ?scheme.kinds(), "Type registry populated");

    let signals = match SignalHandler::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!(target: SETUP_LOG, error = %e, "unable to install signal handlers");
            lifecycle.enter(Phase::Stopped);
            return ExitCode::from(1);
        }
    };

    let mut steps = OperatorSteps::new(scheme);
    let result = run_startup(&mut steps, &config, Box::pin(signals.shutdown_signal()), &lifecycle).await;
    match &result {
        Ok(()) => info!(target: SETUP_LOG, "Manager stopped"),
        Err(e) => error!(target: SETUP_LOG, component = e.component(), error = %e, "{}", e),
    }
    exit_code(&result)
}
