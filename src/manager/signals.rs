//! # Termination Signals
//!
//! SIGTERM and SIGINT start a graceful shutdown. A second signal while shutting
//! down terminates the process immediately with status 1.

use crate::constants::SETUP_LOG;
use std::future::Future;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Installed signal handlers
#[cfg(unix)]
#[derive(Debug)]
pub struct SignalHandler {
    sigterm: Signal,
    sigint: Signal,
}

#[cfg(not(unix))]
#[derive(Debug)]
pub struct SignalHandler;

impl SignalHandler {
    /// Install the handlers now, so signals arriving during startup are not lost
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    /// Future resolving on the first signal
    ///
    /// After it resolves, a background task waits for a second signal and exits
    /// the process with status 1.
    pub fn shutdown_signal(self) -> impl Future<Output = ()> + Send + 'static {
        async move {
            let mut handler = self;
            let name = handler.recv().await;
            info!(target: SETUP_LOG, signal = name, "Received {}, shutting down gracefully", name);

            tokio::spawn(async move {
                let name = handler.recv().await;
                warn!(target: SETUP_LOG, signal = name, "Received second {}, exiting immediately", name);
                std::process::exit(1);
            });
        }
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "CTRL+C"
    }
}
