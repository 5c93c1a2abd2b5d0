//! # Startup Sequence
//!
//! Drives the operator from a parsed [`Configuration`] to a running manager and
//! back down to a stopped process.
//!
//! Every step returns its failure instead of exiting, so the whole sequence can
//! be exercised in tests with fake steps. The caller maps the final result to
//! the process exit status.

use super::error::StartupError;
use crate::config::Configuration;
use crate::constants::{CONTROLLER_NAME, SETUP_LOG};
use crate::controller::{SecretAgentConfigurationReconciler, SecretAgentConfigurationWebhook};
use crate::manager::{ping, Manager, ManagerOptions};
use crate::scheme::Scheme;
use crate::webhook::{init_webhook_certificates, CertificateRequest};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Name of the readiness check
pub const READY_CHECK: &str = "ready";
/// Name of the liveness check
pub const HEALTH_CHECK: &str = "healthy";

/// Lifecycle phase of the operator process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Registering,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "Initializing",
            Self::Registering => "Registering",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Phases the process went through, shared with the shutdown future
#[derive(Debug, Clone)]
pub struct Lifecycle {
    history: Arc<Mutex<Vec<Phase>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            history: Arc::new(Mutex::new(vec![Phase::Initializing])),
        }
    }

    /// Move to `phase`; entering the current phase again is a no-op
    pub fn enter(&self, phase: Phase) {
        let Ok(mut history) = self.history.lock() else {
            return;
        };
        if history.last() == Some(&phase) {
            return;
        }
        info!(target: SETUP_LOG, phase = %phase, "Entering phase {}", phase);
        history.push(phase);
    }

    pub fn current(&self) -> Phase {
        self.history
            .lock()
            .ok()
            .and_then(|history| history.last().copied())
            .unwrap_or(Phase::Stopped)
    }

    pub fn history(&self) -> Vec<Phase> {
        self.history.lock().map(|history| history.clone()).unwrap_or_default()
    }
}

/// The fallible steps of operator startup, in execution order
#[async_trait]
pub trait StartupSteps: Send {
    type Manager: Send;

    async fn build_manager(&mut self, config: &Configuration) -> anyhow::Result<Self::Manager>;

    async fn init_webhook_certificates(
        &mut self,
        manager: &mut Self::Manager,
        config: &Configuration,
    ) -> anyhow::Result<()>;

    fn register_controller(&mut self, manager: &mut Self::Manager, config: &Configuration) -> anyhow::Result<()>;

    fn register_webhook(&mut self, manager: &mut Self::Manager) -> anyhow::Result<()>;

    fn add_ready_check(&mut self, manager: &mut Self::Manager) -> anyhow::Result<()>;

    fn add_health_check(&mut self, manager: &mut Self::Manager) -> anyhow::Result<()>;

    /// Block until `shutdown` resolves or the manager fails
    async fn run(&mut self, manager: Self::Manager, shutdown: BoxFuture<'static, ()>) -> anyhow::Result<()>;
}

/// Startup steps against a real cluster
#[derive(Debug)]
pub struct OperatorSteps {
    scheme: Scheme,
}

impl OperatorSteps {
    pub fn new(scheme: Scheme) -> Self {
        Self { scheme }
    }
}

#[async_trait]
impl StartupSteps for OperatorSteps {
    type Manager = Manager;

    async fn build_manager(&mut self, config: &Configuration) -> anyhow::Result<Manager> {
        let scheme = std::mem::take(&mut self.scheme);
        Ok(Manager::new(ManagerOptions::from(config), scheme).await?)
    }

    async fn init_webhook_certificates(&mut self, manager: &mut Manager, config: &Configuration) -> anyhow::Result<()> {
        let client = manager.client().clone();
        let request = CertificateRequest::from_env(&config.cert_dir, manager.operator_namespace());
        let material = init_webhook_certificates(&client, request).await?;
        info!(
            target: SETUP_LOG,
            cert_dir = %config.cert_dir.display(),
            issued = material.issued,
            "Webhook certificates ready"
        );
        Ok(())
    }

    fn register_controller(&mut self, manager: &mut Manager, config: &Configuration) -> anyhow::Result<()> {
        let reconciler = SecretAgentConfigurationReconciler {
            client: manager.client().clone(),
            scheme: Arc::clone(manager.scheme()),
            cloud_secrets_namespace: config.cloud_secrets_namespace.clone(),
        };
        reconciler.setup_with_manager(manager)?;
        Ok(())
    }

    fn register_webhook(&mut self, manager: &mut Manager) -> anyhow::Result<()> {
        SecretAgentConfigurationWebhook.setup_webhook_with_manager(manager)?;
        Ok(())
    }

    fn add_ready_check(&mut self, manager: &mut Manager) -> anyhow::Result<()> {
        manager.add_readyz_check(READY_CHECK, ping())?;
        Ok(())
    }

    fn add_health_check(&mut self, manager: &mut Manager) -> anyhow::Result<()> {
        manager.add_healthz_check(HEALTH_CHECK, ping())?;
        Ok(())
    }

    async fn run(&mut self, manager: Manager, shutdown: BoxFuture<'static, ()>) -> anyhow::Result<()> {
        info!(target: SETUP_LOG, "starting manager");
        Ok(manager.start(shutdown).await?)
    }
}

/// Run the startup sequence to completion
///
/// Webhook certificate bootstrap and webhook registration are skipped when
/// webhooks are disabled. A `shutdown` that resolves before the manager is
/// running abandons the remaining steps with [`StartupError::Interrupted`].
/// The lifecycle ends in [`Phase::Stopped`] on every path.
pub async fn run_startup<S: StartupSteps>(
    steps: &mut S,
    config: &Configuration,
    shutdown: BoxFuture<'static, ()>,
    lifecycle: &Lifecycle,
) -> Result<(), StartupError> {
    let result = drive(steps, config, shutdown, lifecycle).await;
    lifecycle.enter(Phase::Stopped);
    result
}

async fn drive<S: StartupSteps>(
    steps: &mut S,
    config: &Configuration,
    shutdown: BoxFuture<'static, ()>,
    lifecycle: &Lifecycle,
) -> Result<(), StartupError> {
    let shutdown = shutdown.shared();

    // Steps that finish without waiting win over an already resolved shutdown
    let manager = tokio::select! {
        biased;
        prepared = prepare(steps, config, lifecycle) => prepared?,
        () = shutdown.clone() => {
            let phase = lifecycle.current();
            lifecycle.enter(Phase::ShuttingDown);
            return Err(StartupError::Interrupted { phase });
        }
    };

    let signalled = lifecycle.clone();
    let shutdown: BoxFuture<'static, ()> = Box::pin(async move {
        shutdown.await;
        signalled.enter(Phase::ShuttingDown);
    });

    lifecycle.enter(Phase::Running);
    steps.run(manager, shutdown).await.map_err(StartupError::Run)
}

/// Every step before the manager runs
async fn prepare<S: StartupSteps>(
    steps: &mut S,
    config: &Configuration,
    lifecycle: &Lifecycle,
) -> Result<S::Manager, StartupError> {
    lifecycle.enter(Phase::Initializing);
    let mut manager = steps.build_manager(config).await.map_err(StartupError::Manager)?;

    lifecycle.enter(Phase::Registering);
    if config.webhooks_enabled {
        steps
            .init_webhook_certificates(&mut manager, config)
            .await
            .map_err(StartupError::Certificates)?;
    } else {
        info!(target: SETUP_LOG, "Webhooks disabled, skipping certificate bootstrap");
    }

    steps
        .register_controller(&mut manager, config)
        .map_err(|source| StartupError::Controller {
            name: CONTROLLER_NAME,
            source,
        })?;

    if config.webhooks_enabled {
        steps
            .register_webhook(&mut manager)
            .map_err(|source| StartupError::Webhook {
                name: CONTROLLER_NAME,
                source,
            })?;
    } else {
        info!(target: SETUP_LOG, "Webhooks disabled, skipping webhook registration");
    }

    steps.add_ready_check(&mut manager).map_err(StartupError::ReadyCheck)?;
    steps.add_health_check(&mut manager).map_err(StartupError::HealthCheck)?;
    Ok(manager)
}

/// Process exit status for a startup result: 0 after a graceful shutdown, 1 otherwise
pub fn exit_status(result: &Result<(), StartupError>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

pub fn exit_code(result: &Result<(), StartupError>) -> ExitCode {
    ExitCode::from(exit_status(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_ignores_repeated_phase() {
        let lifecycle = Lifecycle::new();
        lifecycle.enter(Phase::Initializing);
        lifecycle.enter(Phase::Registering);
        lifecycle.enter(Phase::Registering);
        assert_eq!(lifecycle.history(), vec![Phase::Initializing, Phase::Registering]);
        assert_eq!(lifecycle.current(), Phase::Registering);
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(&Ok(())), 0);
        assert_eq!(exit_status(&Err(StartupError::Run(anyhow::anyhow!("lost leadership")))), 1);
    }
}
