//! # Startup Errors
//!
//! Fatal errors of the startup sequence, one variant per step.

use super::startup::Phase;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("unable to start manager: {0:#}")]
    Manager(#[source] anyhow::Error),

    #[error("failed to init webhook certificates: {0:#}")]
    Certificates(#[source] anyhow::Error),

    #[error("unable to create controller {name}: {source:#}")]
    Controller {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("unable to create webhook {name}: {source:#}")]
    Webhook {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("unable to add ready check: {0:#}")]
    ReadyCheck(#[source] anyhow::Error),

    #[error("unable to add health check: {0:#}")]
    HealthCheck(#[source] anyhow::Error),

    #[error("problem running manager: {0:#}")]
    Run(#[source] anyhow::Error),

    #[error("termination signal received during {phase}, startup abandoned")]
    Interrupted { phase: Phase },
}

impl StartupError {
    /// Component whose step failed, for structured logs
    pub fn component(&self) -> &'static str {
        match self {
            Self::Manager(_) => "ManagerBootstrap",
            Self::Certificates(_) => "WebhookCertificateInitializer",
            Self::Controller { .. } => "ControllerRegistrar",
            Self::Webhook { .. } => "WebhookRegistrar",
            Self::ReadyCheck(_) | Self::HealthCheck(_) => "HealthProbeRegistrar",
            Self::Run(_) | Self::Interrupted { .. } => "SignalDrivenRunner",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_cause() {
        let err = StartupError::Controller {
            name: "SecretAgentConfiguration",
            source: anyhow::anyhow!("a runnable named \"SecretAgentConfiguration\" is already registered"),
        };
        assert_eq!(
            err.to_string(),
            "unable to create controller SecretAgentConfiguration: a runnable named \"SecretAgentConfiguration\" is already registered"
        );
        assert_eq!(err.component(), "ControllerRegistrar");
    }

    #[test]
    fn test_display_includes_context_chain() {
        let source = anyhow::anyhow!("connection refused").context("unable to reach the Kubernetes API server");
        let err = StartupError::Manager(source);
        assert_eq!(
            err.to_string(),
            "unable to start manager: unable to reach the Kubernetes API server: connection refused"
        );
    }
}
