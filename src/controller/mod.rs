//! # Controller
//!
//! The `SecretAgentConfiguration` controller and its admission webhooks.
//!
//! - [`reconciler`] binds the reconciliation loop to the manager
//! - [`error_policy`] requeues failed objects with per-object Fibonacci backoff
//! - [`validation`] binds the validating and defaulting webhooks

pub mod backoff;
pub mod error_policy;
pub mod reconciler;
pub mod validation;

pub use reconciler::{
    reconcile, resolve_cloud_secrets_namespace, Context, ControllerError, ReconcileError,
    SecretAgentConfigurationReconciler,
};
pub use validation::{
    SecretAgentConfigurationDefaulter, SecretAgentConfigurationValidator,
    SecretAgentConfigurationWebhook, MUTATE_PATH, VALIDATE_PATH,
};
