//! # Reconciler
//!
//! Reconciliation of `SecretAgentConfiguration` resources.
//!
//! Each pass resolves the namespace holding the cloud credentials, checks which
//! of the declared secrets already exist as Kubernetes Secrets in the resource's
//! namespace, and publishes the result in `.status`. A change to a Secret
//! triggers every configuration in its namespace that declares it by name.

use super::backoff::BackoffTracker;
use super::error_policy::handle_reconciliation_error;
use crate::constants::{CONTROLLER_LOG, CONTROLLER_NAME, DEFAULT_RECONCILE_REQUEUE_SECS, FIELD_MANAGER};
use crate::crd::{Condition, SecretAgentConfiguration, SecretAgentConfigurationStatus};
use crate::manager::{Manager, ManagerError, Runnable};
use crate::observability::metrics;
use crate::scheme::{Scheme, SchemeError};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registration failures
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Scheme(#[from] SchemeError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Failures of a single reconciliation; retried by the error policy
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0} has no namespace")]
    MissingNamespace(String),
}

/// Shared state of the running controller
pub struct Context {
    pub client: Client,
    /// Namespace holding the cloud credentials secrets
    pub cloud_secrets_namespace: String,
    pub backoff: BackoffTracker,
}

// `kube::Client` does not implement `Debug`
impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cloud_secrets_namespace", &self.cloud_secrets_namespace)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Effective cloud secrets namespace: the override, or the operator's own namespace
pub fn resolve_cloud_secrets_namespace(override_namespace: Option<&str>, operator_namespace: &str) -> String {
    override_namespace
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .unwrap_or(operator_namespace)
        .to_string()
}

/// Binds the reconciliation loop to a manager
#[derive(Clone)]
pub struct SecretAgentConfigurationReconciler {
    pub client: Client,
    pub scheme: Arc<Scheme>,
    /// `None` falls back to the operator namespace
    pub cloud_secrets_namespace: Option<String>,
}

impl std::fmt::Debug for SecretAgentConfigurationReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretAgentConfigurationReconciler")
            .field("cloud_secrets_namespace", &self.cloud_secrets_namespace)
            .finish_non_exhaustive()
    }
}

impl SecretAgentConfigurationReconciler {
    /// Register the controller with the manager
    ///
    /// Fails when the scheme does not know the watched kinds or when a
    /// controller with the same name is already registered.
    pub fn setup_with_manager(self, mgr: &mut Manager) -> Result<(), ControllerError> {
        self.scheme.ensure_registered::<SecretAgentConfiguration>()?;
        self.scheme.ensure_registered::<Secret>()?;

        let cloud_secrets_namespace =
            resolve_cloud_secrets_namespace(self.cloud_secrets_namespace.as_deref(), mgr.operator_namespace());
        info!(
            target: CONTROLLER_LOG,
            cloud_secrets_namespace = %cloud_secrets_namespace,
            "Registering controller"
        );

        mgr.add(Box::new(ControllerRunnable {
            ctx: Arc::new(Context {
                client: self.client,
                cloud_secrets_namespace,
                backoff: BackoffTracker::default(),
            }),
        }))?;
        Ok(())
    }
}

struct ControllerRunnable {
    ctx: Arc<Context>,
}

#[async_trait]
impl Runnable for ControllerRunnable {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn start(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let configs: Api<SecretAgentConfiguration> = Api::all(self.ctx.client.clone());
        let secrets: Api<Secret> = Api::all(self.ctx.client.clone());

        info!(target: CONTROLLER_LOG, "Starting workers");
        let controller = Controller::new(configs, watcher::Config::default());
        let store = controller.store();
        controller
            .watches(secrets, watcher::Config::default(), move |secret: Secret| {
                configurations_declaring(&secret, &store.state())
            })
            .graceful_shutdown_on(async move { shutdown.cancelled().await })
            .run(reconcile, handle_reconciliation_error, Arc::clone(&self.ctx))
            .for_each(|result| async move {
                match result {
                    Ok((object, _)) => debug!(target: CONTROLLER_LOG, object = %object.name, "Reconciled"),
                    Err(e) => warn!(target: CONTROLLER_LOG, error = %e, "Controller stream error"),
                }
            })
            .await;
        info!(target: CONTROLLER_LOG, "Shutdown signal received, waiting for all workers to finish");
        Ok(())
    }
}

/// Configurations in the Secret's namespace that declare a secret of its name
pub fn configurations_declaring(
    secret: &Secret,
    configs: &[Arc<SecretAgentConfiguration>],
) -> Vec<ObjectRef<SecretAgentConfiguration>> {
    let name = secret.name_any();
    let namespace = secret.namespace();
    configs
        .iter()
        .filter(|sac| sac.namespace() == namespace)
        .filter(|sac| sac.spec.secrets.iter().any(|declared| declared.name == name))
        .map(|sac| ObjectRef::from_obj(sac.as_ref()))
        .collect()
}

/// Status for `sac` given the declared secrets found in its namespace
pub fn build_status(
    sac: &SecretAgentConfiguration,
    present: Vec<String>,
    cloud_secrets_namespace: &str,
) -> SecretAgentConfigurationStatus {
    let now = Utc::now().to_rfc3339();
    let declared = sac.spec.secrets.len();
    let found = present.len();
    let complete = found == declared;
    let state = if complete { "Completed" } else { "InProgress" };

    SecretAgentConfigurationStatus {
        state: Some(state.to_string()),
        total_managed_objects: i32::try_from(found).unwrap_or(i32::MAX),
        managed_kubernetes_secrets: present,
        cloud_secrets_namespace: Some(cloud_secrets_namespace.to_string()),
        observed_generation: sac.metadata.generation,
        last_reconcile_time: Some(now.clone()),
        conditions: vec![Condition {
            r#type: "Ready".to_string(),
            status: if complete { "True" } else { "False" }.to_string(),
            last_transition_time: Some(now),
            reason: Some(state.to_string()),
            message: Some(format!("{found} of {declared} declared secrets present")),
        }],
    }
}

/// One reconciliation pass
pub async fn reconcile(sac: Arc<SecretAgentConfiguration>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    metrics::increment_reconciliations();

    let name = sac.name_any();
    let namespace = sac
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;
    info!(
        target: CONTROLLER_LOG,
        {
            resource.name = %name,
            resource.namespace = %namespace,
        },
        "Reconciling SecretAgentConfiguration"
    );

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut present = Vec::new();
    for secret in &sac.spec.secrets {
        if secrets.get_opt(&secret.name).await?.is_some() {
            present.push(secret.name.clone());
        }
    }

    let status = build_status(&sac, present, &ctx.cloud_secrets_namespace);
    metrics::set_managed_secrets(i64::from(status.total_managed_objects));

    let configs: Api<SecretAgentConfiguration> = Api::namespaced(ctx.client.clone(), &namespace);
    let params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PatchParams::default()
    };
    configs
        .patch_status(&name, &params, &Patch::Merge(json!({ "status": status })))
        .await?;

    ctx.backoff.reset(&format!("{namespace}/{name}"));
    metrics::observe_reconciliation_duration(started.elapsed().as_secs_f64());
    debug!(
        target: CONTROLLER_LOG,
        {
            resource.name = %name,
            state = ?status.state,
            managed = status.total_managed_objects,
        },
        "Reconciliation finished"
    );
    Ok(Action::requeue(Duration::from_secs(DEFAULT_RECONCILE_REQUEUE_SECS)))
}
