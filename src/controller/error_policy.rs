//! # Error Policy
//!
//! Requeue decisions for failed reconciliations.

use super::reconciler::{Context, ReconcileError};
use crate::constants::{CONTROLLER_LOG, DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS};
use crate::crd::SecretAgentConfiguration;
use crate::observability::metrics;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Requeue a failed object with Fibonacci backoff
///
/// Backoff state is kept per object, so one failing resource does not slow
/// down the others.
pub fn handle_reconciliation_error(
    obj: Arc<SecretAgentConfiguration>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    error!(
        target: CONTROLLER_LOG,
        {
            resource.name = %name,
            resource.namespace = %namespace,
            error = %error,
        },
        "Reconciliation error for {}/{}",
        namespace,
        name
    );
    metrics::increment_reconciliation_errors();

    let (backoff_seconds, error_count) = ctx
        .backoff
        .record_failure(&format!("{namespace}/{name}"))
        .unwrap_or_else(|| {
            warn!(target: CONTROLLER_LOG, "Backoff state unavailable, using default backoff");
            (DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS, 0)
        });

    info!(
        target: CONTROLLER_LOG,
        {
            resource.name = %name,
            error_count,
        },
        "Retrying in {}s (trigger source: error-backoff)",
        backoff_seconds
    );
    metrics::increment_requeues_total("error-backoff");
    Action::requeue(Duration::from_secs(backoff_seconds))
}
