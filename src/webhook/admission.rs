//! # Admission Reviews
//!
//! Decoding of `AdmissionReview` requests and dispatch to the handler
//! registered for the webhook path.

use crate::constants::WEBHOOK_LOG;
use crate::observability::metrics;
use crate::scheme::Scheme;
use async_trait::async_trait;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{debug, warn};

/// Decides on one admission request
///
/// The request's object has already been checked to decode as its registered
/// kind when the handler is called.
#[async_trait]
pub trait AdmissionHandler: Send + Sync + 'static {
    async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse;
}

/// Turn an incoming review into the review sent back to the API server
pub async fn review(
    handler: &dyn AdmissionHandler,
    scheme: &Scheme,
    path: &str,
    review: AdmissionReview<DynamicObject>,
) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(target: WEBHOOK_LOG, webhook = path, error = %e, "Invalid admission review");
            metrics::increment_admission_requests(path, false);
            return AdmissionResponse::invalid(e.to_string()).into_review();
        }
    };

    debug!(
        target: WEBHOOK_LOG,
        webhook = path,
        uid = %request.uid,
        kind = %request.kind.kind,
        operation = ?request.operation,
        name = %request.name,
        namespace = ?request.namespace,
        "Admission request received"
    );

    let response = match decode_object(scheme, &request) {
        Ok(()) => handler.admit(&request).await,
        Err(reason) => AdmissionResponse::from(&request).deny(reason),
    };

    if !response.allowed {
        debug!(target: WEBHOOK_LOG, webhook = path, uid = %request.uid, "Admission request denied");
    }
    metrics::increment_admission_requests(path, response.allowed);
    response.into_review()
}

fn decode_object(scheme: &Scheme, request: &AdmissionRequest<DynamicObject>) -> Result<(), String> {
    let Some(object) = &request.object else {
        return Ok(());
    };
    let value = serde_json::to_value(object).map_err(|e| e.to_string())?;
    scheme.decode(&request.kind, &value).map_err(|e| e.to_string())
}
