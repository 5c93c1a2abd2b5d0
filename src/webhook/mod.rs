//! # Admission Webhooks
//!
//! HTTPS server for admission webhooks, plus the certificate bootstrap it
//! depends on.
//!
//! Handlers are registered per path before the manager starts. The server then
//! listens on `0.0.0.0:<webhook port>` with the serving certificate from the
//! certificate directory and reloads it when the files change.

mod admission;
mod ca_bundle;
mod cert_secret;
mod certs;

pub use admission::{review, AdmissionHandler};
pub use ca_bundle::patch_ca_bundles;
pub use cert_secret::shared_serving_certificate;
pub use certs::{
    check_reusable, install, local_or_issued, CertificateError, CertificateRequest,
    ServingCertificate, CA_VALIDITY_DAYS, ROTATION_THRESHOLD, SERVING_CERT_VALIDITY_DAYS,
};

use crate::constants::{CERT_RELOAD_INTERVAL, TLS_CERT_FILE, TLS_KEY_FILE, WEBHOOK_LOG};
use crate::manager::Runnable;
use crate::scheme::Scheme;
use anyhow::Context;
use async_trait::async_trait;
use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use kube::Client;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook path {0:?} must start with '/'")]
    InvalidPath(String),

    #[error("a webhook is already registered for path {0:?}")]
    DuplicatePath(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("failed to inject CA bundle into {name}: {source}")]
    CaBundle {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to read or store certificate secret {name}: {source}")]
    CertificateSecret {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("certificate secret {name} kept changing, gave up after {attempts} attempts")]
    CertificateSecretContention { name: String, attempts: usize },

    #[error("certificate generation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Make sure the shared serving certificate is in the certificate directory and
/// the API server trusts its CA
pub async fn init_webhook_certificates(client: &Client, request: CertificateRequest) -> anyhow::Result<ServingCertificate> {
    let material = shared_serving_certificate(client, &request).await?;
    install(&request, &material)?;
    patch_ca_bundles(client, &material.ca_pem).await?;
    Ok(material)
}

/// Admission webhook HTTPS server
pub struct WebhookServer {
    port: u16,
    cert_dir: PathBuf,
    scheme: Arc<Scheme>,
    handlers: BTreeMap<String, Arc<dyn AdmissionHandler>>,
}

impl fmt::Debug for WebhookServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookServer")
            .field("port", &self.port)
            .field("cert_dir", &self.cert_dir)
            .field("paths", &self.paths())
            .finish_non_exhaustive()
    }
}

impl WebhookServer {
    pub fn new(port: u16, cert_dir: PathBuf, scheme: Arc<Scheme>) -> Self {
        Self {
            port,
            cert_dir,
            scheme,
            handlers: BTreeMap::new(),
        }
    }

    /// Serve `handler` on `path`; each path takes one handler
    pub fn register(&mut self, path: &str, handler: Arc<dyn AdmissionHandler>) -> Result<(), WebhookError> {
        if !path.starts_with('/') {
            return Err(WebhookError::InvalidPath(path.to_string()));
        }
        if self.handlers.contains_key(path) {
            return Err(WebhookError::DuplicatePath(path.to_string()));
        }
        info!(target: WEBHOOK_LOG, path, "Registering webhook");
        self.handlers.insert(path.to_string(), handler);
        Ok(())
    }

    pub fn has_handlers(&self) -> bool {
        !self.handlers.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// One POST route per registered path
    pub fn router(&self) -> Router {
        self.handlers
            .iter()
            .fold(Router::new(), |router, (path, handler)| {
                let handler = Arc::clone(handler);
                let scheme = Arc::clone(&self.scheme);
                let label = path.clone();
                router.route(
                    path,
                    post(move |Json(body): Json<AdmissionReview<DynamicObject>>| async move {
                        Json(review(handler.as_ref(), &scheme, &label, body).await)
                    }),
                )
            })
    }
}

#[async_trait]
impl Runnable for WebhookServer {
    fn name(&self) -> &str {
        "webhook server"
    }

    async fn start(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let cert = self.cert_dir.join(TLS_CERT_FILE);
        let key = self.cert_dir.join(TLS_KEY_FILE);
        let config = RustlsConfig::from_pem_file(&cert, &key)
            .await
            .with_context(|| format!("failed to load webhook serving certificate from {}", self.cert_dir.display()))?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let handle = Handle::new();

        tokio::spawn(watch_certificates(config.clone(), cert, key, shutdown.clone()));
        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown.cancelled().await;
                handle.graceful_shutdown(Some(Duration::from_secs(10)));
            }
        });

        info!(target: WEBHOOK_LOG, %addr, paths = ?self.paths(), "Starting webhook server");
        axum_server::bind_rustls(addr, config)
            .handle(handle)
            .serve(self.router().layer(TraceLayer::new_for_http()).into_make_service())
            .await
            .with_context(|| format!("webhook server on {addr} failed"))?;

        info!(target: WEBHOOK_LOG, "Webhook server stopped");
        Ok(())
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Reload the TLS config whenever the certificate or key file changes
async fn watch_certificates(config: RustlsConfig, cert: PathBuf, key: PathBuf, shutdown: CancellationToken) {
    let mut last = (modified(&cert), modified(&key));
    let mut interval = tokio::time::interval(CERT_RELOAD_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let current = (modified(&cert), modified(&key));
        if current == last {
            continue;
        }
        match config.reload_from_pem_file(&cert, &key).await {
            Ok(()) => {
                info!(target: WEBHOOK_LOG, cert = %cert.display(), "Reloaded webhook serving certificate");
                last = current;
            }
            Err(e) => warn!(target: WEBHOOK_LOG, error = %e, "Failed to reload webhook serving certificate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use crate::constants::{CA_CERT_FILE, VALIDATING_WEBHOOK_CONFIGURATION};
    use crate::fake_api::{FakeApiServer, NAMESPACE};
    use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
    use k8s_openapi::ByteString;
    use kube::core::admission::{AdmissionRequest, AdmissionResponse};
    use serde_json::json;
    use tower::ServiceExt;

    struct DenyAll;

    #[async_trait]
    impl AdmissionHandler for DenyAll {
        async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
            AdmissionResponse::from(request).deny("nope")
        }
    }

    fn server() -> WebhookServer {
        WebhookServer::new(9443, PathBuf::from("/tmp/certs"), Arc::new(Scheme::for_operator()))
    }

    #[test]
    fn test_register_rejects_duplicates_and_relative_paths() {
        let mut server = server();
        assert!(!server.has_handlers());
        server.register("/validate", Arc::new(DenyAll)).unwrap();
        assert!(matches!(
            server.register("/validate", Arc::new(DenyAll)),
            Err(WebhookError::DuplicatePath(_))
        ));
        assert!(matches!(
            server.register("mutate", Arc::new(DenyAll)),
            Err(WebhookError::InvalidPath(_))
        ));
        assert_eq!(server.paths(), vec!["/validate"]);
    }

    #[tokio::test]
    async fn test_router_dispatches_by_path() {
        let mut server = server();
        server.register("/validate", Arc::new(DenyAll)).unwrap();

        let body = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "uid-1",
                "kind": {"group": "", "version": "v1", "kind": "Secret"},
                "resource": {"group": "", "version": "v1", "resource": "secrets"},
                "operation": "DELETE",
                "userInfo": {}
            }
        });
        let response = server
            .router()
            .oneshot(
                Request::post("/validate")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let review: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(review["response"]["allowed"], json!(false));
        assert_eq!(review["response"]["status"]["message"], json!("nope"));

        let missing = server
            .router()
            .oneshot(Request::post("/mutate").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    const VALIDATING_PATH: &str = "/apis/admissionregistration.k8s.io/v1/validatingwebhookconfigurations/secret-agent-validating-webhook-configuration";

    fn cert_request(dir: &Path) -> CertificateRequest {
        CertificateRequest {
            cert_dir: dir.to_path_buf(),
            service_name: "secret-agent-webhook-service".to_string(),
            namespace: NAMESPACE.to_string(),
        }
    }

    #[tokio::test]
    async fn test_second_replica_keeps_the_first_ca() {
        let api = FakeApiServer::new();
        api.put(
            VALIDATING_PATH,
            json!({
                "apiVersion": "admissionregistration.k8s.io/v1",
                "kind": "ValidatingWebhookConfiguration",
                "metadata": {"name": VALIDATING_WEBHOOK_CONFIGURATION},
                "webhooks": [{
                    "name": "vsecretagentconfiguration.kb.io",
                    "admissionReviewVersions": ["v1"],
                    "sideEffects": "None",
                    "clientConfig": {
                        "service": {"name": "secret-agent-webhook-service", "namespace": NAMESPACE}
                    }
                }]
            }),
        );
        let client = api.client();
        let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

        let first = init_webhook_certificates(&client, cert_request(dir_a.path())).await.unwrap();
        let second = init_webhook_certificates(&client, cert_request(dir_b.path())).await.unwrap();

        assert!(first.issued);
        assert!(!second.issued);
        assert_eq!(second.ca_pem, first.ca_pem);
        assert_eq!(second.cert_pem, first.cert_pem);
        assert_eq!(std::fs::read_to_string(dir_b.path().join(CA_CERT_FILE)).unwrap(), first.ca_pem);

        let configuration: ValidatingWebhookConfiguration =
            serde_json::from_value(api.get(VALIDATING_PATH).unwrap()).unwrap();
        assert_eq!(
            configuration.webhooks.unwrap()[0].client_config.ca_bundle,
            Some(ByteString(first.ca_pem.into_bytes()))
        );
        let bundle_writes = api
            .requests()
            .iter()
            .filter(|request| request.starts_with("PUT /apis/admissionregistration.k8s.io"))
            .count();
        assert_eq!(bundle_writes, 1);
    }
}
