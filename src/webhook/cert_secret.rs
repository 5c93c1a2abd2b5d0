//! # Shared Certificate Secret
//!
//! All replicas serve the webhooks with one CA and serving pair, kept in a
//! `kubernetes.io/tls` Secret in the operator namespace. The first replica to
//! start stores its material and every later one adopts it, so the `caBundle`
//! injected by any replica trusts whichever replica holds the leader lease.
//!
//! Writers race through create-if-absent and `resourceVersion` on replace; the
//! loser of a 409 reads the winner's material back.

use super::certs::{local_or_issued, CertificateRequest, ServingCertificate};
use super::WebhookError;
use crate::constants::{CA_CERT_FILE, TLS_CERT_FILE, TLS_KEY_FILE, WEBHOOK_CERT_SECRET, WEBHOOK_LOG};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Rounds of read, then create or replace, before giving up
const MAX_ATTEMPTS: usize = 3;

/// Material every replica agrees on, created from local or fresh material if
/// the Secret is missing or no longer reusable
pub async fn shared_serving_certificate(
    client: &Client,
    request: &CertificateRequest,
) -> Result<ServingCertificate, WebhookError> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &request.namespace);
    let secret_error = |source| WebhookError::CertificateSecret {
        name: WEBHOOK_CERT_SECRET.to_string(),
        source,
    };

    for attempt in 1..=MAX_ATTEMPTS {
        let stored = api.get_opt(WEBHOOK_CERT_SECRET).await.map_err(secret_error)?;
        if let Some(secret) = &stored {
            match material_from_secret(secret).and_then(|material| material.check(request).map(|()| material)) {
                Ok(material) => {
                    info!(
                        target: WEBHOOK_LOG,
                        secret = WEBHOOK_CERT_SECRET,
                        "Using the shared webhook serving certificate"
                    );
                    return Ok(material);
                }
                Err(reason) => info!(
                    target: WEBHOOK_LOG,
                    secret = WEBHOOK_CERT_SECRET,
                    reason = %reason,
                    "Shared webhook serving certificate cannot be reused, replacing it"
                ),
            }
        }

        let candidate = {
            let request = request.clone();
            tokio::task::spawn_blocking(move || local_or_issued(&request)).await??
        };

        let written = match stored.and_then(|secret| secret.metadata.resource_version) {
            Some(resource_version) => {
                let secret = secret_object(request, &candidate, Some(resource_version));
                api.replace(WEBHOOK_CERT_SECRET, &PostParams::default(), &secret).await
            }
            None => {
                let secret = secret_object(request, &candidate, None);
                api.create(&PostParams::default(), &secret).await
            }
        };

        match written {
            Ok(_) => {
                info!(
                    target: WEBHOOK_LOG,
                    secret = WEBHOOK_CERT_SECRET,
                    issued = candidate.issued,
                    "Stored the shared webhook serving certificate"
                );
                return Ok(candidate);
            }
            Err(kube::Error::Api(e)) if e.code == 409 => debug!(
                target: WEBHOOK_LOG,
                attempt,
                "Another replica stored the webhook serving certificate first, reading it back"
            ),
            Err(e) => return Err(secret_error(e)),
        }
    }

    Err(WebhookError::CertificateSecretContention {
        name: WEBHOOK_CERT_SECRET.to_string(),
        attempts: MAX_ATTEMPTS,
    })
}

fn material_from_secret(secret: &Secret) -> Result<ServingCertificate, String> {
    let data = secret.data.as_ref().ok_or("secret has no data")?;
    let field = |key: &str| {
        let bytes = data.get(key).ok_or_else(|| format!("secret has no {key}"))?;
        String::from_utf8(bytes.0.clone()).map_err(|e| format!("{key} is not UTF-8: {e}"))
    };
    Ok(ServingCertificate {
        ca_pem: field(CA_CERT_FILE)?,
        cert_pem: field(TLS_CERT_FILE)?,
        key_pem: field(TLS_KEY_FILE)?,
        issued: false,
    })
}

fn secret_object(request: &CertificateRequest, material: &ServingCertificate, resource_version: Option<String>) -> Secret {
    let bytes = |pem: &str| ByteString(pem.as_bytes().to_vec());
    Secret {
        metadata: ObjectMeta {
            name: Some(WEBHOOK_CERT_SECRET.to_string()),
            namespace: Some(request.namespace.clone()),
            resource_version,
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "secret-agent".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (CA_CERT_FILE.to_string(), bytes(&material.ca_pem)),
            (TLS_CERT_FILE.to_string(), bytes(&material.cert_pem)),
            (TLS_KEY_FILE.to_string(), bytes(&material.key_pem)),
        ])),
        ..Secret::default()
    }
}
