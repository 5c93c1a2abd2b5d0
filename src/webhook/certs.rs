//! # Webhook Serving Certificates
//!
//! Bootstraps the TLS material the admission webhook server needs: a private CA,
//! a serving certificate signed by it, and the serving key.
//!
//! Material is reusable when the key matches the certificate, the CA signed it,
//! it is inside its validity window with less than 80% of its lifetime used,
//! and its SANs cover the webhook service names. Reusable material already in
//! the certificate directory is preferred over issuing a new set.

use crate::constants::{
    CA_CERT_FILE, DEFAULT_WEBHOOK_SERVICE_NAME, TLS_CERT_FILE, TLS_KEY_FILE, WEBHOOK_LOG,
    WEBHOOK_SERVICE_NAME_ENV,
};
use crate::observability::metrics;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use x509_parser::prelude::*;

/// CA lifetime (10 years)
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Serving certificate lifetime (1 year)
pub const SERVING_CERT_VALIDITY_DAYS: i64 = 365;

/// Fraction of the lifetime after which a certificate is replaced
pub const ROTATION_THRESHOLD: f64 = 0.80;

const ORGANIZATION: &str = "secret-agent";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to generate {what}: {reason}")]
    Generation { what: &'static str, reason: String },

    #[error("invalid DNS name {name:?}: {reason}")]
    InvalidDnsName { name: String, reason: String },
}

/// Where the material lives and which service it must be valid for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub cert_dir: PathBuf,
    pub service_name: String,
    pub namespace: String,
}

impl CertificateRequest {
    /// Service name taken from `WEBHOOK_SERVICE_NAME`, falling back to the default
    pub fn from_env(cert_dir: &Path, namespace: &str) -> Self {
        let service_name = std::env::var(WEBHOOK_SERVICE_NAME_ENV)
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_WEBHOOK_SERVICE_NAME.to_string());
        Self {
            cert_dir: cert_dir.to_path_buf(),
            service_name,
            namespace: namespace.to_string(),
        }
    }

    /// DNS names the API server may use to reach the webhook service
    pub fn dns_names(&self) -> Vec<String> {
        let (svc, ns) = (&self.service_name, &self.namespace);
        vec![
            svc.clone(),
            format!("{svc}.{ns}"),
            format!("{svc}.{ns}.svc"),
            format!("{svc}.{ns}.svc.cluster.local"),
        ]
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(TLS_CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(TLS_KEY_FILE)
    }

    pub fn ca_path(&self) -> PathBuf {
        self.cert_dir.join(CA_CERT_FILE)
    }
}

/// PEM material on disk after bootstrap
#[derive(Clone)]
pub struct ServingCertificate {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
    /// `true` when the material was generated by this call
    pub issued: bool,
}

impl std::fmt::Debug for ServingCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingCertificate")
            .field("issued", &self.issued)
            .finish_non_exhaustive()
    }
}

/// Reusable material from the certificate directory, or a freshly issued set
///
/// Nothing is written; see [`install`].
pub fn local_or_issued(request: &CertificateRequest) -> Result<ServingCertificate, CertificateError> {
    if let Some(existing) = read_existing(request) {
        match existing.check(request) {
            Ok(()) => {
                debug!(
                    target: WEBHOOK_LOG,
                    cert_dir = %request.cert_dir.display(),
                    "Existing webhook serving certificate is reusable"
                );
                return Ok(existing);
            }
            Err(reason) => info!(
                target: WEBHOOK_LOG,
                cert_dir = %request.cert_dir.display(),
                reason = %reason,
                "Existing webhook serving certificate cannot be reused"
            ),
        }
    }

    let issued = issue(request)?;
    metrics::increment_certificates_issued();
    info!(
        target: WEBHOOK_LOG,
        service = %request.service_name,
        namespace = %request.namespace,
        "Issued new webhook serving certificate"
    );
    Ok(issued)
}

/// Write `material` into the certificate directory; returns `false` when the
/// files already hold it
pub fn install(request: &CertificateRequest, material: &ServingCertificate) -> Result<bool, CertificateError> {
    std::fs::create_dir_all(&request.cert_dir).map_err(|source| CertificateError::Io {
        action: "create",
        path: request.cert_dir.clone(),
        source,
    })?;

    if read_existing(request).is_some_and(|existing| existing.same_material(material)) {
        return Ok(false);
    }
    write_file(&request.ca_path(), &material.ca_pem, 0o644)?;
    write_file(&request.key_path(), &material.key_pem, 0o600)?;
    write_file(&request.cert_path(), &material.cert_pem, 0o644)?;
    info!(
        target: WEBHOOK_LOG,
        cert_dir = %request.cert_dir.display(),
        "Wrote webhook serving certificate"
    );
    Ok(true)
}

impl ServingCertificate {
    /// `Ok(())` when this material can serve `request` now
    pub fn check(&self, request: &CertificateRequest) -> Result<(), String> {
        check_reusable(&self.ca_pem, &self.cert_pem, &self.key_pem, &request.dns_names(), unix_now())
    }

    fn same_material(&self, other: &Self) -> bool {
        self.ca_pem == other.ca_pem && self.cert_pem == other.cert_pem && self.key_pem == other.key_pem
    }
}

fn read_existing(request: &CertificateRequest) -> Option<ServingCertificate> {
    let read = |path: PathBuf| match std::fs::read_to_string(&path) {
        Ok(contents) => Some(contents),
        Err(e) => {
            debug!(target: WEBHOOK_LOG, path = %path.display(), error = %e, "Certificate file not readable");
            None
        }
    };
    Some(ServingCertificate {
        ca_pem: read(request.ca_path())?,
        cert_pem: read(request.cert_path())?,
        key_pem: read(request.key_path())?,
        issued: false,
    })
}

/// `Ok(())` when the material can keep serving at `now` (Unix seconds)
pub fn check_reusable(
    ca_pem: &str,
    cert_pem: &str,
    key_pem: &str,
    dns_names: &[String],
    now: i64,
) -> Result<(), String> {
    let cert_der = pem_contents(cert_pem, "serving certificate")?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| format!("failed to parse serving certificate: {e}"))?;

    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();
    if now < not_before {
        return Err("serving certificate is not yet valid".to_string());
    }
    if now >= not_after {
        return Err("serving certificate has expired".to_string());
    }
    #[allow(clippy::cast_precision_loss, reason = "Lifetimes in seconds fit an f64 exactly")]
    let used = (now - not_before) as f64 / (not_after - not_before) as f64;
    if used >= ROTATION_THRESHOLD {
        return Err(format!("serving certificate is due for rotation ({:.0}% of lifetime used)", used * 100.0));
    }

    let sans: Vec<&str> = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(*dns),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    if let Some(missing) = dns_names.iter().find(|name| !sans.contains(&name.as_str())) {
        return Err(format!("serving certificate does not cover {missing}"));
    }

    let key = KeyPair::from_pem(key_pem).map_err(|e| format!("failed to parse serving key: {e}"))?;
    if key.public_key_raw() != &*cert.public_key().subject_public_key.data {
        return Err("serving key does not match the serving certificate".to_string());
    }

    let ca_der = pem_contents(ca_pem, "CA certificate")?;
    let (_, ca) = X509Certificate::from_der(&ca_der).map_err(|e| format!("failed to parse CA certificate: {e}"))?;
    if cert.verify_signature(Some(ca.public_key())).is_err() {
        return Err("serving certificate was not signed by the CA".to_string());
    }

    Ok(())
}

fn pem_contents(data: &str, what: &str) -> Result<Vec<u8>, String> {
    ::pem::parse(data.as_bytes())
        .map(|block| block.contents().to_vec())
        .map_err(|e| format!("failed to parse {what} PEM: {e}"))
}

fn unix_now() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

fn validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn generation(what: &'static str) -> impl FnOnce(rcgen::Error) -> CertificateError {
    move |e| CertificateError::Generation {
        what,
        reason: e.to_string(),
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String(ORGANIZATION.to_string()));
    dn
}

/// Issue a CA and a serving certificate for the request's DNS names
fn issue(request: &CertificateRequest) -> Result<ServingCertificate, CertificateError> {
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name = distinguished_name("secret-agent-webhook-ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    (ca_params.not_before, ca_params.not_after) = validity(CA_VALIDITY_DAYS);

    let ca_key = KeyPair::generate().map_err(generation("CA key"))?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(generation("CA certificate"))?;
    let ca_pem = ca_cert.pem();

    let dns_names = request.dns_names();
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&dns_names[2]);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    (params.not_before, params.not_after) = validity(SERVING_CERT_VALIDITY_DAYS);
    params.subject_alt_names = dns_names
        .iter()
        .map(|name| {
            Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|e| CertificateError::InvalidDnsName {
                    name: name.clone(),
                    reason: e.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let key = KeyPair::generate().map_err(generation("serving key"))?;
    let issuer = Issuer::from_ca_cert_pem(&ca_pem, &ca_key).map_err(generation("CA issuer"))?;
    let cert = params.signed_by(&key, &issuer).map_err(generation("serving certificate"))?;

    Ok(ServingCertificate {
        ca_pem,
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        issued: true,
    })
}

/// Write via a temporary file and rename, so readers never see a partial file
fn write_file(path: &Path, contents: &str, mode: u32) -> Result<(), CertificateError> {
    let io_error = |action: &'static str| {
        let path = path.to_path_buf();
        move |source| CertificateError::Io { action, path, source }
    };
    let tmp = path.with_extension("tmp");

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&tmp).map_err(io_error("write"))?;
    file.write_all(contents.as_bytes()).map_err(io_error("write"))?;
    file.sync_all().map_err(io_error("write"))?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode)).map_err(io_error("set permissions on"))?;
    }
    std::fs::rename(&tmp, path).map_err(io_error("rename"))
}
