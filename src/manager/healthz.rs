//! # Health Probes
//!
//! Named liveness (`/healthz`) and readiness (`/readyz`) checks served on the
//! health probe address.
//!
//! The aggregate endpoint runs every check of its kind and answers 200 only
//! when all of them pass. Each check is also reachable on its own path,
//! e.g. `/readyz/ready`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A probe check; `Err` carries the reason reported to the kubelet
pub type Checker = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Check that always passes, answering as soon as the listener is up
pub fn ping() -> Checker {
    Arc::new(|| Ok(()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Healthz,
    Readyz,
}

impl ProbeKind {
    pub fn path(self) -> &'static str {
        match self {
            Self::Healthz => "/healthz",
            Self::Readyz => "/readyz",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path()[1..])
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{kind} check name must not be empty")]
    EmptyName { kind: ProbeKind },

    #[error("{kind} check {name:?} is already registered")]
    Duplicate { kind: ProbeKind, name: String },
}

type Checks = BTreeMap<String, Checker>;

/// Liveness and readiness checks, keyed by name
#[derive(Clone, Default)]
pub struct HealthProbes {
    healthz: Checks,
    readyz: Checks,
}

impl fmt::Debug for HealthProbes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthProbes")
            .field("healthz", &self.healthz.keys().collect::<Vec<_>>())
            .field("readyz", &self.readyz.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HealthProbes {
    pub fn add_healthz_check(&mut self, name: &str, check: Checker) -> Result<(), ProbeError> {
        Self::insert(&mut self.healthz, ProbeKind::Healthz, name, check)
    }

    pub fn add_readyz_check(&mut self, name: &str, check: Checker) -> Result<(), ProbeError> {
        Self::insert(&mut self.readyz, ProbeKind::Readyz, name, check)
    }

    fn insert(checks: &mut Checks, kind: ProbeKind, name: &str, check: Checker) -> Result<(), ProbeError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProbeError::EmptyName { kind });
        }
        if checks.contains_key(name) {
            return Err(ProbeError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
        checks.insert(name.to_string(), check);
        Ok(())
    }

    /// Router serving both probe kinds
    pub fn router(&self) -> Router {
        probe_routes(ProbeKind::Healthz, self.healthz.clone())
            .merge(probe_routes(ProbeKind::Readyz, self.readyz.clone()))
    }
}

fn probe_routes(kind: ProbeKind, checks: Checks) -> Router {
    Router::new()
        .route(kind.path(), get(aggregate))
        .route(&format!("{}/{{name}}", kind.path()), get(single))
        .with_state(Arc::new((kind, checks)))
}

type ProbeState = Arc<(ProbeKind, Checks)>;

async fn aggregate(State(state): State<ProbeState>) -> (StatusCode, String) {
    let (kind, checks) = state.as_ref();
    let mut report = String::new();
    let mut failed = false;

    for (name, check) in checks {
        match check() {
            Ok(()) => report.push_str(&format!("[+]{name} ok\n")),
            Err(reason) => {
                failed = true;
                tracing::info!(
                    target: crate::constants::MANAGER_LOG,
                    checker = %name,
                    reason = %reason,
                    "{} check failed",
                    kind
                );
                report.push_str(&format!("[-]{name} failed: {reason}\n"));
            }
        }
    }

    if failed {
        report.push_str(&format!("{kind} check failed\n"));
        (StatusCode::INTERNAL_SERVER_ERROR, report)
    } else {
        (StatusCode::OK, "ok".to_string())
    }
}

async fn single(
    State(state): State<ProbeState>,
    Path(name): Path<String>,
) -> (StatusCode, String) {
    let (kind, checks) = state.as_ref();
    match checks.get(&name) {
        None => (
            StatusCode::NOT_FOUND,
            format!("no {kind} check named {name:?}\n"),
        ),
        Some(check) => match check() {
            Ok(()) => (StatusCode::OK, "ok".to_string()),
            Err(reason) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal server error: {reason}\n"),
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_path(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_rejects_empty_and_duplicate_names() {
        let mut probes = HealthProbes::default();
        assert!(matches!(
            probes.add_readyz_check(" ", ping()),
            Err(ProbeError::EmptyName { .. })
        ));
        probes.add_readyz_check("ready", ping()).unwrap();
        assert!(matches!(
            probes.add_readyz_check("ready", ping()),
            Err(ProbeError::Duplicate { .. })
        ));
        // Same name under the other kind is fine
        probes.add_healthz_check("ready", ping()).unwrap();
    }

    #[tokio::test]
    async fn test_ping_checks_answer_ok() {
        let mut probes = HealthProbes::default();
        probes.add_healthz_check("healthy", ping()).unwrap();
        probes.add_readyz_check("ready", ping()).unwrap();
        let router = probes.router();

        assert_eq!(get_path(router.clone(), "/healthz").await.0, StatusCode::OK);
        assert_eq!(get_path(router.clone(), "/readyz").await.0, StatusCode::OK);
        assert_eq!(get_path(router.clone(), "/readyz/ready").await.0, StatusCode::OK);
        assert_eq!(
            get_path(router, "/readyz/missing").await.0,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_failing_check_fails_aggregate() {
        let mut probes = HealthProbes::default();
        probes.add_readyz_check("ready", ping()).unwrap();
        probes
            .add_readyz_check("cache", Arc::new(|| Err("not synced".to_string())))
            .unwrap();
        let router = probes.router();

        let (status, body) = get_path(router.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("[-]cache failed: not synced"));
        assert!(body.contains("[+]ready ok"));

        // Liveness is unaffected
        assert_eq!(get_path(router, "/healthz").await.0, StatusCode::OK);
    }
}
