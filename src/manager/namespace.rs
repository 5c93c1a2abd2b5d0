//! Operator namespace discovery.

use crate::constants::{POD_NAMESPACE_ENV, SERVICE_ACCOUNT_NAMESPACE_FILE};
use std::path::Path;

/// Namespace the operator runs in
///
/// Checked in order: `POD_NAMESPACE`, the mounted service account namespace,
/// then the client's default namespace.
pub fn operator_namespace(client_default: &str) -> String {
    resolve(
        std::env::var(POD_NAMESPACE_ENV).ok().as_deref(),
        Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE),
        client_default,
    )
}

fn resolve(env_value: Option<&str>, service_account_file: &Path, client_default: &str) -> String {
    if let Some(namespace) = env_value.map(str::trim).filter(|ns| !ns.is_empty()) {
        return namespace.to_string();
    }
    if let Ok(contents) = std::fs::read_to_string(service_account_file) {
        let namespace = contents.trim();
        if !namespace.is_empty() {
            return namespace.to_string();
        }
    }
    client_default.to_string()
}
