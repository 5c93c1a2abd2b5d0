//! # Validation
//!
//! Admission webhooks for `SecretAgentConfiguration`.
//!
//! The validating webhook rejects configurations that could never reconcile:
//! duplicate secret names, duplicate key names inside a secret, and cloud
//! secret managers missing their location field. The mutating webhook fills in
//! generation defaults.

use crate::constants::WEBHOOK_LOG;
use crate::crd::{SecretAgentConfiguration, SecretsManager};
use crate::manager::Manager;
use crate::webhook::{AdmissionHandler, WebhookError};
use async_trait::async_trait;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::core::DynamicObject;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Path of the validating webhook
pub const VALIDATE_PATH: &str = "/validate-secret-agent-secrets-forgerock-io-v1alpha1-secretagentconfiguration";
/// Path of the mutating (defaulting) webhook
pub const MUTATE_PATH: &str = "/mutate-secret-agent-secrets-forgerock-io-v1alpha1-secretagentconfiguration";

/// Seconds a reconciliation may spend generating secrets, unless set
pub const DEFAULT_SECRET_TIMEOUT: i32 = 40;
/// Retries before a reconciliation is reported as failed, unless set
pub const DEFAULT_BACK_OFF_STEPS: i32 = 5;

/// Binds both admission webhooks to a manager
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretAgentConfigurationWebhook;

impl SecretAgentConfigurationWebhook {
    /// Register the validating and defaulting handlers on the manager's webhook server
    pub fn setup_webhook_with_manager(self, mgr: &mut Manager) -> Result<(), WebhookError> {
        let server = mgr.webhook_server_mut();
        server.register(VALIDATE_PATH, Arc::new(SecretAgentConfigurationValidator))?;
        server.register(MUTATE_PATH, Arc::new(SecretAgentConfigurationDefaulter))?;
        Ok(())
    }
}

fn object_of(request: &AdmissionRequest<DynamicObject>) -> Result<Option<SecretAgentConfiguration>, String> {
    let Some(object) = &request.object else {
        return Ok(None);
    };
    let value = serde_json::to_value(object).map_err(|e| e.to_string())?;
    serde_json::from_value(value).map(Some).map_err(|e| e.to_string())
}

/// Structural checks on a configuration; returns every violation found
pub fn validate(sac: &SecretAgentConfiguration) -> Vec<String> {
    let mut violations = Vec::new();

    let mut secret_names = HashSet::new();
    for secret in &sac.spec.secrets {
        if !secret_names.insert(secret.name.as_str()) {
            violations.push(format!("spec.secrets: duplicate secret name {:?}", secret.name));
        }
        let mut key_names = HashSet::new();
        for key in &secret.keys {
            if !key_names.insert(key.name.as_str()) {
                violations.push(format!(
                    "spec.secrets[{}].keys: duplicate key name {:?}",
                    secret.name, key.name
                ));
            }
        }
    }

    let app = &sac.spec.app_config;
    let missing = |value: &Option<String>| value.as_deref().is_none_or(|v| v.trim().is_empty());
    match app.secrets_manager {
        SecretsManager::Gcp if missing(&app.gcp_project_id) => {
            violations.push("spec.appConfig.gcpProjectID is required when secretsManager is GCP".to_string());
        }
        SecretsManager::Aws if missing(&app.aws_region) => {
            violations.push("spec.appConfig.awsRegion is required when secretsManager is AWS".to_string());
        }
        SecretsManager::Azure if missing(&app.azure_vault_name) => {
            violations.push("spec.appConfig.azureVaultName is required when secretsManager is Azure".to_string());
        }
        _ => {}
    }

    violations
}

/// JSON patch operations filling in unset generation defaults
pub fn default_operations(sac: &SecretAgentConfiguration) -> Vec<serde_json::Value> {
    let app = &sac.spec.app_config;
    let mut operations = Vec::new();
    if app.secret_timeout.is_none() {
        operations.push(json!({
            "op": "add",
            "path": "/spec/appConfig/secretTimeout",
            "value": DEFAULT_SECRET_TIMEOUT
        }));
    }
    if app.back_off_steps.is_none() {
        operations.push(json!({
            "op": "add",
            "path": "/spec/appConfig/backOffSteps",
            "value": DEFAULT_BACK_OFF_STEPS
        }));
    }
    operations
}

/// Validating admission handler
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretAgentConfigurationValidator;

#[async_trait]
impl AdmissionHandler for SecretAgentConfigurationValidator {
    async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let response = AdmissionResponse::from(request);
        if !matches!(request.operation, Operation::Create | Operation::Update) {
            return response;
        }

        let sac = match object_of(request) {
            Ok(Some(sac)) => sac,
            Ok(None) => return response,
            Err(reason) => return response.deny(reason),
        };

        let violations = validate(&sac);
        if violations.is_empty() {
            debug!(target: WEBHOOK_LOG, name = %request.name, "SecretAgentConfiguration is valid");
            response
        } else {
            warn!(target: WEBHOOK_LOG, name = %request.name, ?violations, "Rejecting SecretAgentConfiguration");
            response.deny(violations.join("; "))
        }
    }
}

/// Defaulting admission handler
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretAgentConfigurationDefaulter;

#[async_trait]
impl AdmissionHandler for SecretAgentConfigurationDefaulter {
    async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let response = AdmissionResponse::from(request);
        let sac = match object_of(request) {
            Ok(Some(sac)) => sac,
            Ok(None) => return response,
            Err(reason) => return response.deny(reason),
        };

        let operations = default_operations(&sac);
        if operations.is_empty() {
            return response;
        }

        let patch: json_patch::Patch = match serde_json::from_value(serde_json::Value::Array(operations)) {
            Ok(patch) => patch,
            Err(e) => return response.deny(e.to_string()),
        };
        match response.with_patch(patch) {
            Ok(patched) => patched,
            Err(e) => AdmissionResponse::from(request).deny(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn request(operation: &str, spec: Value) -> AdmissionRequest<DynamicObject> {
        let review: kube::core::admission::AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "e911857d-c318-11e8-bbad-025000000001",
                "kind": {"group": "secret-agent.secrets.forgerock.io", "version": "v1alpha1", "kind": "SecretAgentConfiguration"},
                "resource": {"group": "secret-agent.secrets.forgerock.io", "version": "v1alpha1", "resource": "secretagentconfigurations"},
                "name": "forgerock-sac",
                "namespace": "default",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": {
                    "apiVersion": "secret-agent.secrets.forgerock.io/v1alpha1",
                    "kind": "SecretAgentConfiguration",
                    "metadata": {"name": "forgerock-sac", "namespace": "default"},
                    "spec": spec
                }
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[tokio::test]
    async fn test_valid_configuration_is_allowed() {
        let spec = json!({
            "appConfig": {"secretsManager": "GCP", "gcpProjectID": "my-project"},
            "secrets": [
                {"name": "ds-passwords", "keys": [{"name": "dirmanager.pw", "type": "password"}]},
                {"name": "am-keys", "keys": [{"name": "dirmanager.pw", "type": "password"}]}
            ]
        });
        let response = SecretAgentConfigurationValidator.admit(&request("CREATE", spec)).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn test_duplicate_names_are_rejected() {
        let spec = json!({
            "appConfig": {},
            "secrets": [
                {"name": "ds-passwords", "keys": [
                    {"name": "dirmanager.pw", "type": "password"},
                    {"name": "dirmanager.pw", "type": "literal"}
                ]},
                {"name": "ds-passwords", "keys": []}
            ]
        });
        let response = SecretAgentConfigurationValidator.admit(&request("UPDATE", spec)).await;
        assert!(!response.allowed);
        let message = &response.result.message;
        assert!(message.contains("duplicate secret name \"ds-passwords\""));
        assert!(message.contains("duplicate key name \"dirmanager.pw\""));
    }

    #[tokio::test]
    async fn test_cloud_manager_requires_location() {
        let spec = json!({"appConfig": {"secretsManager": "AWS"}, "secrets": []});
        let response = SecretAgentConfigurationValidator.admit(&request("CREATE", spec)).await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("awsRegion"));
    }

    #[tokio::test]
    async fn test_delete_is_not_validated() {
        let spec = json!({"appConfig": {"secretsManager": "Azure"}, "secrets": []});
        let response = SecretAgentConfigurationValidator.admit(&request("DELETE", spec)).await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn test_defaulter_patches_unset_fields() {
        let spec = json!({"appConfig": {"backOffSteps": 2}, "secrets": []});
        let response = SecretAgentConfigurationDefaulter.admit(&request("CREATE", spec)).await;
        assert!(response.allowed);
        let patch: Value = serde_json::from_slice(response.patch.as_deref().unwrap()).unwrap();
        assert_eq!(
            patch,
            json!([{"op": "add", "path": "/spec/appConfig/secretTimeout", "value": 40}])
        );
    }

    #[test]
    fn test_default_operations() {
        let sac: SecretAgentConfiguration = serde_json::from_value(json!({
            "apiVersion": "secret-agent.secrets.forgerock.io/v1alpha1",
            "kind": "SecretAgentConfiguration",
            "metadata": {"name": "forgerock-sac"},
            "spec": {"appConfig": {"backOffSteps": 2}, "secrets": []}
        }))
        .unwrap();
        let operations = default_operations(&sac);
        assert_eq!(
            operations,
            vec![json!({"op": "add", "path": "/spec/appConfig/secretTimeout", "value": 40})]
        );
    }

    #[tokio::test]
    async fn test_fully_defaulted_object_is_not_patched() {
        let spec = json!({"appConfig": {"secretTimeout": 10, "backOffSteps": 2}, "secrets": []});
        let response = SecretAgentConfigurationDefaulter.admit(&request("CREATE", spec)).await;
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }
}
