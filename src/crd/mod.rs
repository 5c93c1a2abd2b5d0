//! # Custom Resource Definitions
//!
//! CRD types for the Secret Agent operator.
//!
//! `SecretAgentConfiguration` declares the set of secrets the operator generates,
//! rotates and stores, either as Kubernetes Secrets or in a cloud secret manager.

mod status;

pub use status::{Condition, SecretAgentConfigurationStatus};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the operator's custom resources
pub const GROUP: &str = "secret-agent.secrets.forgerock.io";
/// API version of `SecretAgentConfiguration`
pub const VERSION: &str = "v1alpha1";

/// SecretAgentConfiguration Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: secret-agent.secrets.forgerock.io/v1alpha1
/// kind: SecretAgentConfiguration
/// metadata:
///   name: forgerock-sac
///   namespace: default
/// spec:
///   appConfig:
///     createKubeObjects: true
///     secretsManager: GCP
///     gcpProjectID: my-project
///     credentialsSecretName: cloud-credentials
///   secrets:
///     - name: ds-passwords
///       keys:
///         - name: dirmanager.pw
///           type: password
///           spec:
///             length: 24
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "SecretAgentConfiguration",
    group = "secret-agent.secrets.forgerock.io",
    version = "v1alpha1",
    namespaced,
    status = "SecretAgentConfigurationStatus",
    shortname = "sac",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}, {"name":"Managed", "type":"integer", "jsonPath":".status.totalManagedObjects"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SecretAgentConfigurationSpec {
    /// Operator behaviour for this configuration
    pub app_config: AppConfig,
    /// Secrets to generate and keep in sync
    #[serde(default)]
    pub secrets: Vec<SecretConfig>,
}

/// Where generated secrets are stored and how long generation may take
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Create Kubernetes Secrets for every declared secret
    #[serde(default)]
    pub create_kube_objects: bool,
    /// Cloud secret manager backing the generated secrets
    #[serde(default)]
    pub secrets_manager: SecretsManager,
    /// GCP project holding the secrets (required for `GCP`)
    #[serde(default, rename = "gcpProjectID", skip_serializing_if = "Option::is_none")]
    pub gcp_project_id: Option<String>,
    /// AWS region holding the secrets (required for `AWS`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_region: Option<String>,
    /// Azure Key Vault name (required for `Azure`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_vault_name: Option<String>,
    /// Secret holding the cloud credentials, looked up in the cloud secrets namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_name: Option<String>,
    /// Prefix applied to names in the cloud secret manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_manager_prefix: Option<String>,
    /// Seconds allowed for a reconciliation to generate all secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_timeout: Option<i32>,
    /// Retries before a reconciliation is reported as failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_off_steps: Option<i32>,
}

/// Cloud secret manager selection
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SecretsManager {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "GCP")]
    Gcp,
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "Azure")]
    Azure,
}

/// One Kubernetes Secret worth of keys
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretConfig {
    pub name: String,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

/// One key inside a secret
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<KeySpec>,
}

/// Kind of material generated for a key
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum KeyType {
    Literal,
    Password,
    Ssh,
    KeyPair,
    Ca,
    HmacKey,
}

/// Generation parameters for a key
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeySpec {
    /// Literal value (for `literal` keys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Generated length in characters or bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_resource_identity() {
        assert_eq!(SecretAgentConfiguration::group(&()), GROUP);
        assert_eq!(SecretAgentConfiguration::version(&()), VERSION);
        assert_eq!(SecretAgentConfiguration::kind(&()), "SecretAgentConfiguration");
    }

    #[test]
    fn test_spec_deserializes_from_manifest() {
        let spec: SecretAgentConfigurationSpec = serde_json::from_value(serde_json::json!({
            "appConfig": {
                "createKubeObjects": true,
                "secretsManager": "GCP",
                "gcpProjectID": "my-project"
            },
            "secrets": [{
                "name": "ds-passwords",
                "keys": [{"name": "dirmanager.pw", "type": "password", "spec": {"length": 24}}]
            }]
        }))
        .unwrap();

        assert_eq!(spec.app_config.secrets_manager, SecretsManager::Gcp);
        assert_eq!(spec.app_config.gcp_project_id.as_deref(), Some("my-project"));
        assert_eq!(spec.secrets[0].keys[0].key_type, KeyType::Password);
        assert_eq!(spec.secrets[0].keys[0].spec.as_ref().unwrap().length, Some(24));
    }

    #[test]
    fn test_secrets_manager_defaults_to_none() {
        let app: AppConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(app.secrets_manager, SecretsManager::None);
        assert!(!app.create_kube_objects);
    }
}
