//! # SecretAgentConfiguration Status

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Observed state of a SecretAgentConfiguration
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretAgentConfigurationStatus {
    /// Values: Pending, InProgress, Completed, Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Number of declared secrets currently present
    #[serde(default)]
    pub total_managed_objects: i32,
    /// Names of the Kubernetes Secrets found for this configuration
    #[serde(default)]
    pub managed_kubernetes_secrets: Vec<String>,
    /// Namespace the cloud credentials were resolved from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_secrets_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Last reconciliation time (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
