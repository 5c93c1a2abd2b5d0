//! # Scheme
//!
//! Registry of the resource kinds the operator talks to the API server about.
//!
//! Every kind maps to its [`ApiResource`] (group, version, plural) and a decoder
//! that checks a JSON object deserializes into the registered Rust type. The
//! scheme is filled in once at startup, before the manager is built, and shared
//! read-only afterwards.

use crate::crd::SecretAgentConfiguration;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Pod, Secret};
use kube::api::ApiResource;
use kube::core::GroupVersionKind;
use kube::Resource;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemeError {
    #[error("no kind {kind:?} is registered for version {group_version:?} in the scheme")]
    NotRegistered { group_version: String, kind: String },

    #[error("object does not decode as {kind}: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

type Decoder = fn(&serde_json::Value) -> Result<(), serde_json::Error>;

/// Serialization behaviour of one registered kind
#[derive(Clone)]
pub struct TypeInfo {
    pub api_resource: ApiResource,
    decoder: Decoder,
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("api_resource", &self.api_resource)
            .finish_non_exhaustive()
    }
}

/// Mapping from `GroupVersionKind` to serialization behaviour
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    types: HashMap<GroupVersionKind, TypeInfo>,
}

fn decode_as<K: DeserializeOwned>(value: &serde_json::Value) -> Result<(), serde_json::Error> {
    K::deserialize(value).map(|_| ())
}

fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

fn group_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheme holding the built-in kinds and the operator's custom kinds
    pub fn for_operator() -> Self {
        let mut scheme = Self::new();
        scheme.add_builtin_types();
        scheme.add_custom_types();
        scheme
    }

    /// Register `K`; returns `false` when it was already present
    pub fn register<K>(&mut self) -> bool
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let gvk = gvk_of::<K>();
        if self.types.contains_key(&gvk) {
            return false;
        }
        self.types.insert(
            gvk,
            TypeInfo {
                api_resource: ApiResource::erase::<K>(&()),
                decoder: decode_as::<K>,
            },
        );
        true
    }

    /// Built-in Kubernetes kinds used by the manager, the reconciler and the webhook bootstrap
    pub fn add_builtin_types(&mut self) {
        self.register::<Secret>();
        self.register::<ConfigMap>();
        self.register::<Namespace>();
        self.register::<Pod>();
        self.register::<Event>();
        self.register::<Lease>();
        self.register::<ValidatingWebhookConfiguration>();
        self.register::<MutatingWebhookConfiguration>();
    }

    /// Custom kinds managed by this operator
    pub fn add_custom_types(&mut self) {
        self.register::<SecretAgentConfiguration>();
    }

    pub fn contains<K: Resource<DynamicType = ()>>(&self) -> bool {
        self.types.contains_key(&gvk_of::<K>())
    }

    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.types.contains_key(gvk)
    }

    pub fn ensure_registered<K: Resource<DynamicType = ()>>(&self) -> Result<(), SchemeError> {
        let gvk = gvk_of::<K>();
        if self.recognizes(&gvk) {
            Ok(())
        } else {
            Err(SchemeError::NotRegistered {
                group_version: group_version(&gvk),
                kind: gvk.kind,
            })
        }
    }

    pub fn api_resource(&self, gvk: &GroupVersionKind) -> Option<&ApiResource> {
        self.types.get(gvk).map(|info| &info.api_resource)
    }

    /// Check that `value` is a well-formed object of the registered kind `gvk`
    pub fn decode(&self, gvk: &GroupVersionKind, value: &serde_json::Value) -> Result<(), SchemeError> {
        let info = self.types.get(gvk).ok_or_else(|| SchemeError::NotRegistered {
            group_version: group_version(gvk),
            kind: gvk.kind.clone(),
        })?;
        (info.decoder)(value).map_err(|source| SchemeError::Decode {
            kind: gvk.kind.clone(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Registered kinds, sorted for stable output
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .types
            .keys()
            .map(|gvk| format!("{}, Kind={}", group_version(gvk), gvk.kind))
            .collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_is_idempotent() {
        let mut scheme = Scheme::new();
        assert!(scheme.register::<Secret>());
        assert!(!scheme.register::<Secret>());
        assert_eq!(scheme.len(), 1);
    }

    #[test]
    fn test_operator_scheme_contains_builtin_and_custom_kinds() {
        let scheme = Scheme::for_operator();
        assert!(scheme.contains::<Secret>());
        assert!(scheme.contains::<Lease>());
        assert!(scheme.contains::<ValidatingWebhookConfiguration>());
        assert!(scheme.contains::<SecretAgentConfiguration>());
        assert_eq!(scheme.len(), 9);
    }

    #[test]
    fn test_adding_types_twice_changes_nothing() {
        let mut scheme = Scheme::for_operator();
        let before = scheme.kinds();
        scheme.add_builtin_types();
        scheme.add_custom_types();
        assert_eq!(scheme.kinds(), before);
    }

    #[test]
    fn test_ensure_registered_reports_missing_kind() {
        let scheme = Scheme::new();
        let err = scheme.ensure_registered::<SecretAgentConfiguration>().unwrap_err();
        assert!(err.to_string().contains("SecretAgentConfiguration"));
        assert!(err
            .to_string()
            .contains("secret-agent.secrets.forgerock.io/v1alpha1"));
    }

    #[test]
    fn test_api_resource_lookup() {
        let scheme = Scheme::for_operator();
        let gvk = GroupVersionKind::gvk("", "v1", "Secret");
        let resource = scheme.api_resource(&gvk).unwrap();
        assert_eq!(resource.plural, "secrets");
        assert_eq!(resource.api_version, "v1");
    }

    #[test]
    fn test_decode_checks_object_shape() {
        let scheme = Scheme::for_operator();
        let gvk = GroupVersionKind::gvk(
            "secret-agent.secrets.forgerock.io",
            "v1alpha1",
            "SecretAgentConfiguration",
        );
        let valid = json!({
            "apiVersion": "secret-agent.secrets.forgerock.io/v1alpha1",
            "kind": "SecretAgentConfiguration",
            "metadata": {"name": "sac"},
            "spec": {"appConfig": {}, "secrets": []}
        });
        scheme.decode(&gvk, &valid).unwrap();

        let invalid = json!({
            "apiVersion": "secret-agent.secrets.forgerock.io/v1alpha1",
            "kind": "SecretAgentConfiguration",
            "metadata": {"name": "sac"},
            "spec": {"secrets": "not-a-list"}
        });
        assert!(matches!(
            scheme.decode(&gvk, &invalid),
            Err(SchemeError::Decode { .. })
        ));
    }
}
