//! # CA Bundle Injection
//!
//! Writes the webhook CA into the `caBundle` of the operator's validating and
//! mutating webhook configurations, so the API server trusts the serving
//! certificate. Configurations that are not installed are skipped.

use super::WebhookError;
use crate::constants::{MUTATING_WEBHOOK_CONFIGURATION, VALIDATING_WEBHOOK_CONFIGURATION, WEBHOOK_LOG};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{info, warn};

/// Webhook configuration kinds carrying client configs
trait ClientConfigs {
    fn client_configs_mut(&mut self) -> Vec<&mut WebhookClientConfig>;
}

impl ClientConfigs for ValidatingWebhookConfiguration {
    fn client_configs_mut(&mut self) -> Vec<&mut WebhookClientConfig> {
        self.webhooks
            .iter_mut()
            .flatten()
            .map(|webhook| &mut webhook.client_config)
            .collect()
    }
}

impl ClientConfigs for MutatingWebhookConfiguration {
    fn client_configs_mut(&mut self) -> Vec<&mut WebhookClientConfig> {
        self.webhooks
            .iter_mut()
            .flatten()
            .map(|webhook| &mut webhook.client_config)
            .collect()
    }
}

/// Set `caBundle` on every webhook; returns whether anything changed
fn inject<K: ClientConfigs>(configuration: &mut K, ca_pem: &str) -> bool {
    let bundle = ByteString(ca_pem.as_bytes().to_vec());
    let mut changed = false;
    for client_config in configuration.client_configs_mut() {
        if client_config.ca_bundle.as_ref() != Some(&bundle) {
            client_config.ca_bundle = Some(bundle.clone());
            changed = true;
        }
    }
    changed
}

async fn patch_configuration<K>(client: &Client, name: &str, ca_pem: &str) -> Result<(), WebhookError>
where
    K: kube::Resource<DynamicType = (), Scope = k8s_openapi::ClusterResourceScope>
        + ClientConfigs
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize,
{
    let api: Api<K> = Api::all(client.clone());
    let ca_bundle_error = |source| WebhookError::CaBundle {
        name: name.to_string(),
        source,
    };

    let Some(mut configuration) = api.get_opt(name).await.map_err(ca_bundle_error)? else {
        warn!(
            target: WEBHOOK_LOG,
            configuration = name,
            "Webhook configuration not found, skipping CA bundle injection"
        );
        return Ok(());
    };

    if !inject(&mut configuration, ca_pem) {
        info!(target: WEBHOOK_LOG, configuration = name, "CA bundle already up to date");
        return Ok(());
    }

    api.replace(name, &PostParams::default(), &configuration)
        .await
        .map_err(ca_bundle_error)?;
    info!(target: WEBHOOK_LOG, configuration = name, "Injected CA bundle");
    Ok(())
}

/// Inject `ca_pem` into both operator webhook configurations
pub async fn patch_ca_bundles(client: &Client, ca_pem: &str) -> Result<(), WebhookError> {
    patch_configuration::<ValidatingWebhookConfiguration>(client, VALIDATING_WEBHOOK_CONFIGURATION, ca_pem).await?;
    patch_configuration::<MutatingWebhookConfiguration>(client, MUTATING_WEBHOOK_CONFIGURATION, ca_pem).await
}
