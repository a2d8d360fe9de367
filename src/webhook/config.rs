//! ValidatingWebhookConfiguration descriptor and the in-cluster resources that
//! front the webhook in a real deployment.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::{Client, Resource};
use tracing::info;

use crate::crd::application::Application;
use crate::error::Result;
use crate::settings::WebhookSettings;
use crate::FIELD_MANAGER;

use super::{RESOURCE_NAME, SERVICE_NAME, VALIDATOR_PATH, WEBHOOK_NAME, WEBHOOK_PORT};

/// Name of the configuration object installed by a real deployment.
pub const DEPLOYED_CONFIGURATION_NAME: &str = "application-webhook-validator";

/// The single webhook entry: CREATE/UPDATE on namespaced Applications,
/// fail-closed, equivalent matching, no side effects.
pub fn application_validating_webhook(service_namespace: &str) -> ValidatingWebhook {
    ValidatingWebhook {
        name: WEBHOOK_NAME.to_string(),
        admission_review_versions: vec!["v1".to_string()],
        rules: Some(vec![RuleWithOperations {
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            api_groups: Some(vec![Application::group(&()).to_string()]),
            api_versions: Some(vec![Application::version(&()).to_string()]),
            resources: Some(vec![RESOURCE_NAME.to_string()]),
            scope: Some("Namespaced".to_string()),
        }]),
        failure_policy: Some("Fail".to_string()),
        match_policy: Some("Equivalent".to_string()),
        side_effects: "None".to_string(),
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                name: SERVICE_NAME.to_string(),
                namespace: service_namespace.to_string(),
                path: Some(VALIDATOR_PATH.to_string()),
                port: None,
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A configuration object holding [`application_validating_webhook`].
pub fn validating_webhook_configuration(
    name: &str,
    service_namespace: &str,
) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![application_validating_webhook(service_namespace)]),
    }
}

/// The Service routing in-cluster webhook calls to pods labelled
/// `app=<deployment_label>`.
pub fn webhook_service(settings: &WebhookSettings) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(SERVICE_NAME.to_string()),
            namespace: Some(settings.pod_namespace.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                settings.deployment_label.clone(),
            )])),
            ports: Some(vec![ServicePort {
                port: 443,
                target_port: Some(IntOrString::Int(i32::from(WEBHOOK_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Apply the webhook Service and the configuration pointing at it, trusting
/// `ca_bundle`.
pub async fn install_supplementary_resources(
    client: &Client,
    settings: &WebhookSettings,
    ca_bundle: &[u8],
) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let services: Api<Service> = Api::namespaced(client.clone(), &settings.pod_namespace);
    services
        .patch(SERVICE_NAME, &params, &Patch::Apply(&webhook_service(settings)))
        .await?;

    let mut vwc =
        validating_webhook_configuration(DEPLOYED_CONFIGURATION_NAME, &settings.pod_namespace);
    for webhook in vwc.webhooks.iter_mut().flatten() {
        webhook.client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
    }
    let configs: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    configs
        .patch(DEPLOYED_CONFIGURATION_NAME, &params, &Patch::Apply(&vwc))
        .await?;

    info!(
        ns = %settings.pod_namespace,
        service = SERVICE_NAME,
        config = DEPLOYED_CONFIGURATION_NAME,
        "installed webhook service and configuration"
    );
    Ok(())
}
