//! Admission rules for Application resources.
//!
//! Rejects CREATE/UPDATE requests that would:
//! - Carry a malformed label selector (unknown operator, values on
//!   `Exists`/`DoesNotExist`, no values on `In`/`NotIn`, empty key)
//! - Select exactly the same resources as another Application in the
//!   namespace (two Applications claiming one set of components)

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DynamicObject, ListParams, ResourceExt};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::Client;
use tracing::{info, warn};

use crate::crd::application::Application;

use super::AdmissionHandler;

/// Validates Application writes against the Applications already stored in
/// the same namespace.
pub struct ApplicationValidator {
    client: Client,
}

impl ApplicationValidator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl AdmissionHandler for ApplicationValidator {
    async fn handle(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let resp = AdmissionResponse::from(req);
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return resp;
        }
        let Some(obj) = req.object.as_ref() else {
            return resp;
        };

        let app = match parse_application(obj) {
            Ok(app) => app,
            Err(e) => {
                warn!(%e, name = %req.name, "undecodable Application");
                return resp.deny(format!("unable to decode Application: {e}"));
            }
        };
        if let Err(msg) = validate_selector(app.spec.selector.as_ref()) {
            warn!(name = %app.name_any(), %msg, "denied Application");
            return resp.deny(msg);
        }

        let ns = req
            .namespace
            .clone()
            .or_else(|| app.namespace())
            .unwrap_or_else(|| "default".to_string());
        let api: Api<Application> = Api::namespaced(self.client.clone(), &ns);
        let existing = match api.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(e) => {
                warn!(%e, %ns, "failed to list Applications");
                return resp.deny(format!("unable to list Applications in {ns}: {e}"));
            }
        };

        match find_conflict(&app, &existing) {
            Some(other) => {
                let msg = format!(
                    "spec.selector: Application {:?} already selects the same resources in namespace {:?}",
                    other.name_any(),
                    ns
                );
                warn!(name = %app.name_any(), %msg, "denied Application");
                resp.deny(msg)
            }
            None => {
                info!(op = ?req.operation, name = %app.name_any(), %ns, "accepted Application");
                resp
            }
        }
    }
}

fn parse_application(obj: &DynamicObject) -> Result<Application, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

/// Check a label selector is well formed. An absent selector is valid.
pub fn validate_selector(selector: Option<&LabelSelector>) -> Result<(), String> {
    let Some(selector) = selector else {
        return Ok(());
    };
    for (i, expr) in selector.match_expressions.iter().flatten().enumerate() {
        let field = format!("spec.selector.matchExpressions[{i}]");
        if expr.key.is_empty() {
            return Err(format!("{field}.key: must not be empty"));
        }
        let has_values = expr.values.as_ref().is_some_and(|v| !v.is_empty());
        match expr.operator.as_str() {
            "In" | "NotIn" if !has_values => {
                return Err(format!(
                    "{field}.values: must be non-empty for operator {}",
                    expr.operator
                ));
            }
            "Exists" | "DoesNotExist" if has_values => {
                return Err(format!(
                    "{field}.values: must be empty for operator {}",
                    expr.operator
                ));
            }
            "In" | "NotIn" | "Exists" | "DoesNotExist" => {}
            other => return Err(format!("{field}.operator: unsupported operator {other:?}")),
        }
    }
    for key in selector.match_labels.iter().flat_map(|m| m.keys()) {
        if key.is_empty() {
            return Err("spec.selector.matchLabels: keys must not be empty".to_string());
        }
    }
    Ok(())
}

fn selector_is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().map_or(true, |m| m.is_empty())
        && selector
            .match_expressions
            .as_ref()
            .map_or(true, |e| e.is_empty())
}

/// Find another Application (different name, same namespace) whose selector
/// is identical to `app`'s. Empty or absent selectors never conflict.
pub fn find_conflict<'a>(app: &Application, existing: &'a [Application]) -> Option<&'a Application> {
    let selector = app
        .spec
        .selector
        .as_ref()
        .filter(|s| !selector_is_empty(s))?;
    let name = app.name_any();
    let ns = app.namespace();
    existing.iter().find(|other| {
        other.name_any() != name
            && (ns.is_none() || other.namespace() == ns)
            && other.spec.selector.as_ref() == Some(selector)
    })
}
