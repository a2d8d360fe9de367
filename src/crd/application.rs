use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// GroupKind names a kind of resource aggregated by an Application.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct GroupKind {
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

/// Descriptor carries human-facing metadata about the Application.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct Descriptor {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

/// ApplicationAssemblyPhase tracks whether the components have been created.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ApplicationAssemblyPhase {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// Application aggregates the resources matched by its selector into one unit.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "app.k8s.io",
    version = "v1beta1",
    kind = "Application",
    plural = "applications",
    shortname = "app",
    namespaced,
    status = "ApplicationStatus",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.descriptor.type"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.descriptor.version"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_kinds: Vec<GroupKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Descriptor>,

    #[serde(default)]
    pub add_owner_ref: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_phase: Option<ApplicationAssemblyPhase>,
}

// ── Status ────────────────────────────────────────────────────────────────────

/// ObjectStatus reports the state of one aggregated component.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ObjectStatus {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// ApplicationStatus defines the observed state of Application.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ObjectStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
