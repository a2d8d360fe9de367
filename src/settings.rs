//! Environment-derived settings.
//!
//! The suite and the webhook read a handful of environment variables. They
//! are parsed once into plain structs and passed down explicitly; nothing in
//! the crate writes to the process environment.

pub const TEST_USE_EXISTING_CLUSTER: &str = "TEST_USE_EXISTING_CLUSTER";
pub const POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const DEPLOYMENT_LABEL: &str = "DEPLOYMENT_LABEL";

const DEFAULT_NAMESPACE: &str = "default";

/// Settings consumed by the webhook under test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookSettings {
    /// Namespace the webhook Service lives in.
    pub pod_namespace: String,
    /// Value of the `app` label selecting the webhook pods.
    pub deployment_label: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            pod_namespace: DEFAULT_NAMESPACE.to_string(),
            deployment_label: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl WebhookSettings {
    /// `POD_NAMESPACE` and `DEPLOYMENT_LABEL` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup; empty values fall
    /// back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Self {
            pod_namespace: non_empty(POD_NAMESPACE).unwrap_or(defaults.pod_namespace),
            deployment_label: non_empty(DEPLOYMENT_LABEL).unwrap_or(defaults.deployment_label),
        }
    }
}

/// Whether the suite should target an already running cluster.
pub fn use_existing_cluster() -> bool {
    use_existing_cluster_from(|key| std::env::var(key).ok())
}

/// Only the exact string `"true"` switches to an existing cluster.
pub fn use_existing_cluster_from(lookup: impl Fn(&str) -> Option<String>) -> bool {
    lookup(TEST_USE_EXISTING_CLUSTER).as_deref() == Some("true")
}
