//! Validating admission webhook for Application resources.
//!
//! [`wire_up_webhook`] is the single entry point the bootstrapper and the
//! binary use: it prepares the serving certificates, points the manager's
//! [`WebhookServer`] at them and registers the [`ApplicationValidator`].

pub mod config;
pub mod server;
pub mod validator;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::Client;
use tracing::info;

use crate::certs::ensure_serving_certs;
use crate::error::Result;
use crate::manager::Manager;

pub use server::{ServingTask, WebhookServer};
pub use validator::ApplicationValidator;

/// Path the Application validator is served on.
pub const VALIDATOR_PATH: &str = "/app-validate";
/// Name of the webhook entry inside the configuration object.
pub const WEBHOOK_NAME: &str = "validation.applications.app.k8s.io";
/// Resource the webhook rule matches.
pub const RESOURCE_NAME: &str = "applications";
/// Service fronting the webhook pods in a real deployment.
pub const SERVICE_NAME: &str = "application-validation-service";
/// Port the webhook listens on when none is configured.
pub const WEBHOOK_PORT: u16 = 9443;

/// A handler for AdmissionReview requests arriving on one path.
#[async_trait::async_trait]
pub trait AdmissionHandler: Send + Sync {
    async fn handle(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse;
}

/// What [`wire_up_webhook`] set up.
#[derive(Clone, Debug)]
pub struct Wiring {
    /// PEM CA bundle the API server must trust to call the webhook.
    pub ca_bundle: Vec<u8>,
    /// Directory the webhook server loads `tls.crt` / `tls.key` from.
    pub cert_dir: PathBuf,
    /// Paths with a registered handler.
    pub paths: Vec<String>,
}

/// Install the Application admission handlers onto the manager's webhook
/// server, serving with the certificates in `cert_dir`.
///
/// Certificates already present in `cert_dir` are reused, so a directory
/// prepared by the test environment keeps the CA the API server was given.
pub fn wire_up_webhook(client: Client, manager: &mut Manager, cert_dir: &Path) -> Result<Wiring> {
    let hosts = serving_hosts(manager);
    let certs = ensure_serving_certs(cert_dir, &hosts)?;

    let server = manager.webhook_server_mut();
    server.set_cert_dir(cert_dir);
    server.register(VALIDATOR_PATH, Arc::new(ApplicationValidator::new(client)));

    info!(
        path = VALIDATOR_PATH,
        cert_dir = %cert_dir.display(),
        "wired up application webhook"
    );

    Ok(Wiring {
        ca_bundle: certs.ca_bundle(),
        cert_dir: cert_dir.to_path_buf(),
        paths: server.registered_paths(),
    })
}

/// SANs for a freshly generated serving certificate: the bind host (unless it
/// is a wildcard), loopback, and the in-cluster Service DNS names.
fn serving_hosts(manager: &Manager) -> Vec<String> {
    let options = manager.options();
    let ns = &options.settings.pod_namespace;
    let mut hosts = Vec::new();
    let bind_host = options.host.trim();
    if !bind_host.is_empty() && bind_host != "0.0.0.0" && bind_host != "::" {
        hosts.push(bind_host.to_string());
    }
    for host in [
        "127.0.0.1".to_string(),
        "localhost".to_string(),
        format!("{SERVICE_NAME}.{ns}.svc"),
        format!("{SERVICE_NAME}.{ns}.svc.cluster.local"),
    ] {
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    hosts
}
