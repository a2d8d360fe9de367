//! Shared harness for envtest-based integration tests.
//!
//! One suite fixture (control plane + webhook server) is shared across all
//! tests in this binary. Each test gets its own namespace, so Application
//! selector conflicts never leak between tests.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, PostParams};
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use application_webhook::crd::application::Application;
use application_webhook::testenv::{EnvironmentOptions, SuiteFixture};

/// Counter for generating unique namespace names.
static NS_COUNTER: AtomicU32 = AtomicU32::new(0);

// ═══════════════════════════════════════════════════════════════════════════════
// Shared environment (one control plane + webhook server per test binary)
// ═══════════════════════════════════════════════════════════════════════════════

/// The fixture and the runtime its webhook server task lives on. Both last
/// for the whole process.
struct SharedEnv {
    config: kube::Config,
    _fixture: SuiteFixture,
    _runtime: tokio::runtime::Runtime,
}

/// Singleton: initialised on first use, never torn down (process exit and
/// the envtest thread clean up).
static SHARED: OnceLock<SharedEnv> = OnceLock::new();

fn init_shared() -> SharedEnv {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn,application_webhook=debug"))
        .try_init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build shared runtime");

    let fixture = rt.block_on(async {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));
        SuiteFixture::setup(EnvironmentOptions::from_env(root), &CancellationToken::new())
            .await
            .expect("failed to set up test suite")
    });

    SharedEnv {
        config: fixture.config().clone(),
        _fixture: fixture,
        _runtime: rt,
    }
}

/// Get (or create) the shared environment.
///
/// Initialization runs on a dedicated OS thread so `block_on` is never called
/// from inside a `#[tokio::test]` runtime.
fn shared() -> &'static SharedEnv {
    SHARED.get_or_init(|| {
        std::thread::spawn(init_shared)
            .join()
            .expect("shared env init thread panicked")
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-test context
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-test context: owns a unique namespace and provides a kube Client bound
/// to the calling test's runtime.
pub struct TestContext {
    pub client: Client,
    pub ns: String,
}

impl TestContext {
    pub async fn new() -> Self {
        let env = shared();
        let client = Client::try_from(env.config.clone()).expect("failed to create client");

        let id = NS_COUNTER.fetch_add(1, Ordering::SeqCst);
        let ns = format!("apps-{id}");

        let ns_api: Api<Namespace> = Api::all(client.clone());
        let ns_obj: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": &ns }
        }))
        .unwrap();
        ns_api
            .create(&PostParams::default(), &ns_obj)
            .await
            .expect("failed to create test namespace");

        Self { client, ns }
    }

    pub fn applications(&self) -> Api<Application> {
        Api::namespaced(self.client.clone(), &self.ns)
    }

    pub async fn create_app(&self, name: &str, app_label: &str) -> kube::Result<Application> {
        let app: Application = serde_json::from_value(application_json(name, &self.ns, app_label)).unwrap();
        self.applications().create(&PostParams::default(), &app).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

pub fn application_json(name: &str, ns: &str, app_label: &str) -> serde_json::Value {
    json!({
        "apiVersion": "app.k8s.io/v1beta1",
        "kind": "Application",
        "metadata": { "name": name, "namespace": ns },
        "spec": {
            "selector": { "matchLabels": { "app": app_label } },
            "componentKinds": [{ "group": "apps", "kind": "Deployment" }],
            "descriptor": { "type": "web", "version": "1.0.0" }
        }
    })
}

/// The denial message from a webhook rejection, if `err` is one.
pub fn denial_message(err: &kube::Error) -> Option<&str> {
    match err {
        kube::Error::Api(ae) if ae.message.contains("denied the request") => Some(ae.message.as_str()),
        _ => None,
    }
}
