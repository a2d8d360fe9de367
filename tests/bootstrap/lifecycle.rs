//! Setup / teardown of the suite fixture against the fake API server.

use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::ByteString;
use tokio_util::sync::CancellationToken;
use warp::http::Method;

use application_webhook::error::Error;
use application_webhook::manager::{start_test_manager, Manager, ManagerOptions};
use application_webhook::testenv::fixture::{
    suite_webhook_configuration, SUITE_CONFIG_NAME, TEST_NAMESPACE,
};
use application_webhook::testenv::webhook_install::WebhookInstallOptions;
use application_webhook::testenv::{
    EnvironmentOptions, EnvironmentState, SuiteFixture, TestEnvironment, START_TIMEOUT,
};
use application_webhook::webhook::{wire_up_webhook, VALIDATOR_PATH};

use crate::common::{init_tracing, FakeApiServer, FakeControlPlane, SlowControlPlane};

const VWC_PATH: &str =
    "/apis/admissionregistration.k8s.io/v1/validatingwebhookconfigurations/test-suite-webhook";

async fn setup(api: &FakeApiServer) -> (SuiteFixture, crate::common::ControlPlaneCalls) {
    init_tracing();
    let (cp, calls) = FakeControlPlane::new(api);
    let env = TestEnvironment::with_control_plane(EnvironmentOptions::default(), Box::new(cp));
    let fixture = SuiteFixture::setup_with(env, &CancellationToken::new(), START_TIMEOUT)
        .await
        .expect("suite setup failed");
    (fixture, calls)
}

#[tokio::test]
async fn test_setup_installs_configuration_pointing_at_local_server() {
    let api = FakeApiServer::start().await;
    let (mut fixture, calls) = setup(&api).await;
    assert_eq!(calls.starts(), 1);
    assert_eq!(fixture.environment().state(), EnvironmentState::Running);
    assert_eq!(
        fixture.environment().webhook_install_options().installed(),
        [SUITE_CONFIG_NAME.to_string()]
    );

    let addr = fixture.serving_addr().expect("server not bound");
    let stored = api.get(VWC_PATH).expect("configuration not applied");
    let vwc: ValidatingWebhookConfiguration = serde_json::from_value(stored).unwrap();
    assert_eq!(vwc.metadata.name.as_deref(), Some(SUITE_CONFIG_NAME));

    let webhook = &vwc.webhooks.unwrap()[0];
    assert!(webhook.client_config.service.is_none());
    assert_eq!(
        webhook.client_config.url.as_deref(),
        Some(format!("https://{addr}{VALIDATOR_PATH}").as_str())
    );
    assert_eq!(
        webhook.client_config.ca_bundle,
        Some(ByteString(fixture.wiring().ca_bundle.clone()))
    );

    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_setup_creates_test_namespace_and_registers_validator() {
    let api = FakeApiServer::start().await;
    let (mut fixture, _) = setup(&api).await;

    let ns = api.get(&format!("/api/v1/namespaces/{TEST_NAMESPACE}")).unwrap();
    assert_eq!(ns["metadata"]["name"], TEST_NAMESPACE);
    assert_eq!(fixture.wiring().paths, vec![VALIDATOR_PATH.to_string()]);

    let addr = fixture.serving_addr().unwrap();
    assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_teardown_releases_port_and_cert_directory() {
    let api = FakeApiServer::start().await;
    let (mut fixture, calls) = setup(&api).await;
    let addr = fixture.serving_addr().unwrap();
    let cert_dir = fixture.wiring().cert_dir.clone();
    assert!(cert_dir.join("tls.crt").is_file());

    fixture.teardown().await.unwrap();

    assert_eq!(calls.stops(), 1);
    assert_eq!(fixture.environment().state(), EnvironmentState::Stopped);
    assert!(fixture.environment().webhook_install_options().installed().is_empty());
    assert!(!cert_dir.exists(), "cert dir {} left behind", cert_dir.display());
    assert!(std::net::TcpListener::bind(addr).is_ok(), "port {addr} still in use");
    assert!(api.get(VWC_PATH).is_none(), "configuration not removed");
    assert!(fixture.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn test_teardown_twice_is_noop() {
    let api = FakeApiServer::start().await;
    let (mut fixture, calls) = setup(&api).await;

    fixture.teardown().await.unwrap();
    let requests = api.requests().len();
    fixture.teardown().await.unwrap();

    assert_eq!(calls.stops(), 1);
    assert_eq!(api.requests().len(), requests);
}

#[tokio::test]
async fn test_teardown_tolerates_configuration_already_removed() {
    let api = FakeApiServer::start().await;
    let (mut fixture, _) = setup(&api).await;

    let client = api.client();
    let vwcs: kube::Api<ValidatingWebhookConfiguration> = kube::Api::all(client);
    vwcs.delete(SUITE_CONFIG_NAME, &Default::default()).await.unwrap();

    fixture.teardown().await.unwrap();
    let deletes = api
        .requests()
        .into_iter()
        .filter(|(m, p)| *m == Method::DELETE && p == VWC_PATH)
        .count();
    assert_eq!(deletes, 2);
}

#[tokio::test]
async fn test_setup_timeout_fails_and_cleans_up() {
    init_tracing();
    let cert_parent = tempfile::tempdir().unwrap();
    let (cp, calls) = SlowControlPlane::new();
    let env = TestEnvironment::with_control_plane(EnvironmentOptions::default(), Box::new(cp))
        .with_webhook_install_options({
            let mut opts = WebhookInstallOptions::default();
            opts.cert_dir_parent = Some(cert_parent.path().to_path_buf());
            opts
        });
    let timeout = Duration::from_millis(200);
    let result = SuiteFixture::setup_with(env, &CancellationToken::new(), timeout).await;
    match result {
        Err(Error::Timeout { timeout: t, .. }) => assert_eq!(t, timeout),
        Err(e) => panic!("expected timeout, got {e}"),
        Ok(_) => panic!("setup should not succeed"),
    }

    assert_eq!(calls.starts(), 1);
    assert_eq!(calls.stops(), 1);
    let leftovers: Vec<_> = std::fs::read_dir(cert_parent.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "cert directories left behind: {leftovers:?}");
}

#[tokio::test]
async fn test_environment_not_running_until_webhook_server_binds() {
    let api = FakeApiServer::start().await;
    init_tracing();
    let (cp, calls) = FakeControlPlane::new(&api);
    let mut env = TestEnvironment::with_control_plane(EnvironmentOptions::default(), Box::new(cp));
    env.register_validating_webhook(suite_webhook_configuration())
        .unwrap();

    let config = env.start().await.unwrap();
    assert_eq!(env.state(), EnvironmentState::Starting);
    assert!(api.get(VWC_PATH).is_some());

    let install = env.webhook_install_options();
    let _occupied = std::net::TcpListener::bind((
        install.local_serving_host.as_str(),
        install.local_serving_port,
    ))
    .unwrap();
    let options = ManagerOptions {
        host: install.local_serving_host.clone(),
        port: install.local_serving_port,
        cert_dir: install.cert_dir().unwrap().to_path_buf(),
        settings: Default::default(),
    };
    let cert_dir = options.cert_dir.clone();
    let mut manager = Manager::new(config.clone(), options).unwrap();
    wire_up_webhook(api.client(), &mut manager, &cert_dir).unwrap();

    let cancel = CancellationToken::new();
    let mut serving = start_test_manager(cancel.clone(), manager);
    assert!(matches!(serving.ready().await, Err(Error::Server(_))));
    assert_eq!(env.state(), EnvironmentState::Starting);

    env.stop().await.unwrap();
    assert_eq!(env.state(), EnvironmentState::Stopped);
    assert_eq!(calls.stops(), 1);
    assert!(api.get(VWC_PATH).is_none());
}

#[tokio::test]
async fn test_setup_fails_when_serving_port_is_taken() {
    let api = FakeApiServer::start().await;
    init_tracing();
    let occupied = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = occupied.local_addr().unwrap().port();
    let (cp, calls) = FakeControlPlane::new(&api);
    let env = TestEnvironment::with_control_plane(EnvironmentOptions::default(), Box::new(cp))
        .with_webhook_install_options({
            let mut opts = WebhookInstallOptions::default();
            opts.local_serving_port = port;
            opts
        });

    let result = SuiteFixture::setup_with(env, &CancellationToken::new(), START_TIMEOUT).await;
    assert!(matches!(result, Err(Error::Server(_))));
    assert_eq!(calls.stops(), 1);
    assert!(api.get(VWC_PATH).is_none(), "configuration not removed");
}

#[tokio::test]
async fn test_parent_cancellation_stops_webhook_server() {
    let api = FakeApiServer::start().await;
    init_tracing();
    let (cp, _) = FakeControlPlane::new(&api);
    let env = TestEnvironment::with_control_plane(EnvironmentOptions::default(), Box::new(cp));
    let parent = CancellationToken::new();
    let mut fixture = SuiteFixture::setup_with(env, &parent, START_TIMEOUT)
        .await
        .unwrap();
    let addr = fixture.serving_addr().unwrap();

    parent.cancel();
    fixture.teardown().await.unwrap();
    assert!(std::net::TcpListener::bind(addr).is_ok());
}
