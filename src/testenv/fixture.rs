//! The suite fixture: environment, manager and webhook server brought up
//! together before the tests and torn down together after them.

use std::net::SocketAddr;
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::manager::{start_test_manager, Manager, ManagerOptions};
use crate::settings::WebhookSettings;
use crate::webhook::config::validating_webhook_configuration;
use crate::webhook::{wire_up_webhook, ServingTask, Wiring};
use crate::FIELD_MANAGER;

use super::{keep_first, EnvironmentOptions, TestEnvironment, START_TIMEOUT, STOP_TIMEOUT};

/// Name of the configuration the suite installs.
pub const SUITE_CONFIG_NAME: &str = "test-suite-webhook";
/// Namespace created for the tests.
pub const TEST_NAMESPACE: &str = "test";

/// The validating configuration the suite registers, referencing the
/// webhook Service in `default`.
pub fn suite_webhook_configuration() -> ValidatingWebhookConfiguration {
    validating_webhook_configuration(SUITE_CONFIG_NAME, "default")
}

pub struct SuiteFixture {
    env: TestEnvironment,
    client: Client,
    config: kube::Config,
    wiring: Wiring,
    serving: Option<ServingTask>,
    cancel: CancellationToken,
    torn_down: bool,
}

struct Bootstrapped {
    client: Client,
    config: kube::Config,
    wiring: Wiring,
    serving: ServingTask,
}

impl SuiteFixture {
    /// Bring the suite up within [`START_TIMEOUT`]. Cancelling `parent`
    /// stops the webhook server.
    pub async fn setup(options: EnvironmentOptions, parent: &CancellationToken) -> Result<Self> {
        Self::setup_with(TestEnvironment::new(options), parent, START_TIMEOUT).await
    }

    /// Bring the suite up on `env`. Whatever was acquired is released again
    /// if setup fails or does not finish within `timeout`.
    pub async fn setup_with(
        mut env: TestEnvironment,
        parent: &CancellationToken,
        timeout: Duration,
    ) -> Result<Self> {
        let cancel = parent.child_token();
        env.register_validating_webhook(suite_webhook_configuration())?;

        // Stops the server task if setup bails out below.
        let guard = cancel.clone().drop_guard();
        let outcome = tokio::time::timeout(timeout, bootstrap(&mut env, &cancel)).await;
        let err = match outcome {
            Ok(Ok(parts)) => {
                let _ = guard.disarm();
                info!(
                    addr = ?parts.serving.addr(),
                    backend = env.control_plane_name(),
                    configurations = ?env.webhook_install_options().installed(),
                    "test suite ready"
                );
                return Ok(Self {
                    env,
                    client: parts.client,
                    config: parts.config,
                    wiring: parts.wiring,
                    serving: Some(parts.serving),
                    cancel,
                    torn_down: false,
                });
            }
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout {
                operation: "test suite setup",
                timeout,
            },
        };

        drop(guard);
        warn!(%err, "test suite setup failed, releasing environment");
        if let Err(e) = env.stop().await {
            warn!(%e, "failed to stop test environment after setup failure");
        }
        Err(err)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &kube::Config {
        &self.config
    }

    pub fn wiring(&self) -> &Wiring {
        &self.wiring
    }

    pub fn environment(&self) -> &TestEnvironment {
        &self.env
    }

    /// Address the webhook server is bound to.
    pub fn serving_addr(&self) -> Option<SocketAddr> {
        self.serving.as_ref().and_then(|s| s.addr())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop serving, then stop the environment. A second call does nothing.
    pub async fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        self.cancel.cancel();
        let mut first_err = None;

        if let Some(mut serving) = self.serving.take() {
            match tokio::time::timeout(STOP_TIMEOUT, serving.stopped()).await {
                Ok(result) => keep_first(&mut first_err, "stop webhook server", result),
                Err(_) => keep_first(
                    &mut first_err,
                    "stop webhook server",
                    Err(Error::Timeout {
                        operation: "webhook server shutdown",
                        timeout: STOP_TIMEOUT,
                    }),
                ),
            }
        }
        keep_first(&mut first_err, "stop environment", self.env.stop().await);

        info!("test suite torn down");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for SuiteFixture {
    fn drop(&mut self) {
        if !self.torn_down {
            warn!("suite fixture dropped without teardown()");
            self.cancel.cancel();
        }
    }
}

async fn bootstrap(env: &mut TestEnvironment, cancel: &CancellationToken) -> Result<Bootstrapped> {
    let config = env.start().await?;
    let client = Client::try_from(config.clone())?;
    ensure_namespace(&client, TEST_NAMESPACE).await?;

    let install = env.webhook_install_options();
    let options = ManagerOptions {
        host: install.local_serving_host.clone(),
        port: install.local_serving_port,
        cert_dir: install.cert_dir()?.to_path_buf(),
        settings: WebhookSettings::from_env(),
    };
    let cert_dir = options.cert_dir.clone();
    let mut manager = Manager::new(config.clone(), options)?;
    let wiring = wire_up_webhook(client.clone(), &mut manager, &cert_dir)?;

    let mut serving = start_test_manager(cancel.child_token(), manager);
    serving.ready().await?;
    env.mark_serving()?;

    Ok(Bootstrapped {
        client,
        config,
        wiring,
        serving,
    })
}

async fn ensure_namespace(client: &Client, name: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&ns))
        .await?;
    info!(%name, "namespace ready");
    Ok(())
}
