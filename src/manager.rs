//! Manager handle: owns the cluster client and the webhook server, and runs
//! the server until cancelled.

use std::path::PathBuf;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::certs::default_cert_dir;
use crate::error::Result;
use crate::settings::WebhookSettings;
use crate::webhook::{ServingTask, WebhookServer, WEBHOOK_PORT};

/// Where and how the manager's webhook server listens.
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Bind address; must be an IP literal.
    pub host: String,
    pub port: u16,
    /// Directory holding `tls.crt` and `tls.key`.
    pub cert_dir: PathBuf,
    pub settings: WebhookSettings,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: WEBHOOK_PORT,
            cert_dir: default_cert_dir(),
            settings: WebhookSettings::default(),
        }
    }
}

pub struct Manager {
    client: Client,
    options: ManagerOptions,
    webhook_server: WebhookServer,
}

impl Manager {
    /// Build a manager against the cluster described by `config`.
    ///
    /// Fails if the client cannot be built or the host is not an IP address.
    pub fn new(config: kube::Config, options: ManagerOptions) -> Result<Self> {
        let client = Client::try_from(config)?;
        Self::with_client(client, options)
    }

    pub fn with_client(client: Client, options: ManagerOptions) -> Result<Self> {
        let webhook_server = WebhookServer::new(&options.host, options.port, &options.cert_dir);
        webhook_server.socket_addr()?;
        Ok(Self {
            client,
            options,
            webhook_server,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn webhook_server(&self) -> &WebhookServer {
        &self.webhook_server
    }

    pub fn webhook_server_mut(&mut self) -> &mut WebhookServer {
        &mut self.webhook_server
    }

    /// Serve until `cancel` fires. Returns early with an error if the server
    /// cannot bind.
    pub async fn start(self, cancel: CancellationToken) -> Result<()> {
        let mut task = self.webhook_server.spawn(cancel);
        let addr = task.ready().await?;
        info!(%addr, paths = ?self.webhook_server.registered_paths(), "manager started");
        task.stopped().await
    }
}

/// Start `manager` on a background task without blocking the caller.
///
/// The returned task reports readiness and completion; setup code awaits
/// `ready()` before running tests and `stopped()` during teardown.
pub fn start_test_manager(cancel: CancellationToken, manager: Manager) -> ServingTask {
    info!(
        host = %manager.options.host,
        port = manager.options.port,
        "starting test manager"
    );
    manager.webhook_server.spawn(cancel)
}
