//! Test environment: a control plane with the webhook configurations
//! installed, pointing at a locally served webhook.
//!
//! [`TestEnvironment`] moves through a fixed set of lifecycle states; the
//! legal moves are listed in [`TRANSITIONS`]:
//!
//! ```text
//! NotStarted ──► Starting ──► Running ──► Stopping ──► Stopped
//!      │             │                       ▲
//!      └─────────────┴───────────────────────┘
//! ```
//!
//! [`fixture::SuiteFixture`] layers the manager and webhook server on top.

pub mod control_plane;
pub mod crds;
pub mod fixture;
pub mod webhook_install;

use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Client, CustomResourceExt};
use tracing::{info, warn};

use crate::crd::application::Application;
use crate::error::{Error, Result};
use crate::settings;

use self::control_plane::{ephemeral_control_plane, ControlPlane, ExistingCluster};
use self::crds::{load_crds, merge_crds};
use self::webhook_install::WebhookInstallOptions;

pub use self::fixture::SuiteFixture;

/// Upper bound on suite setup.
pub const START_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound on each teardown step.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Relative to the project root.
pub const CRD_DIRECTORY: &str = "deploy/crds";

/// Arguments every ephemeral kube-apiserver is started with.
// envtest cannot take these yet: its Environment launches kube-apiserver with
// a fixed argument set, so they are validated and logged only.
pub const DEFAULT_KUBE_APISERVER_FLAGS: &[&str] = &[
    "--advertise-address=127.0.0.1",
    "--service-cluster-ip-range=10.0.0.0/24",
    "--allow-privileged=true",
];

/// Admission plugins the suite switches off: none of them are needed to
/// exercise the webhook and several expect controllers envtest does not run.
pub const SUITE_DISABLED_ADMISSION_PLUGINS: &[&str] = &[
    "NamespaceLifecycle",
    "LimitRanger",
    "ServiceAccount",
    "TaintNodesByCondition",
    "Priority",
    "DefaultTolerationSeconds",
    "DefaultStorageClass",
    "StorageObjectInUseProtection",
    "PersistentVolumeClaimResize",
    "ResourceQuota",
];

pub fn disable_admission_plugins_flag() -> String {
    format!(
        "--disable-admission-plugins={}",
        SUITE_DISABLED_ADMISSION_PLUGINS.join(",")
    )
}

// ── State machine ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvironmentState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "NotStarted",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

pub struct Transition {
    pub from: EnvironmentState,
    pub to: EnvironmentState,
}

use EnvironmentState::*;

/// Every legal lifecycle move. Nothing leaves `Stopped`.
pub static TRANSITIONS: &[Transition] = &[
    Transition { from: NotStarted, to: Starting },
    Transition { from: Starting, to: Running },
    // A failed or abandoned start still has to release what it acquired.
    Transition { from: Starting, to: Stopping },
    Transition { from: NotStarted, to: Stopping },
    Transition { from: Running, to: Stopping },
    Transition { from: Stopping, to: Stopped },
];

pub fn can_transition(from: EnvironmentState, to: EnvironmentState) -> bool {
    TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
}

// ── Options ─────────────────────────────────────────────────────────────────

/// What the control plane is started with.
#[derive(Clone, Debug, Default)]
pub struct EnvironmentOptions {
    /// Directories scanned for CRD manifests.
    pub crd_directory_paths: Vec<PathBuf>,
    /// CRDs installed in addition to those found on disk.
    pub crds: Vec<CustomResourceDefinition>,
    pub kube_api_server_flags: Vec<String>,
    pub use_existing_cluster: bool,
    pub error_if_crd_path_missing: bool,
}

impl EnvironmentOptions {
    /// Target the ambient cluster as-is: no CRDs, no flags.
    pub fn existing_cluster() -> Self {
        Self {
            use_existing_cluster: true,
            ..Default::default()
        }
    }

    /// An ephemeral control plane with the Application CRD and the suite's
    /// admission plugin set.
    pub fn ephemeral(project_root: &Path) -> Self {
        let mut flags: Vec<String> = DEFAULT_KUBE_APISERVER_FLAGS
            .iter()
            .map(|f| f.to_string())
            .collect();
        flags.push(disable_admission_plugins_flag());
        Self {
            crd_directory_paths: vec![project_root.join(CRD_DIRECTORY)],
            crds: vec![Application::crd()],
            kube_api_server_flags: flags,
            use_existing_cluster: false,
            error_if_crd_path_missing: false,
        }
    }

    pub fn for_suite(use_existing_cluster: bool, project_root: &Path) -> Self {
        if use_existing_cluster {
            Self::existing_cluster()
        } else {
            Self::ephemeral(project_root)
        }
    }

    /// Options chosen by `TEST_USE_EXISTING_CLUSTER`.
    pub fn from_env(project_root: &Path) -> Self {
        Self::for_suite(settings::use_existing_cluster(), project_root)
    }

    pub fn validate_flags(&self) -> Result<()> {
        for flag in &self.kube_api_server_flags {
            if !flag.starts_with("--") || flag.len() <= 2 {
                return Err(Error::config(format!("invalid kube-apiserver flag {flag:?}")));
            }
        }
        Ok(())
    }
}

// ── Environment ─────────────────────────────────────────────────────────────

pub struct TestEnvironment {
    options: EnvironmentOptions,
    webhook_install_options: WebhookInstallOptions,
    control_plane: Box<dyn ControlPlane>,
    state: EnvironmentState,
    config: Option<kube::Config>,
    client: Option<Client>,
}

impl TestEnvironment {
    /// Pick the backend from `options.use_existing_cluster`.
    pub fn new(options: EnvironmentOptions) -> Self {
        let control_plane: Box<dyn ControlPlane> = if options.use_existing_cluster {
            Box::new(ExistingCluster)
        } else {
            ephemeral_control_plane()
        };
        Self::with_control_plane(options, control_plane)
    }

    pub fn with_control_plane(options: EnvironmentOptions, control_plane: Box<dyn ControlPlane>) -> Self {
        Self {
            options,
            webhook_install_options: WebhookInstallOptions::default(),
            control_plane,
            state: NotStarted,
            config: None,
            client: None,
        }
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    pub fn options(&self) -> &EnvironmentOptions {
        &self.options
    }

    pub fn control_plane_name(&self) -> &'static str {
        self.control_plane.name()
    }

    pub fn webhook_install_options(&self) -> &WebhookInstallOptions {
        &self.webhook_install_options
    }

    /// Config for the running control plane.
    pub fn config(&self) -> Option<&kube::Config> {
        self.config.as_ref()
    }

    /// Queue `vwc` for installation. Only possible before [`start`](Self::start).
    pub fn register_validating_webhook(&mut self, vwc: ValidatingWebhookConfiguration) -> Result<()> {
        if self.state != NotStarted {
            return Err(Error::config(format!(
                "cannot register webhook configuration while {}",
                self.state
            )));
        }
        self.webhook_install_options.validating_webhooks.push(vwc);
        Ok(())
    }

    fn transition(&mut self, to: EnvironmentState) -> Result<()> {
        if !can_transition(self.state, to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!(from = %self.state, %to, "test environment transition");
        self.state = to;
        Ok(())
    }

    /// Start the control plane, install CRDs and webhook configurations, and
    /// return a config for the API server.
    ///
    /// The environment stays in `Starting` until [`mark_serving`](Self::mark_serving)
    /// reports the webhook server bound. On error call [`stop`](Self::stop)
    /// to release what was acquired.
    pub async fn start(&mut self) -> Result<kube::Config> {
        self.transition(Starting)?;
        self.start_inner().await
    }

    /// Record that the webhook server is listening on the local serving
    /// port, completing the start.
    pub fn mark_serving(&mut self) -> Result<()> {
        if self.client.is_none() {
            return Err(Error::config("webhook configurations are not installed"));
        }
        self.transition(Running)
    }

    /// Replace the serving options. Only possible before [`start`](Self::start).
    pub fn with_webhook_install_options(mut self, options: WebhookInstallOptions) -> Self {
        if self.state == NotStarted {
            self.webhook_install_options = options;
        }
        self
    }

    async fn start_inner(&mut self) -> Result<kube::Config> {
        self.options.validate_flags()?;
        let crds = merge_crds(
            load_crds(
                &self.options.crd_directory_paths,
                self.options.error_if_crd_path_missing,
            )?,
            self.options.crds.iter().cloned(),
        );
        self.webhook_install_options.prepare()?;

        info!(
            backend = self.control_plane.name(),
            crds = crds.len(),
            flags = ?self.options.kube_api_server_flags,
            "starting control plane"
        );
        let config = self
            .control_plane
            .start(&crds, &self.options.kube_api_server_flags)
            .await?;
        let client = Client::try_from(config.clone())?;
        self.config = Some(config.clone());
        self.client = Some(client.clone());

        self.webhook_install_options.install(&client).await?;
        Ok(config)
    }

    /// Remove installed webhook configurations, stop the control plane and
    /// delete the serving cert directory.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned. Stopping a stopped environment does nothing, and a stop that
    /// was interrupted picks up where it left off.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            Stopped => return Ok(()),
            Stopping => info!("resuming interrupted test environment stop"),
            _ => self.transition(Stopping)?,
        }
        let mut first_err = None;

        if let Some(client) = self.client.clone() {
            let uninstall = self.webhook_install_options.uninstall(&client);
            match tokio::time::timeout(STOP_TIMEOUT, uninstall).await {
                Ok(result) => keep_first(&mut first_err, "uninstall webhooks", result),
                Err(_) => keep_first(&mut first_err, "uninstall webhooks", Err(timeout("webhook uninstall"))),
            }
            self.client = None;
        }
        match tokio::time::timeout(STOP_TIMEOUT, self.control_plane.stop()).await {
            Ok(result) => keep_first(&mut first_err, "stop control plane", result),
            Err(_) => keep_first(&mut first_err, "stop control plane", Err(timeout("control plane stop"))),
        }
        keep_first(
            &mut first_err,
            "remove cert directory",
            self.webhook_install_options.cleanup(),
        );
        self.config = None;

        self.transition(Stopped)?;
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        if matches!(self.state, Starting | Running | Stopping) {
            warn!(state = %self.state, "test environment dropped without stop()");
        }
    }
}

fn timeout(operation: &'static str) -> Error {
    Error::Timeout {
        operation,
        timeout: STOP_TIMEOUT,
    }
}

/// Log a failed teardown step and remember it if it is the first.
pub(crate) fn keep_first(slot: &mut Option<Error>, step: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(%step, %e, "teardown step failed");
        slot.get_or_insert(e);
    }
}
