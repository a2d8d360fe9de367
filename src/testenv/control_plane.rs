//! Control-plane backends the test environment can run against.

use std::time::Duration;

use futures::future::try_join_all;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::Client;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::FIELD_MANAGER;

/// How long an applied CRD may take to report `Established`.
pub const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// A Kubernetes API server the environment can talk to.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bring the API server up with `crds` installed and return a config for
    /// reaching it. `flags` are extra kube-apiserver arguments, honoured where
    /// the backend launches the API server itself.
    async fn start(&mut self, crds: &[CustomResourceDefinition], flags: &[String]) -> Result<kube::Config>;

    /// Release whatever `start` acquired. Must be safe to call more than once.
    async fn stop(&mut self) -> Result<()>;
}

/// The cluster reachable through the ambient kubeconfig or in-cluster config.
#[derive(Default)]
pub struct ExistingCluster;

#[async_trait::async_trait]
impl ControlPlane for ExistingCluster {
    fn name(&self) -> &'static str {
        "existing-cluster"
    }

    async fn start(&mut self, crds: &[CustomResourceDefinition], flags: &[String]) -> Result<kube::Config> {
        if !flags.is_empty() {
            debug!(?flags, "existing cluster ignores kube-apiserver flags");
        }
        let config = kube::Config::infer().await?;
        info!(url = %config.cluster_url, "using existing cluster");
        if !crds.is_empty() {
            let client = Client::try_from(config.clone())?;
            install_crds(&client, crds).await?;
        }
        Ok(config)
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Server-side apply `crds` and wait for each to become established.
pub async fn install_crds(client: &Client, crds: &[CustomResourceDefinition]) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for crd in crds {
        let name = crd
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::config("CRD has no metadata.name"))?;
        info!(%name, "installing CRD");
        api.patch(name, &params, &Patch::Apply(crd)).await?;
    }
    let established = crds
        .iter()
        .filter_map(|crd| crd.metadata.name.as_deref())
        .map(|name| await_condition(api.clone(), name, conditions::is_crd_established()));
    tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, try_join_all(established))
        .await
        .map_err(|_| Error::Timeout {
            operation: "CRD establishment",
            timeout: CRD_ESTABLISH_TIMEOUT,
        })??;
    debug!(count = crds.len(), "CRDs established");
    Ok(())
}

/// Stand-in used when the crate is built without an ephemeral backend.
#[derive(Default)]
pub struct MissingEnvtest;

#[async_trait::async_trait]
impl ControlPlane for MissingEnvtest {
    fn name(&self) -> &'static str {
        "envtest-unavailable"
    }

    async fn start(&mut self, _crds: &[CustomResourceDefinition], _flags: &[String]) -> Result<kube::Config> {
        Err(Error::control_plane(
            "no ephemeral control plane available: build with `--features envtest` \
             or set TEST_USE_EXISTING_CLUSTER=true",
        ))
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "envtest")]
pub use self::ephemeral::EnvtestControlPlane;

#[cfg(feature = "envtest")]
mod ephemeral {
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use tokio::sync::oneshot;
    use tracing::{info, warn};

    use super::ControlPlane;
    use crate::error::{Error, Result};

    type Launched = std::result::Result<Kubeconfig, String>;

    /// An etcd + kube-apiserver pair started by envtest.
    ///
    /// The envtest server lives on its own OS thread for its whole lifetime;
    /// dropping it there shuts the processes down.
    #[derive(Default)]
    pub struct EnvtestControlPlane {
        stop_tx: Option<mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    #[async_trait::async_trait]
    impl ControlPlane for EnvtestControlPlane {
        fn name(&self) -> &'static str {
            "envtest"
        }

        async fn start(&mut self, crds: &[CustomResourceDefinition], flags: &[String]) -> Result<kube::Config> {
            if self.thread.is_some() {
                return Err(Error::control_plane("envtest control plane already started"));
            }
            if !flags.is_empty() {
                // envtest launches kube-apiserver with its own argument set.
                warn!(?flags, "envtest does not accept extra kube-apiserver flags");
            }

            let crds = crds.to_vec();
            let (ready_tx, ready_rx) = oneshot::channel::<Launched>();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let thread = std::thread::Builder::new()
                .name("envtest".to_string())
                .spawn(move || match launch(crds) {
                    Ok((server, kubeconfig)) => {
                        if ready_tx.send(Ok(kubeconfig)).is_ok() {
                            // Returns on stop or when the sender is dropped.
                            let _ = stop_rx.recv();
                        }
                        drop(server);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })?;
            self.stop_tx = Some(stop_tx);
            self.thread = Some(thread);

            let kubeconfig = ready_rx
                .await
                .map_err(|_| Error::control_plane("envtest thread exited during startup"))?
                .map_err(Error::ControlPlane)?;
            let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
            info!(url = %config.cluster_url, "envtest control plane started");
            Ok(config)
        }

        async fn stop(&mut self) -> Result<()> {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            let Some(thread) = self.thread.take() else {
                return Ok(());
            };
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| Error::control_plane(format!("envtest join task failed: {e}")))?
                .map_err(|_| Error::control_plane("envtest thread panicked"))?;
            info!("envtest control plane stopped");
            Ok(())
        }
    }

    fn launch(crds: Vec<CustomResourceDefinition>) -> std::result::Result<(envtest::Server, Kubeconfig), String> {
        let mut env = envtest::Environment::default();
        let env = env
            .with_crds(crds)
            .map_err(|e| format!("failed to configure CRDs: {e:?}"))?;
        let server = env
            .create()
            .map_err(|e| format!("failed to start envtest server: {e:?}"))?;
        let kubeconfig = server
            .kubeconfig()
            .map_err(|e| format!("failed to get kubeconfig: {e:?}"))?;
        Ok((server, kubeconfig))
    }
}

/// The ephemeral backend if compiled in, otherwise [`MissingEnvtest`].
pub fn ephemeral_control_plane() -> Box<dyn ControlPlane> {
    #[cfg(feature = "envtest")]
    {
        Box::new(EnvtestControlPlane::default())
    }
    #[cfg(not(feature = "envtest"))]
    {
        Box::new(MissingEnvtest)
    }
}
