use std::time::Duration;

use thiserror::Error;

use crate::testenv::EnvironmentState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("Cluster config inference error: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    #[error("Wait error: {0}")]
    Wait(#[from] kube::runtime::wait::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook server error: {0}")]
    Server(String),

    #[error("{operation} did not finish within {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Invalid environment transition: {from} -> {to}")]
    InvalidTransition {
        from: EnvironmentState,
        to: EnvironmentState,
    },
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }
    pub fn control_plane(msg: impl Into<String>) -> Self {
        Self::ControlPlane(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }
}
