//! Installing webhook configurations that point the API server at a
//! locally running webhook server.

use std::net::{IpAddr, TcpListener};
use std::path::{Path, PathBuf};

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::certs::ensure_serving_certs;
use crate::error::{Error, Result};
use crate::FIELD_MANAGER;

const CERT_DIR_PREFIX: &str = "envtest-serving-certs-";

/// Where the local webhook server listens and which configurations must be
/// rewritten to reach it.
#[derive(Debug)]
pub struct WebhookInstallOptions {
    pub validating_webhooks: Vec<ValidatingWebhookConfiguration>,
    /// Address the API server uses to call the webhook.
    pub local_serving_host: String,
    /// Allocated by [`prepare`](Self::prepare) when left at 0.
    pub local_serving_port: u16,
    /// Set by [`prepare`](Self::prepare) when not given.
    pub local_serving_cert_dir: Option<PathBuf>,
    /// Where a generated cert directory is created. System temp dir if unset.
    pub cert_dir_parent: Option<PathBuf>,
    /// PEM CA the API server trusts for the webhook.
    pub ca_data: Vec<u8>,
    temp_dir: Option<TempDir>,
    installed: Vec<String>,
}

impl Default for WebhookInstallOptions {
    fn default() -> Self {
        Self {
            validating_webhooks: Vec::new(),
            local_serving_host: "127.0.0.1".to_string(),
            local_serving_port: 0,
            local_serving_cert_dir: None,
            cert_dir_parent: None,
            ca_data: Vec::new(),
            temp_dir: None,
            installed: Vec::new(),
        }
    }
}

impl WebhookInstallOptions {
    /// Pick a port, create the cert directory and generate serving
    /// certificates for the local host.
    pub fn prepare(&mut self) -> Result<()> {
        if self.local_serving_port == 0 {
            self.local_serving_port = free_port(&self.local_serving_host)?;
        }
        if self.local_serving_cert_dir.is_none() {
            let mut builder = tempfile::Builder::new();
            builder.prefix(CERT_DIR_PREFIX);
            let dir = match &self.cert_dir_parent {
                Some(parent) => builder.tempdir_in(parent)?,
                None => builder.tempdir()?,
            };
            self.local_serving_cert_dir = Some(dir.path().to_path_buf());
            self.temp_dir = Some(dir);
        }
        let dir = self.cert_dir()?.to_path_buf();
        let hosts = vec![self.local_serving_host.clone(), "localhost".to_string()];
        let certs = ensure_serving_certs(&dir, &hosts)?;
        self.ca_data = certs.ca_bundle();
        debug!(
            host = %self.local_serving_host,
            port = self.local_serving_port,
            cert_dir = %dir.display(),
            "prepared local webhook serving"
        );
        Ok(())
    }

    pub fn cert_dir(&self) -> Result<&Path> {
        self.local_serving_cert_dir
            .as_deref()
            .ok_or_else(|| Error::config("webhook serving cert directory not prepared"))
    }

    /// `https://host:port` of the local webhook server.
    pub fn local_serving_url(&self) -> String {
        let host = match self.local_serving_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]"),
            _ => self.local_serving_host.clone(),
        };
        format!("https://{host}:{}", self.local_serving_port)
    }

    /// `vwc` with every service reference replaced by a URL on the local
    /// server, trusting [`ca_data`](Self::ca_data).
    pub fn modified(&self, vwc: &ValidatingWebhookConfiguration) -> ValidatingWebhookConfiguration {
        let base = self.local_serving_url();
        let mut vwc = vwc.clone();
        for webhook in vwc.webhooks.iter_mut().flatten() {
            let config = &mut webhook.client_config;
            if let Some(service) = config.service.take() {
                config.url = Some(format!("{base}{}", service.path.unwrap_or_default()));
            }
            config.ca_bundle = Some(ByteString(self.ca_data.clone()));
        }
        vwc
    }

    /// Apply the rewritten configurations.
    pub async fn install(&mut self, client: &Client) -> Result<()> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        for vwc in &self.validating_webhooks {
            let name = vwc
                .metadata
                .name
                .clone()
                .ok_or_else(|| Error::config("validating webhook configuration has no name"))?;
            api.patch(&name, &params, &Patch::Apply(&self.modified(vwc)))
                .await?;
            info!(%name, url = %self.local_serving_url(), "installed validating webhook configuration");
            if !self.installed.contains(&name) {
                self.installed.push(name);
            }
        }
        Ok(())
    }

    /// Delete what [`install`](Self::install) applied. Already deleted
    /// configurations are not an error.
    pub async fn uninstall(&mut self, client: &Client) -> Result<()> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
        let mut first_err = None;
        // Names leave the list only once deleted, so an interrupted call can be repeated.
        for name in self.installed.clone() {
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => debug!(%name, "deleted validating webhook configuration"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => {
                    warn!(%name, %e, "failed to delete validating webhook configuration");
                    first_err.get_or_insert(Error::from(e));
                    continue;
                }
            }
            self.installed.retain(|n| n != &name);
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn installed(&self) -> &[String] {
        &self.installed
    }

    /// Remove the cert directory if this instance created it.
    pub fn cleanup(&mut self) -> Result<()> {
        if let Some(dir) = self.temp_dir.take() {
            self.local_serving_cert_dir = None;
            dir.close()?;
        }
        Ok(())
    }
}

fn free_port(host: &str) -> Result<u16> {
    let ip: IpAddr = host
        .parse()
        .map_err(|e| Error::config(format!("local serving host {host:?} is not an IP address: {e}")))?;
    let listener = TcpListener::bind((ip, 0))?;
    Ok(listener.local_addr()?.port())
}
