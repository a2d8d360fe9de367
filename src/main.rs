//! application-webhook: serves the Application validating webhook.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use application_webhook::certs::default_cert_dir;
use application_webhook::manager::{Manager, ManagerOptions};
use application_webhook::settings::WebhookSettings;
use application_webhook::signals::setup_signal_handler;
use application_webhook::webhook::config::install_supplementary_resources;
use application_webhook::webhook::wire_up_webhook;

#[derive(Parser, Debug)]
#[command(
    name = "application-webhook",
    about = "Validating admission webhook for Application resources"
)]
struct Args {
    /// Address the webhook HTTPS server binds to.
    #[arg(long, default_value = "0.0.0.0", env = "WEBHOOK_HOST")]
    webhook_host: String,

    /// Port for the validating webhook HTTPS server.
    #[arg(long, default_value = "9443", env = "WEBHOOK_PORT")]
    webhook_port: u16,

    /// Directory holding tls.crt and tls.key; generated if empty.
    #[arg(long, env = "WEBHOOK_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Namespace the webhook Service is created in.
    #[arg(long, default_value = "default", env = "POD_NAMESPACE")]
    pod_namespace: String,

    /// Value of the `app` label on the webhook pods.
    #[arg(long, default_value = "default", env = "DEPLOYMENT_LABEL")]
    deployment_label: String,

    /// Apply the webhook Service and ValidatingWebhookConfiguration on startup.
    #[arg(long, env = "INSTALL_WEBHOOK_CONFIGURATION")]
    install_configuration: bool,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cancel = setup_signal_handler();
    let config = kube::Config::infer().await?;
    let cert_dir = args.cert_dir.unwrap_or_else(default_cert_dir);
    let settings = WebhookSettings {
        pod_namespace: args.pod_namespace,
        deployment_label: args.deployment_label,
    };

    info!(
        host = %args.webhook_host,
        port = args.webhook_port,
        ns = %settings.pod_namespace,
        "starting application-webhook"
    );

    let mut manager = Manager::new(
        config,
        ManagerOptions {
            host: args.webhook_host,
            port: args.webhook_port,
            cert_dir: cert_dir.clone(),
            settings: settings.clone(),
        },
    )?;
    let client = manager.client().clone();
    let wiring = wire_up_webhook(client.clone(), &mut manager, &cert_dir)?;

    if args.install_configuration {
        install_supplementary_resources(&client, &settings, &wiring.ca_bundle).await?;
    }

    manager.start(cancel).await?;
    Ok(())
}
