pub mod certs;
pub mod crd;
pub mod error;
pub mod manager;
pub mod settings;
pub mod signals;
pub mod testenv;
pub mod webhook;

/// Field manager used for every server-side apply.
pub const FIELD_MANAGER: &str = "application-webhook";
