//! Serving certificates for the webhook server.
//!
//! A cert directory holds three PEM files: `ca.crt` (handed to the API server
//! as the webhook `caBundle`), `tls.crt` and `tls.key` (loaded by the HTTPS
//! listener). Certificates are issued by a throwaway CA generated alongside
//! them, the same shape controller-runtime's envtest produces.

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, Ia5String,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const CA_CERT_NAME: &str = "ca.crt";
pub const TLS_CERT_NAME: &str = "tls.crt";
pub const TLS_KEY_NAME: &str = "tls.key";

/// Serving certificates stay valid for a week, long enough for any test run.
const VALIDITY_DAYS: i64 = 7;

/// PEM-encoded CA + serving certificate pair.
#[derive(Clone, Debug)]
pub struct ServingCerts {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl ServingCerts {
    /// Generate a CA and a serving certificate valid for `hosts`.
    /// Hosts that parse as IP addresses become IP SANs, the rest DNS SANs.
    pub fn generate(hosts: &[String]) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::certificate("at least one serving host is required"));
        }
        let (not_before, not_after) = validity();

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = distinguished_name("application-webhook-ca");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_before = not_before;
        ca_params.not_after = not_after;

        let ca_key = KeyPair::generate()
            .map_err(|e| Error::certificate(format!("failed to generate CA key: {e}")))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| Error::certificate(format!("failed to create CA cert: {e}")))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&hosts[0]);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = hosts
            .iter()
            .map(|host| subject_alt_name(host))
            .collect::<Result<Vec<_>>>()?;

        let key = KeyPair::generate()
            .map_err(|e| Error::certificate(format!("failed to generate serving key: {e}")))?;
        let cert = params
            .signed_by(&key, &ca_cert, &ca_key)
            .map_err(|e| Error::certificate(format!("failed to sign serving cert: {e}")))?;

        Ok(Self {
            ca_pem: ca_cert.pem(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Load certificates previously written to `dir`.
    /// Returns `Ok(None)` when any of the three files is absent.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let paths = [
            dir.join(CA_CERT_NAME),
            dir.join(TLS_CERT_NAME),
            dir.join(TLS_KEY_NAME),
        ];
        if paths.iter().any(|p| !p.is_file()) {
            return Ok(None);
        }
        let [ca, cert, key] = paths;
        Ok(Some(Self {
            ca_pem: std::fs::read_to_string(ca)?,
            cert_pem: std::fs::read_to_string(cert)?,
            key_pem: std::fs::read_to_string(key)?,
        }))
    }

    /// Write the three PEM files into `dir`, creating it if needed.
    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(CA_CERT_NAME), &self.ca_pem)?;
        std::fs::write(dir.join(TLS_CERT_NAME), &self.cert_pem)?;
        std::fs::write(dir.join(TLS_KEY_NAME), &self.key_pem)?;
        debug!(dir = %dir.display(), "wrote serving certificates");
        Ok(())
    }

    /// The CA bundle as raw bytes, ready for `clientConfig.caBundle`.
    pub fn ca_bundle(&self) -> Vec<u8> {
        self.ca_pem.as_bytes().to_vec()
    }
}

/// Reuse the certificates in `dir` if present, otherwise generate and persist
/// a fresh set for `hosts`.
pub fn ensure_serving_certs(dir: &Path, hosts: &[String]) -> Result<ServingCerts> {
    if let Some(certs) = ServingCerts::load(dir)? {
        debug!(dir = %dir.display(), "reusing serving certificates");
        return Ok(certs);
    }
    let certs = ServingCerts::generate(hosts)?;
    certs.write(dir)?;
    info!(dir = %dir.display(), "generated serving certificates");
    Ok(certs)
}

/// Default cert directory used by the webhook binary:
/// `<tmp>/k8s-webhook-server/application-serving-certs`.
pub fn default_cert_dir() -> PathBuf {
    std::env::temp_dir()
        .join("k8s-webhook-server")
        .join("application-serving-certs")
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

fn subject_alt_name(host: &str) -> Result<SanType> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(host.to_string())
        .map(SanType::DnsName)
        .map_err(|e| Error::certificate(format!("invalid DNS name '{host}': {e}")))
}

fn validity() -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    // Backdated to tolerate clock skew.
    (
        now - time::Duration::hours(1),
        now + time::Duration::days(VALIDITY_DAYS),
    )
}
