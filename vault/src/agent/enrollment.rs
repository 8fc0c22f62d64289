//! Agent-side certificate enrollment.
//!
//! `generate_csr` makes a fresh RSA-2048 key and a CSR whose CN and SAN
//! are both `<component>.<app>.com`. The key stays in memory until the
//! keeper pushes back the signed leaf and the CA anchor, at which point
//! `upgrade_to_ssl` can assemble the mutual-TLS listener config.

use crate::transport::tls;
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::ServerConfig;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("could not produce csr: {0}")]
    CsrInvalid(String),

    #[error("certificate install failed: {0}")]
    CertInstallFailed(String),

    #[error("tls upgrade failed: {0}")]
    TlsUpgradeFailed(String),
}

#[derive(Default)]
struct Staged {
    key_pem: Option<String>,
    cert_pem: Option<Vec<u8>>,
    ca_pem: Option<Vec<u8>>,
}

pub struct Enrollment {
    common_name: String,
    keeper_name: String,
    staged: Mutex<Staged>,
}

impl Enrollment {
    pub fn new(component_name: &str, app_name: &str) -> Self {
        Enrollment {
            common_name: format!("{component_name}.{app_name}.com"),
            keeper_name: format!("keeper.{app_name}.com"),
            staged: Mutex::new(Staged::default()),
        }
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Client identity the upgraded listener accepts: the application's
    /// keeper.
    pub fn keeper_name(&self) -> &str {
        &self.keeper_name
    }

    pub fn is_enrolled(&self) -> bool {
        let staged = self.staged.lock().unwrap();
        staged.key_pem.is_some() && staged.cert_pem.is_some() && staged.ca_pem.is_some()
    }

    /// Generate the enrollment key and CSR. The private key is held only
    /// in memory; nothing touches the disk.
    pub async fn generate_csr(&self) -> Result<String, EnrollmentError> {
        let common_name = self.common_name.clone();
        info!(%common_name, "generating csr");

        let (key_pem, csr_pem) = tokio::task::spawn_blocking(move || {
            build_csr(&common_name)
        })
        .await
        .map_err(|e| EnrollmentError::CsrInvalid(e.to_string()))??;

        self.staged.lock().unwrap().key_pem = Some(key_pem);
        Ok(csr_pem)
    }

    /// Stage the CA-signed leaf.
    pub fn install_cert(&self, cert_pem: &[u8]) -> Result<(), EnrollmentError> {
        let issuer = tls::leaf_issuer(cert_pem)
            .ok_or_else(|| EnrollmentError::CertInstallFailed("unparseable leaf".to_string()))?;
        let names = tls::leaf_dns_names(cert_pem);
        info!(%issuer, alt_names = ?names, "installing certificate");

        if !names.contains(&self.common_name) {
            return Err(EnrollmentError::CertInstallFailed(format!(
                "leaf names {names:?} do not cover `{}`",
                self.common_name
            )));
        }

        self.staged.lock().unwrap().cert_pem = Some(cert_pem.to_vec());
        Ok(())
    }

    /// Stage the keeper CA as the trust anchor for client certificates.
    pub fn install_ca_cert(&self, cert_pem: &[u8]) -> Result<(), EnrollmentError> {
        info!("installing ca certificate");
        tls::certs_from_pem(cert_pem)
            .map_err(|e| EnrollmentError::CertInstallFailed(e.to_string()))?;
        self.staged.lock().unwrap().ca_pem = Some(cert_pem.to_vec());
        Ok(())
    }

    /// Assemble the mutual-TLS server config from the staged material.
    /// Client certificates must chain to the staged CA and name the
    /// application's keeper.
    pub fn tls_server_config(&self) -> Result<Arc<ServerConfig>, EnrollmentError> {
        let staged = self.staged.lock().unwrap();
        let key_pem = staged
            .key_pem
            .as_ref()
            .ok_or_else(|| EnrollmentError::TlsUpgradeFailed("no key generated".to_string()))?;
        let cert_pem = staged
            .cert_pem
            .as_ref()
            .ok_or_else(|| EnrollmentError::TlsUpgradeFailed("no certificate installed".to_string()))?;
        let ca_pem = staged
            .ca_pem
            .as_ref()
            .ok_or_else(|| EnrollmentError::TlsUpgradeFailed("no ca installed".to_string()))?;

        tls::server_config(cert_pem, key_pem.as_bytes(), ca_pem, &self.keeper_name)
            .map_err(|e| EnrollmentError::TlsUpgradeFailed(e.to_string()))
    }
}

fn build_csr(common_name: &str) -> Result<(String, String), EnrollmentError> {
    let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
        .map_err(|e| EnrollmentError::CsrInvalid(e.to_string()))?;
    let key_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| EnrollmentError::CsrInvalid(e.to_string()))?
        .to_string();

    let key_pair =
        KeyPair::from_pem(&key_pem).map_err(|e| EnrollmentError::CsrInvalid(e.to_string()))?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.subject_alt_names = vec![SanType::DnsName(
        common_name
            .to_string()
            .try_into()
            .map_err(|_| EnrollmentError::CsrInvalid("bad common name".to_string()))?,
    )];

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| EnrollmentError::CsrInvalid(e.to_string()))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| EnrollmentError::CsrInvalid(e.to_string()))?;

    Ok((key_pem, csr_pem))
}
