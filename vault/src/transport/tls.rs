//! rustls configuration for the upgraded channel.
//!
//! Both sides anchor trust exclusively on the Keeper CA and both sides
//! check names, not just chains: the agent serves its enrolled leaf and
//! requires a client certificate that chains to the CA *and* carries the
//! keeper's expected common name; the keeper presents its own CA-issued
//! client certificate and expects the agent's certificate to carry the
//! enrolled common name `<component>.<app>.com`.

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
    ServerConfig, SignatureScheme,
};
use std::sync::Arc;
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

#[derive(Error, Debug)]
pub enum TlsSetupError {
    #[error("bad pem material: {0}")]
    Pem(String),

    #[error("no private key found in pem")]
    MissingKey,

    #[error("`{0}` is not a valid tls server name")]
    BadServerName(String),

    #[error("rustls rejected the configuration: {0}")]
    Config(String),
}

pub fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| TlsSetupError::Pem(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsSetupError::Pem("no certificates in pem".into()));
    }
    Ok(certs)
}

pub fn key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TlsSetupError::Pem(e.to_string()))?
        .ok_or(TlsSetupError::MissingKey)
}

fn root_store(ca_pem: &[u8]) -> Result<RootCertStore, TlsSetupError> {
    let mut roots = RootCertStore::empty();
    for cert in certs_from_pem(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| TlsSetupError::Config(e.to_string()))?;
    }
    Ok(roots)
}

/// Client verifier that layers a common-name check on top of the CA chain
/// verification. Chain-valid certificates for the wrong identity are
/// rejected during the handshake, before any frame is served.
#[derive(Debug)]
struct CommonNameClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    expected: String,
}

impl CommonNameClientVerifier {
    fn names_match(&self, end_entity: &CertificateDer<'_>) -> bool {
        der_common_name(end_entity.as_ref()).as_deref() == Some(self.expected.as_str())
            || der_dns_names(end_entity.as_ref())
                .iter()
                .any(|name| name == &self.expected)
    }
}

impl ClientCertVerifier for CommonNameClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let verified = self
            .inner
            .verify_client_cert(end_entity, intermediates, now)?;
        if !self.names_match(end_entity) {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName,
            ));
        }
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn client_verifier(
    ca_pem: &[u8],
    expected_client_name: &str,
) -> Result<Arc<dyn ClientCertVerifier>, TlsSetupError> {
    let roots = root_store(ca_pem)?;
    let inner = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsSetupError::Config(e.to_string()))?;
    Ok(Arc::new(CommonNameClientVerifier {
        inner,
        expected: expected_client_name.to_string(),
    }))
}

/// Agent-side config: serve the enrolled leaf, demand client certificates
/// chaining to the Keeper CA and carrying `expected_client_name`.
pub fn server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_pem: &[u8],
    expected_client_name: &str,
) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let verifier = client_verifier(ca_pem, expected_client_name)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs_from_pem(cert_pem)?, key_from_pem(key_pem)?)
        .map_err(|e| TlsSetupError::Config(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Keeper-side config: trust only the CA, present the keeper's client
/// certificate.
pub fn client_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_pem: &[u8],
) -> Result<Arc<ClientConfig>, TlsSetupError> {
    let roots = root_store(ca_pem)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs_from_pem(cert_pem)?, key_from_pem(key_pem)?)
        .map_err(|e| TlsSetupError::Config(e.to_string()))?;
    Ok(Arc::new(config))
}

/// The SNI name the keeper dials: the agent's enrolled common name, not
/// the address the TCP connection goes to.
pub fn server_name(common_name: &str) -> Result<ServerName<'static>, TlsSetupError> {
    ServerName::try_from(common_name.to_string())
        .map_err(|_| TlsSetupError::BadServerName(common_name.to_string()))
}

/// Subject common name of a DER-encoded certificate.
pub fn der_common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    common_name
}

/// DNS entries of a DER-encoded certificate's subject alternative name
/// extension.
pub fn der_dns_names(der: &[u8]) -> Vec<String> {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return Vec::new();
    };
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            x509_parser::extensions::GeneralName::DNSName(dns) => Some(dns.to_string()),
            _ => None,
        })
        .collect()
}

/// Common name of the first certificate in a PEM bundle.
pub fn leaf_common_name(cert_pem: &[u8]) -> Option<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem).ok()?;
    der_common_name(&pem.contents)
}

/// DNS entries of the leaf's subject alternative name extension.
pub fn leaf_dns_names(cert_pem: &[u8]) -> Vec<String> {
    match x509_parser::pem::parse_x509_pem(cert_pem) {
        Ok((_, pem)) => der_dns_names(&pem.contents),
        Err(_) => Vec::new(),
    }
}

/// Issuer common name of the first certificate in a PEM bundle.
pub fn leaf_issuer(cert_pem: &[u8]) -> Option<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem).ok()?;
    let cert = pem.parse_x509().ok()?;
    let issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    issuer
}
