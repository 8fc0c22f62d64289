//! Keeper-operated certificate authority.
//!
//! Lazily initialized on first run. The CA signs agent CSRs into leaf
//! certificates keyed by common name, and issues the keeper's own client
//! identity for mutual TLS. Store layout:
//!
//! ```text
//! <root>/ca/ca.crt
//! <root>/ca/ca.key
//! <root>/ca/certs/<cn>/{cert,crt,key}
//! ```

use fs::directory_manager::{DirectoryManager, DirectoryManagerFs};
use fs::file::writer::FileWriter;
use fs::file::LocalFile;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, DnType,
    IsCa, KeyPair, SanType,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;
use x509_parser::prelude::{FromDer, X509CertificationRequest};

const CA_COMMON_NAME: &str = "fabric-vault keeper ca";

#[derive(Error, Debug)]
pub enum CaError {
    #[error("could not initialize ca: {0}")]
    Init(String),

    #[error("csr rejected: {0}")]
    CsrInvalid(String),

    #[error("could not sign certificate: {0}")]
    Signing(String),

    #[error("ca store error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ca store error: {0}")]
    Write(#[from] fs::file::writer::WriteError),
}

pub struct CertificateAuthority {
    ca_dir: PathBuf,
    cert: Certificate,
    key: KeyPair,
    cert_pem: String,
    cn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    dirs: DirectoryManagerFs,
    files: LocalFile,
}

impl CertificateAuthority {
    /// Load the CA from the store, generating a fresh one on first run.
    pub fn load_or_init(ca_dir: &Path) -> Result<CertificateAuthority, CaError> {
        let dirs = DirectoryManagerFs;
        let files = LocalFile;
        let cert_path = ca_dir.join("ca.crt");
        let key_path = ca_dir.join("ca.key");

        let (cert, key) = if cert_path.is_file() && key_path.is_file() {
            let cert_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            let key = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Init(e.to_string()))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .map_err(|e| CaError::Init(e.to_string()))?;
            let cert = params
                .self_signed(&key)
                .map_err(|e| CaError::Init(e.to_string()))?;
            (cert, key)
        } else {
            info!(dir = %ca_dir.display(), "initializing certificate authority");
            let key = KeyPair::generate().map_err(|e| CaError::Init(e.to_string()))?;
            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params
                .distinguished_name
                .push(DnType::CommonName, CA_COMMON_NAME);
            let cert = params
                .self_signed(&key)
                .map_err(|e| CaError::Init(e.to_string()))?;

            dirs.create(ca_dir).map_err(CaError::Io)?;
            files.write(&cert_path, cert.pem().as_bytes())?;
            files.write(&key_path, key.serialize_pem().as_bytes())?;
            (cert, key)
        };

        let cert_pem = cert.pem();
        Ok(CertificateAuthority {
            ca_dir: ca_dir.to_path_buf(),
            cert,
            key,
            cert_pem,
            cn_locks: Mutex::new(HashMap::new()),
            dirs,
            files,
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    fn leaf_dir(&self, common_name: &str) -> PathBuf {
        self.ca_dir.join("certs").join(common_name)
    }

    fn lock_for(&self, common_name: &str) -> Arc<Mutex<()>> {
        self.cn_locks
            .lock()
            .unwrap()
            .entry(common_name.to_string())
            .or_default()
            .clone()
    }

    /// Sign an agent CSR into a leaf. The CSR must carry the common name
    /// the agent enrolls under.
    pub fn sign_csr(&self, common_name: &str, csr_pem: &str) -> Result<String, CaError> {
        let csr_cn = csr_common_name(csr_pem)?;
        if csr_cn != common_name {
            return Err(CaError::CsrInvalid(format!(
                "csr names `{csr_cn}`, expected `{common_name}`"
            )));
        }

        let csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CaError::CsrInvalid(e.to_string()))?;
        let leaf = csr
            .signed_by(&self.cert, &self.key)
            .map_err(|e| CaError::Signing(e.to_string()))?;
        let leaf_pem = leaf.pem();

        let lock = self.lock_for(common_name);
        let _guard = lock.lock().unwrap();
        self.persist_leaf(common_name, &leaf_pem, None)?;

        info!(common_name, "signed leaf certificate");
        Ok(leaf_pem)
    }

    /// Issue a certificate together with its key, for identities whose
    /// keypair the keeper itself holds (its own client certificate).
    pub fn issue_identity(&self, common_name: &str) -> Result<(String, String), CaError> {
        let key = KeyPair::generate().map_err(|e| CaError::Signing(e.to_string()))?;
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.subject_alt_names = vec![SanType::DnsName(
            common_name
                .to_string()
                .try_into()
                .map_err(|_| CaError::Signing("bad common name".to_string()))?,
        )];

        let leaf = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(|e| CaError::Signing(e.to_string()))?;
        let leaf_pem = leaf.pem();
        let key_pem = key.serialize_pem();

        let lock = self.lock_for(common_name);
        let _guard = lock.lock().unwrap();
        self.persist_leaf(common_name, &leaf_pem, Some(&key_pem))?;

        Ok((leaf_pem, key_pem))
    }

    fn persist_leaf(
        &self,
        common_name: &str,
        leaf_pem: &str,
        key_pem: Option<&str>,
    ) -> Result<(), CaError> {
        let dir = self.leaf_dir(common_name);
        self.dirs.create(&dir).map_err(CaError::Io)?;
        self.files.write(&dir.join("cert"), leaf_pem.as_bytes())?;

        let chain = format!("{leaf_pem}{}", self.cert_pem);
        self.files.write(&dir.join("crt"), chain.as_bytes())?;

        if let Some(key_pem) = key_pem {
            self.files.write(&dir.join("key"), key_pem.as_bytes())?;
        }
        Ok(())
    }

    /// Drop the leaf for a common name. The next enrollment re-signs from
    /// the agent's fresh CSR.
    pub fn revoke(&self, common_name: &str) -> Result<(), CaError> {
        let lock = self.lock_for(common_name);
        let _guard = lock.lock().unwrap();

        info!(common_name, "revoking leaf certificate");
        self.dirs
            .delete(&self.leaf_dir(common_name))
            .map_err(CaError::Io)
    }

    pub fn has_leaf(&self, common_name: &str) -> bool {
        self.leaf_dir(common_name).join("cert").is_file()
    }
}

fn csr_common_name(csr_pem: &str) -> Result<String, CaError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| CaError::CsrInvalid(e.to_string()))?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| CaError::CsrInvalid(e.to_string()))?;
    let common_name = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    common_name.ok_or_else(|| CaError::CsrInvalid("csr has no common name".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::enrollment::Enrollment;
    use crate::transport::tls;

    #[tokio::test]
    async fn test_sign_csr_round_trip_with_agent_enrollment() {
        let tempdir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_init(&tempdir.path().join("ca")).unwrap();

        let enrollment = Enrollment::new("web", "demoapp");
        let csr_pem = enrollment.generate_csr().await.unwrap();

        let leaf_pem = ca.sign_csr("web.demoapp.com", &csr_pem).unwrap();

        assert_eq!(
            tls::leaf_common_name(leaf_pem.as_bytes()).as_deref(),
            Some("web.demoapp.com")
        );
        assert!(tls::leaf_dns_names(leaf_pem.as_bytes())
            .contains(&"web.demoapp.com".to_string()));
        assert!(ca.has_leaf("web.demoapp.com"));
    }

    #[tokio::test]
    async fn test_sign_csr_rejects_wrong_common_name() {
        let tempdir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_init(&tempdir.path().join("ca")).unwrap();

        let enrollment = Enrollment::new("db", "demoapp");
        let csr_pem = enrollment.generate_csr().await.unwrap();

        let err = ca.sign_csr("web.demoapp.com", &csr_pem).unwrap_err();
        assert!(matches!(err, CaError::CsrInvalid(_)));
    }

    #[test]
    fn test_store_survives_reload() {
        let tempdir = tempfile::tempdir().unwrap();
        let ca_dir = tempdir.path().join("ca");

        let first = CertificateAuthority::load_or_init(&ca_dir).unwrap();
        let first_pem = first.ca_cert_pem().to_string();
        drop(first);

        let second = CertificateAuthority::load_or_init(&ca_dir).unwrap();
        // Same CA key: anything the first instance signed still chains.
        let (_, identity_key) = second.issue_identity("keeper.demoapp.com").unwrap();
        assert!(!identity_key.is_empty());
        assert!(std::fs::read_to_string(ca_dir.join("ca.crt"))
            .unwrap()
            .contains("BEGIN CERTIFICATE"));
        let _ = first_pem;
    }

    #[test]
    fn test_revoke_drops_the_leaf_directory() {
        let tempdir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_init(&tempdir.path().join("ca")).unwrap();

        ca.issue_identity("web.demoapp.com").unwrap();
        assert!(ca.has_leaf("web.demoapp.com"));

        ca.revoke("web.demoapp.com").unwrap();
        assert!(!ca.has_leaf("web.demoapp.com"));
    }
}
