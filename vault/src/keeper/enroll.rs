//! Keeper side of agent enrollment: CSR in, signed leaf and CA anchor
//! out, then the TLS upgrade.

use super::ca::CertificateAuthority;
use crate::agent::api::AgentApi;
use thiserror::Error;
use tracing::info;

/// Enrollment failures abort the current cycle for that agent only; the
/// next polling cycle retries from scratch.
#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("csr invalid for `{common_name}`: {message}")]
    CsrInvalid {
        common_name: String,
        message: String,
    },

    #[error("certificate install failed for `{common_name}`: {message}")]
    CertInstallFailed {
        common_name: String,
        message: String,
    },

    #[error("tls upgrade failed for `{common_name}`: {message}")]
    TlsUpgradeFailed {
        common_name: String,
        message: String,
    },
}

/// Run the enrollment conversation with a connected agent. All steps are
/// request/response; none may be sent one-way.
pub async fn enroll_agent(
    api: &mut dyn AgentApi,
    ca: &CertificateAuthority,
    common_name: &str,
) -> Result<(), EnrollError> {
    info!(common_name, "enrolling agent");

    let csr = api
        .generate_csr()
        .await
        .map_err(|e| EnrollError::CsrInvalid {
            common_name: common_name.to_string(),
            message: e.to_string(),
        })?;

    // Re-enrollment drops the old leaf and signs the fresh CSR.
    if ca.has_leaf(common_name) {
        ca.revoke(common_name).map_err(|e| EnrollError::CsrInvalid {
            common_name: common_name.to_string(),
            message: e.to_string(),
        })?;
    }

    let leaf = ca
        .sign_csr(common_name, &csr)
        .map_err(|e| EnrollError::CsrInvalid {
            common_name: common_name.to_string(),
            message: e.to_string(),
        })?;

    api.install_cert(leaf)
        .await
        .map_err(|e| EnrollError::CertInstallFailed {
            common_name: common_name.to_string(),
            message: e.to_string(),
        })?;

    api.install_ca_cert(ca.ca_cert_pem().to_string())
        .await
        .map_err(|e| EnrollError::CertInstallFailed {
            common_name: common_name.to_string(),
            message: e.to_string(),
        })?;

    api.upgrade_to_ssl()
        .await
        .map_err(|e| EnrollError::TlsUpgradeFailed {
            common_name: common_name.to_string(),
            message: e.to_string(),
        })?;

    info!(common_name, "agent enrolled, listener moving to tls");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::api::{AgentCallError, MockAgentApi};
    use crate::agent::enrollment::Enrollment;
    use crate::rpc::jsonrpc::RpcError;

    async fn real_csr() -> String {
        Enrollment::new("web", "demoapp")
            .generate_csr()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enrollment_happy_path_runs_all_steps() {
        let tempdir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_init(&tempdir.path().join("ca")).unwrap();
        let csr = real_csr().await;

        let mut api = MockAgentApi::new();
        api.expect_generate_csr()
            .times(1)
            .returning(move || Ok(csr.clone()));
        api.expect_install_cert()
            .withf(|pem| pem.contains("BEGIN CERTIFICATE"))
            .times(1)
            .returning(|_| Ok(()));
        api.expect_install_ca_cert()
            .withf(|pem| pem.contains("BEGIN CERTIFICATE"))
            .times(1)
            .returning(|_| Ok(()));
        api.expect_upgrade_to_ssl().times(1).returning(|| Ok(()));

        enroll_agent(&mut api, &ca, "web.demoapp.com").await.unwrap();
        assert!(ca.has_leaf("web.demoapp.com"));
    }

    #[tokio::test]
    async fn test_install_failure_aborts_before_upgrade() {
        let tempdir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_init(&tempdir.path().join("ca")).unwrap();
        let csr = real_csr().await;

        let mut api = MockAgentApi::new();
        api.expect_generate_csr()
            .times(1)
            .returning(move || Ok(csr.clone()));
        api.expect_install_cert().times(1).returning(|_| {
            Err(AgentCallError::Rpc(RpcError::Internal(
                "disk full".to_string(),
            )))
        });
        api.expect_upgrade_to_ssl().times(0);

        let err = enroll_agent(&mut api, &ca, "web.demoapp.com")
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::CertInstallFailed { .. }));
    }

    #[tokio::test]
    async fn test_reenrollment_revokes_the_stale_leaf() {
        let tempdir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_init(&tempdir.path().join("ca")).unwrap();
        ca.issue_identity("web.demoapp.com").unwrap();
        let csr = real_csr().await;

        let mut api = MockAgentApi::new();
        api.expect_generate_csr()
            .times(1)
            .returning(move || Ok(csr.clone()));
        api.expect_install_cert().times(1).returning(|_| Ok(()));
        api.expect_install_ca_cert().times(1).returning(|_| Ok(()));
        api.expect_upgrade_to_ssl().times(1).returning(|| Ok(()));

        enroll_agent(&mut api, &ca, "web.demoapp.com").await.unwrap();
        assert!(ca.has_leaf("web.demoapp.com"));
    }
}
