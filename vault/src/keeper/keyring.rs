//! Read-only signing-key lookup.
//!
//! Connection-signing keys live in the operator's OS secret store,
//! addressed by identity string. The keeper only ever receives a lookup
//! capability; keys are never written to logs or disk.

use crate::transport::auth::{AuthError, SignatureSigner};
use thiserror::Error;

/// Service name the keeper's entries live under in the secret store.
pub const KEYRING_SERVICE: &str = "fabric-vault";

#[derive(Error, Debug)]
pub enum SigningKeyError {
    #[error("signing key for address `{0}` not present in secure storage")]
    Missing(String),

    #[error("secret store lookup failed for `{address}`: {message}")]
    Lookup { address: String, message: String },

    #[error("stored key for `{address}` is unusable: {source}")]
    Unusable {
        address: String,
        source: AuthError,
    },
}

pub trait SigningKeyProvider: Send + Sync {
    /// Hex seed for the given identity, or `None` when absent.
    fn lookup(&self, identity: &str) -> Result<Option<String>, SigningKeyError>;
}

/// Build a connection signer for an identity, failing the caller's cycle
/// when the store has no key.
pub fn signer_for(
    provider: &dyn SigningKeyProvider,
    identity: &str,
) -> Result<SignatureSigner, SigningKeyError> {
    let seed = provider
        .lookup(identity)?
        .ok_or_else(|| SigningKeyError::Missing(identity.to_string()))?;
    SignatureSigner::from_seed_hex(identity, &seed).map_err(|source| SigningKeyError::Unusable {
        address: identity.to_string(),
        source,
    })
}

/// OS secret store implementation.
pub struct OsKeyring {
    service: String,
}

impl OsKeyring {
    pub fn new() -> Self {
        OsKeyring {
            service: KEYRING_SERVICE.to_string(),
        }
    }
}

impl Default for OsKeyring {
    fn default() -> Self {
        Self::new()
    }
}

impl SigningKeyProvider for OsKeyring {
    fn lookup(&self, identity: &str) -> Result<Option<String>, SigningKeyError> {
        let entry = keyring::Entry::new(&self.service, identity).map_err(|err| {
            SigningKeyError::Lookup {
                address: identity.to_string(),
                message: err.to_string(),
            }
        })?;
        match entry.get_password() {
            Ok(seed) => Ok(Some(seed)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(SigningKeyError::Lookup {
                address: identity.to_string(),
                message: err.to_string(),
            }),
        }
    }
}
