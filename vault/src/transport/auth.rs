//! Signature-based connection authentication.
//!
//! An agent configured with a fabric address challenges the connecting
//! keeper to sign a fresh nonce with the key belonging to that address.
//! The keeper keeps such keys in the operator's secret store and loads
//! them on demand when a transport reports `AUTH_ADDRESS_REQUIRED`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("malformed signing key material")]
    BadKey,

    #[error("address `{0}` is not a valid verifying key")]
    BadAddress(String),

    #[error("signature does not verify for address `{0}`")]
    BadSignature(String),

    #[error("peer answered for address `{got}`, expected `{expected}`")]
    AddressMismatch { expected: String, got: String },
}

/// Challenge sent by the server: sign `auth_required` (hex nonce) with the
/// key for `address`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub auth_required: String,
    pub address: String,
}

impl AuthChallenge {
    pub fn new(address: &str) -> Self {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        AuthChallenge {
            auth_required: hex::encode(nonce),
            address: address.to_string(),
        }
    }
}

/// Client answer to a challenge. An empty signature means the client holds
/// no key for the address.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub address: String,
    pub signature: String,
}

/// Failure frame sent by a server closing a connection; carries one of the
/// typed failure symbols.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailureFrame {
    pub error: String,
}

/// Client-side signer bound to one identity. The identity string is the
/// hex-encoded verifying key, the same string the fabric publishes as the
/// application address.
#[derive(Debug)]
pub struct SignatureSigner {
    address: String,
    key: SigningKey,
}

impl SignatureSigner {
    pub fn from_seed_hex(address: &str, seed_hex: &str) -> Result<Self, AuthError> {
        let seed: [u8; 32] = hex::decode(seed_hex)
            .map_err(|_| AuthError::BadKey)?
            .try_into()
            .map_err(|_| AuthError::BadKey)?;
        Ok(SignatureSigner {
            address: address.to_string(),
            key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn answer(&self, challenge: &AuthChallenge) -> AuthResponse {
        let nonce = challenge.auth_required.as_bytes();
        let signature = self.key.sign(nonce);
        AuthResponse {
            address: self.address.clone(),
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

/// Server-side verifier for one expected address.
pub struct SignatureVerifier {
    address: String,
}

impl SignatureVerifier {
    pub fn new(address: &str) -> Self {
        SignatureVerifier {
            address: address.to_string(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn challenge(&self) -> AuthChallenge {
        AuthChallenge::new(&self.address)
    }

    pub fn verify(
        &self,
        challenge: &AuthChallenge,
        response: &AuthResponse,
    ) -> Result<(), AuthError> {
        if response.address != self.address {
            return Err(AuthError::AddressMismatch {
                expected: self.address.clone(),
                got: response.address.clone(),
            });
        }

        let key_bytes: [u8; 32] = hex::decode(&self.address)
            .map_err(|_| AuthError::BadAddress(self.address.clone()))?
            .try_into()
            .map_err(|_| AuthError::BadAddress(self.address.clone()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| AuthError::BadAddress(self.address.clone()))?;

        let signature_bytes =
            hex::decode(&response.signature).map_err(|_| AuthError::BadSignature(self.address.clone()))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| AuthError::BadSignature(self.address.clone()))?;

        verifying_key
            .verify(challenge.auth_required.as_bytes(), &signature)
            .map_err(|_| AuthError::BadSignature(self.address.clone()))
    }
}

/// Derive the public address for a stored signing seed; used when
/// provisioning keys into the secret store.
pub fn address_for_seed_hex(seed_hex: &str) -> Result<String, AuthError> {
    let seed: [u8; 32] = hex::decode(seed_hex)
        .map_err(|_| AuthError::BadKey)?
        .try_into()
        .map_err(|_| AuthError::BadKey)?;
    let key = SigningKey::from_bytes(&seed);
    Ok(hex::encode(key.verifying_key().to_bytes()))
}
