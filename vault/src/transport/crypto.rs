//! Session cryptography: the RSA-protected AES key exchange and the
//! per-frame AES-EAX envelopes.
//!
//! Every connection starts with the agent generating a fresh 2048-bit RSA
//! keypair and shipping the public half to the keeper. The keeper answers
//! with a [`KeyExchangeEnvelope`]: a random key-encryption key sealed under
//! RSA-OAEP, wrapping the actual 16-byte session key in an AES-EAX
//! envelope. All later frames are [`EncryptedEnvelope`]s under the session
//! key. Nothing here ever touches the disk.

use aes::Aes128;
use eax::aead::generic_array::GenericArray;
use eax::aead::{AeadInPlace, KeyInit};
use eax::Eax;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type Aes128Eax = Eax<Aes128>;

pub const SESSION_KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 16;
pub const RSA_BITS: usize = 2048;

pub const TEST_MESSAGE: &str = "TestEncryptionMessage";
pub const TEST_MESSAGE_RESPONSE: &str = "TestEncryptionMessageResponse";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("rsa failure: {0}")]
    Rsa(String),

    #[error("aead rejected the envelope")]
    Aead,

    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("session key must be {SESSION_KEY_LEN} bytes, got {0}")]
    KeyLength(usize),
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::Envelope(err.to_string())
    }
}

impl From<hex::FromHexError> for CryptoError {
    fn from(err: hex::FromHexError) -> Self {
        CryptoError::Envelope(err.to_string())
    }
}

/// Wire form of an encrypted frame. All fields lowercase hex.
#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub nonce: String,
    pub tag: String,
    pub ciphertext: String,
}

/// Wire form of the RSA handshake frame: `enc_session_key` is the
/// OAEP-sealed key-encryption key, `cipher` the EAX-wrapped session key.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyExchangeEnvelope {
    pub enc_session_key: String,
    pub nonce: String,
    pub tag: String,
    pub cipher: String,
}

/// The encryption check exchanged right after the key exchange. The `fill`
/// keeps probe frames unpredictable; the responder echoes it reversed.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EncryptionProbe {
    pub text: String,
    pub fill: String,
}

impl EncryptionProbe {
    pub fn challenge() -> Self {
        EncryptionProbe {
            text: TEST_MESSAGE.to_string(),
            fill: random_fill(),
        }
    }

    pub fn response_to(challenge: &EncryptionProbe) -> Self {
        EncryptionProbe {
            text: TEST_MESSAGE_RESPONSE.to_string(),
            fill: challenge.fill.chars().rev().collect(),
        }
    }

    pub fn answers(&self, challenge: &EncryptionProbe) -> bool {
        let reversed: String = challenge.fill.chars().rev().collect();
        self.text == TEST_MESSAGE_RESPONSE && self.fill == reversed
    }
}

fn random_fill() -> String {
    let mut fill = [0u8; 16];
    OsRng.fill_bytes(&mut fill);
    hex::encode(fill)
}

/// Ephemeral per-connection AES-EAX session key. Lives only in memory and
/// dies with the connection.
#[derive(Clone, Copy)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        SessionKey(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; SESSION_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        Ok(SessionKey(key))
    }

    fn cipher(&self) -> Aes128Eax {
        Aes128Eax::new(GenericArray::from_slice(&self.0))
    }

    /// Seal a plaintext into the JSON envelope carried on the wire.
    pub fn encrypt_frame(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher()
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buffer)
            .expect("EAX encryption is infallible for in-memory buffers");

        let envelope = EncryptedEnvelope {
            nonce: hex::encode(nonce),
            tag: hex::encode(tag),
            ciphertext: hex::encode(buffer),
        };
        serde_json::to_vec(&envelope).expect("envelope serializes")
    }

    /// Open a wire frame. Any tampering with ciphertext or tag fails the
    /// EAX verification and is reported as [`CryptoError::Aead`].
    pub fn decrypt_frame(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let envelope: EncryptedEnvelope = serde_json::from_slice(frame)?;
        self.decrypt_envelope(&envelope)
    }

    pub fn decrypt_envelope(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
        let nonce = hex::decode(&envelope.nonce)?;
        let tag = hex::decode(&envelope.tag)?;
        let mut buffer = hex::decode(&envelope.ciphertext)?;

        if nonce.len() != NONCE_LEN || tag.len() != NONCE_LEN {
            return Err(CryptoError::Envelope("bad nonce or tag length".into()));
        }

        self.cipher()
            .decrypt_in_place_detached(
                GenericArray::from_slice(&nonce),
                b"",
                &mut buffer,
                GenericArray::from_slice(&tag),
            )
            .map_err(|_| CryptoError::Aead)?;
        Ok(buffer)
    }
}

/// Generate the per-connection RSA keypair. CPU-heavy; callers offload it
/// to a blocking task.
pub fn generate_rsa_keypair() -> Result<(RsaPrivateKey, String), CryptoError> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(|e| CryptoError::Rsa(e.to_string()))?;
    let public_pem = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;
    Ok((private, public_pem))
}

/// Keeper side of the key exchange: seal `session` to the agent's public
/// key.
pub fn seal_session_key(
    public_key_pem: &str,
    session: &SessionKey,
) -> Result<KeyExchangeEnvelope, CryptoError> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;

    let kek = SessionKey::generate();
    let enc_session_key = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &kek.0)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let mut buffer = session.0.to_vec();
    let tag = kek
        .cipher()
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut buffer)
        .expect("EAX encryption is infallible for in-memory buffers");

    Ok(KeyExchangeEnvelope {
        enc_session_key: hex::encode(enc_session_key),
        nonce: hex::encode(nonce),
        tag: hex::encode(tag),
        cipher: hex::encode(buffer),
    })
}

/// Agent side of the key exchange: recover the session key with the
/// connection's RSA private key.
pub fn open_session_key(
    private_key: &RsaPrivateKey,
    envelope: &KeyExchangeEnvelope,
) -> Result<SessionKey, CryptoError> {
    let enc_session_key = hex::decode(&envelope.enc_session_key)?;
    let kek_bytes = private_key
        .decrypt(Oaep::new::<Sha256>(), &enc_session_key)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;
    let kek = SessionKey::from_bytes(&kek_bytes)?;

    let inner = EncryptedEnvelope {
        nonce: envelope.nonce.clone(),
        tag: envelope.tag.clone(),
        ciphertext: envelope.cipher.clone(),
    };
    let session_bytes = kek.decrypt_envelope(&inner)?;
    SessionKey::from_bytes(&session_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_frame_round_trip() {
        let key = SessionKey::generate();
        let frame = key.encrypt_frame(b"the quick brown fox");
        assert_eq!(key.decrypt_frame(&frame).unwrap(), b"the quick brown fox");
    }

    #[test]
    fn test_envelope_fields_are_lowercase_hex() {
        let key = SessionKey::generate();
        let frame = key.encrypt_frame(b"payload");
        let envelope: EncryptedEnvelope = serde_json::from_slice(&frame).unwrap();
        for field in [&envelope.nonce, &envelope.tag, &envelope.ciphertext] {
            assert!(field
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }

    #[test]
    fn test_ciphertext_bit_flip_is_rejected() {
        let key = SessionKey::generate();
        let frame = key.encrypt_frame(b"sensitive");
        let mut envelope: EncryptedEnvelope = serde_json::from_slice(&frame).unwrap();

        let mut raw = hex::decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0x01;
        envelope.ciphertext = hex::encode(raw);

        assert_matches!(key.decrypt_envelope(&envelope), Err(CryptoError::Aead));
    }

    #[test]
    fn test_tag_bit_flip_is_rejected() {
        let key = SessionKey::generate();
        let frame = key.encrypt_frame(b"sensitive");
        let mut envelope: EncryptedEnvelope = serde_json::from_slice(&frame).unwrap();

        let mut raw = hex::decode(&envelope.tag).unwrap();
        raw[15] ^= 0x80;
        envelope.tag = hex::encode(raw);

        assert_matches!(key.decrypt_envelope(&envelope), Err(CryptoError::Aead));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let key = SessionKey::generate();
        let other = SessionKey::generate();
        let frame = key.encrypt_frame(b"sensitive");
        assert_matches!(other.decrypt_frame(&frame), Err(CryptoError::Aead));
    }

    #[test]
    fn test_key_exchange_round_trip() {
        let (private, public_pem) = generate_rsa_keypair().unwrap();
        let session = SessionKey::generate();

        let envelope = seal_session_key(&public_pem, &session).unwrap();
        let recovered = open_session_key(&private, &envelope).unwrap();

        assert_eq!(recovered.0, session.0);
    }

    #[test]
    fn test_tampered_key_exchange_is_rejected() {
        let (private, public_pem) = generate_rsa_keypair().unwrap();
        let session = SessionKey::generate();

        let mut envelope = seal_session_key(&public_pem, &session).unwrap();
        let mut raw = hex::decode(&envelope.cipher).unwrap();
        raw[3] ^= 0xff;
        envelope.cipher = hex::encode(raw);

        assert!(open_session_key(&private, &envelope).is_err());
    }

    #[test]
    fn test_probe_response_reverses_fill() {
        let challenge = EncryptionProbe::challenge();
        assert_eq!(challenge.text, TEST_MESSAGE);

        let response = EncryptionProbe::response_to(&challenge);
        assert!(response.answers(&challenge));

        let stale = EncryptionProbe {
            text: TEST_MESSAGE_RESPONSE.to_string(),
            fill: challenge.fill.clone(),
        };
        assert!(!stale.answers(&challenge));
    }
}
