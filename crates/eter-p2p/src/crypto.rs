//! Key exchange for the signaling relay tier
//!
//! Each relay connection generates an ephemeral P-384 key pair and publishes
//! the public half as a JWK string. Combining our private key with the remote
//! public key yields the same AES-256-GCM key on both sides: the first 32
//! bytes of the raw ECDH shared secret, as WebCrypto derives it.
//!
//! Format: `EncryptedPayload { data: base64(ciphertext || tag), iv: base64(nonce) }`

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use p384::ecdh::EphemeralSecret;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::{EncodedPoint, FieldBytes, PublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::EncryptedPayload;

/// Nonce size for AES-GCM (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES key size taken from the shared secret
const AES_KEY_SIZE: usize = 32;

/// P-384 coordinate size
const COORDINATE_SIZE: usize = 48;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Invalid nonce length: {0}")]
    InvalidNonce(usize),
    #[error("Invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// Public key in JSON Web Key form
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Jwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
    #[serde(default)]
    ext: bool,
    #[serde(default)]
    key_ops: Vec<String>,
}

/// Ephemeral ECDH key pair
pub struct KeyExchange {
    secret: EphemeralSecret,
    public_jwk: String,
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public_jwk", &self.public_jwk)
            .finish_non_exhaustive()
    }
}

impl KeyExchange {
    /// Generate a fresh key pair. CPU bound, run it off the async executor.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_jwk = export_jwk(&secret.public_key());
        Self { secret, public_jwk }
    }

    /// Our public key, serialized as JWK JSON
    pub fn public_key(&self) -> &str {
        &self.public_jwk
    }

    /// Derive the shared symmetric key from the remote JWK string
    pub fn derive(&self, remote_jwk: &str) -> Result<SymmetricCipher, CryptoError> {
        let remote = import_jwk(remote_jwk)?;
        let shared = self.secret.diffie_hellman(&remote);
        let raw = shared.raw_secret_bytes();
        let cipher = Aes256Gcm::new_from_slice(&raw[..AES_KEY_SIZE])
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(SymmetricCipher { cipher })
    }
}

fn export_jwk(public: &PublicKey) -> String {
    let point = public.to_encoded_point(false);
    let coordinate = |c: Option<&FieldBytes>| c.map(|b| URL_SAFE_NO_PAD.encode(b)).unwrap_or_default();
    let jwk = Jwk {
        kty: "EC".to_string(),
        crv: "P-384".to_string(),
        x: coordinate(point.x()),
        y: coordinate(point.y()),
        ext: true,
        key_ops: Vec::new(),
    };
    serde_json::to_string(&jwk).unwrap_or_default()
}

fn import_jwk(jwk: &str) -> Result<PublicKey, CryptoError> {
    let jwk: Jwk =
        serde_json::from_str(jwk).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    if jwk.kty != "EC" || jwk.crv != "P-384" {
        return Err(CryptoError::InvalidPublicKey(format!(
            "unsupported key {} {}",
            jwk.kty, jwk.crv
        )));
    }
    let x = URL_SAFE_NO_PAD.decode(jwk.x.as_bytes())?;
    let y = URL_SAFE_NO_PAD.decode(jwk.y.as_bytes())?;
    if x.len() != COORDINATE_SIZE || y.len() != COORDINATE_SIZE {
        return Err(CryptoError::InvalidPublicKey(
            "bad coordinate length".to_string(),
        ));
    }
    let point = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&x),
        FieldBytes::from_slice(&y),
        false,
    );
    PublicKey::from_sec1_bytes(point.as_bytes())
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// AES-256-GCM key shared by both ends of a relay connection
pub struct SymmetricCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SymmetricCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricCipher(..)")
    }
}

impl SymmetricCipher {
    /// Encrypt with a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        Ok((ciphertext, nonce))
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonce(nonce.len()));
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    /// Encrypt into the base64 wire envelope
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        let (ciphertext, nonce) = self.encrypt(plaintext)?;
        Ok(EncryptedPayload {
            data: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(nonce),
        })
    }

    pub fn open(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = STANDARD.decode(payload.data.as_bytes())?;
        let nonce = STANDARD.decode(payload.iv.as_bytes())?;
        self.decrypt(&ciphertext, &nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_key_round_trip() {
        let alice = KeyExchange::generate();
        let bob = KeyExchange::generate();

        let alice_cipher = alice.derive(bob.public_key()).unwrap();
        let bob_cipher = bob.derive(alice.public_key()).unwrap();

        let (ciphertext, nonce) = alice_cipher.encrypt(b"hello bob").unwrap();
        assert_ne!(ciphertext, b"hello bob");
        assert_eq!(bob_cipher.decrypt(&ciphertext, &nonce).unwrap(), b"hello bob");
    }

    #[test]
    fn test_public_key_is_jwk() {
        let keys = KeyExchange::generate();
        let jwk: serde_json::Value = serde_json::from_str(keys.public_key()).unwrap();
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-384");
        assert_eq!(jwk["x"].as_str().unwrap().len(), 64);
        assert_eq!(jwk["y"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_nonces_are_fresh() {
        let a = KeyExchange::generate();
        let b = KeyExchange::generate();
        let cipher = a.derive(b.public_key()).unwrap();
        let first = cipher.seal(b"same").unwrap();
        let second = cipher.seal(b"same").unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn test_envelope_round_trip() {
        let a = KeyExchange::generate();
        let b = KeyExchange::generate();
        let sealed = a.derive(b.public_key()).unwrap().seal(br#"{"event":"x"}"#).unwrap();
        let opened = b.derive(a.public_key()).unwrap().open(&sealed).unwrap();
        assert_eq!(opened, br#"{"event":"x"}"#);
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = KeyExchange::generate();
        let b = KeyExchange::generate();
        let eve = KeyExchange::generate();
        let sealed = a.derive(b.public_key()).unwrap().seal(b"secret").unwrap();
        let result = eve.derive(a.public_key()).unwrap().open(&sealed);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn test_invalid_public_key() {
        let keys = KeyExchange::generate();
        assert!(matches!(
            keys.derive("not json"),
            Err(CryptoError::InvalidPublicKey(_))
        ));
        let wrong_curve = r#"{"kty":"EC","crv":"P-256","x":"AA","y":"AA"}"#;
        assert!(keys.derive(wrong_curve).is_err());
    }

    #[test]
    fn test_bad_nonce_length() {
        let a = KeyExchange::generate();
        let cipher = a.derive(KeyExchange::generate().public_key()).unwrap();
        assert!(matches!(
            cipher.decrypt(b"0123456789abcdef0", b"short"),
            Err(CryptoError::InvalidNonce(5))
        ));
    }
}
