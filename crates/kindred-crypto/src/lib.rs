//! At-rest encryption for chat payloads.
//!
//! Job messages and results never touch SQLite in the clear. A single
//! AES-256-GCM data key is derived from the platform master secret with
//! HKDF-SHA256, and every `encrypt` call draws a fresh random nonce.
//! Key material is zeroized on drop and redacted from `Debug` output.

#![forbid(unsafe_code)]

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit},
    Aes256Gcm,
};
use base64::Engine;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF info string binding derived keys to the job store.
/// Bumping this revokes every payload encrypted under the old context.
const KEY_CONTEXT: &[u8] = b"kindred-jobs-at-rest-v1";

/// Bundle format version written into every [`EncryptedData`].
const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    /// Covers wrong key, truncated input, and failed GCM authentication;
    /// deliberately not more specific than that.
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Self-describing ciphertext bundle, stored as JSON in the job tables.
/// Everything needed to decrypt travels with it except the key itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedData {
    pub version: u8,
    pub nonce: [u8; 12],
    /// AES-GCM output; the 16-byte auth tag rides at the end.
    pub ciphertext: Vec<u8>,
}

/// AES-256-GCM cipher over the HKDF-derived data key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PayloadCipher {
    key: [u8; 32],
}

impl PayloadCipher {
    /// Wrap an already-derived 256-bit key.
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the data key from the raw platform master secret.
    pub fn from_master_secret(master: &[u8]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, master);
        let mut key = [0u8; 32];
        hkdf.expand(KEY_CONTEXT, &mut key)
            .expect("HKDF expand should never fail with 32-byte output");
        Self { key }
    }

    /// Derive the data key from a base64 master secret, the form the
    /// secret takes in environment configuration. Secrets under 32
    /// bytes are rejected.
    pub fn from_base64_secret(encoded: &str) -> Result<Self> {
        let master = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if master.len() < 32 {
            return Err(CryptoError::InvalidKey(format!(
                "master secret too short: {} bytes (need at least 32)",
                master.len()
            )));
        }
        Ok(Self::from_master_secret(&master))
    }

    fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.key.into())
    }

    /// Encrypt a payload under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedData> {
        let nonce = Aes256Gcm::generate_nonce(&mut rand::thread_rng());
        let ciphertext = self
            .aead()
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(EncryptedData {
            version: FORMAT_VERSION,
            nonce: nonce.into(),
            ciphertext,
        })
    }

    /// Decrypt a bundle produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, data: &EncryptedData) -> Result<Vec<u8>> {
        if data.version != FORMAT_VERSION {
            return Err(CryptoError::InvalidFormat(format!(
                "unsupported version: {}",
                data.version
            )));
        }

        self.aead()
            .decrypt(&data.nonce.into(), data.ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> PayloadCipher {
        PayloadCipher::from_master_secret(b"unit-test master secret, 32+ bytes long")
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = cipher();
        let plaintext = br#"[{"role":"user","content":"what is an IEP?"}]"#;

        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert_eq!(encrypted.version, 1);
        assert_ne!(&encrypted.ciphertext[..], &plaintext[..]);

        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let cipher = cipher();
        let plaintext = b"same message twice";

        let first = cipher.encrypt(plaintext).unwrap();
        let second = cipher.encrypt(plaintext).unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);

        assert_eq!(cipher.decrypt(&first).unwrap(), plaintext);
        assert_eq!(cipher.decrypt(&second).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = cipher().encrypt(b"secret").unwrap();

        let other = PayloadCipher::from_master_secret(b"a completely different master secret");
        assert_eq!(other.decrypt(&encrypted), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails_auth() {
        let cipher = cipher();
        let mut encrypted = cipher.encrypt(b"original payload").unwrap();

        if let Some(byte) = encrypted.ciphertext.first_mut() {
            *byte ^= 0xFF;
        }
        assert_eq!(cipher.decrypt(&encrypted), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_master_secret_derivation_is_deterministic() {
        let a = PayloadCipher::from_master_secret(b"a long enough master secret value");
        let b = PayloadCipher::from_master_secret(b"a long enough master secret value");

        let encrypted = a.encrypt(b"payload").unwrap();
        assert_eq!(b.decrypt(&encrypted).unwrap(), b"payload");
    }

    #[test]
    fn test_base64_secret() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let cipher = PayloadCipher::from_base64_secret(&encoded).unwrap();

        let encrypted = cipher.encrypt(b"via env").unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"via env");
    }

    #[test]
    fn test_base64_secret_too_short() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([7u8; 8]);
        let result = PayloadCipher::from_base64_secret(&encoded);
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_base64_secret_malformed() {
        let result = PayloadCipher::from_base64_secret("not base64!!!");
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = cipher();
        let encrypted = cipher.encrypt(b"").unwrap();
        assert!(cipher.decrypt(&encrypted).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let bundle = EncryptedData {
            version: 99,
            nonce: [0u8; 12],
            ciphertext: vec![1, 2, 3],
        };
        assert!(matches!(
            cipher().decrypt(&bundle),
            Err(CryptoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_bundle_survives_json() {
        let cipher = cipher();
        let encrypted = cipher.encrypt(b"persisted").unwrap();

        let json = serde_json::to_string(&encrypted).unwrap();
        let parsed: EncryptedData = serde_json::from_str(&json).unwrap();
        assert_eq!(cipher.decrypt(&parsed).unwrap(), b"persisted");
    }

    #[test]
    fn test_debug_redacts_key() {
        let cipher = PayloadCipher::from_key([42u8; 32]);
        let debug = format!("{:?}", cipher);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));
    }
}
