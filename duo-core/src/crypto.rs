//! Crypto adapter: encrypt/decrypt a text frame with the pre-shared symmetric key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Pre-shared 32-byte key. Rendered as base64 in config and persisted state.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        SessionKey(bytes)
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        SessionKey(key)
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let raw = STANDARD
            .decode(text.trim())
            .map_err(|_| CryptoError::Encoding)?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|_| CryptoError::Key)?;
        Ok(SessionKey(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl Serialize for SessionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        SessionKey::from_base64(&text).map_err(serde::de::Error::custom)
    }
}

/// Encrypts and decrypts text frames. Treated as a pure function of (key, input).
pub trait CryptoAdapter: Send + Sync {
    fn encrypt(&self, key: &SessionKey, plaintext: &str) -> Result<String, CryptoError>;
    fn decrypt(&self, key: &SessionKey, ciphertext: &str) -> Result<String, CryptoError>;
}

/// ChaCha20-Poly1305 with a random nonce per frame. Frame text: base64(nonce || ciphertext).
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaAdapter;

impl CryptoAdapter for ChaChaAdapter {
    fn encrypt(&self, key: &SessionKey, plaintext: &str) -> Result<String, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Key)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, key: &SessionKey, ciphertext: &str) -> Result<String, CryptoError> {
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| CryptoError::Encoding)?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Key)?;
        let plain = cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| CryptoError::Encoding)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid base64 or utf-8")]
    Encoding,
}
