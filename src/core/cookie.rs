//! Signed and sealed cookie values, and per-(app, provider) secret derivation.
//!
//! A signed value is `base64url(json) "." hex(hmac_sha256(json))`; its
//! payload is readable by the client. A sealed value is
//! `base64url(nonce || aes256gcm(json))` and is used for login state that
//! carries the PKCE verifier and nonce.
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::app_id::AppId;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LENGTH: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CookieError {
    #[error("malformed cookie value")]
    Malformed,
    #[error("invalid cookie signature")]
    BadSignature,
    #[error("cookie cannot be decrypted")]
    Undecryptable,
    #[error("cookie payload error: {0}")]
    Payload(String),
}

/// Derives the session-cookie secret for one `(app, provider)` pair:
/// hex of the first 16 bytes of `SHA-256(app "/" provider "/" salt)`.
pub fn derive_cookie_secret(app_id: &AppId, provider_id: &str, salt: &str) -> String {
    let digest = Sha256::digest(format!("{app_id}/{provider_id}/{salt}").as_bytes());
    hex::encode(&digest[..16])
}

#[derive(Clone)]
pub struct CookieCodec {
    key: Vec<u8>,
}

impl std::fmt::Debug for CookieCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CookieCodec { .. }")
    }
}

impl CookieCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<String, CookieError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| CookieError::Payload(e.to_string()))?;
        let signature = self.sign(&payload)?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            hex::encode(signature)
        ))
    }

    pub fn decode<T: DeserializeOwned>(&self, raw: &str) -> Result<T, CookieError> {
        let (encoded, signature) = raw.split_once('.').ok_or(CookieError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| CookieError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| CookieError::Malformed)?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| CookieError::BadSignature)?;

        serde_json::from_slice(&payload).map_err(|e| CookieError::Payload(e.to_string()))
    }

    /// Encrypts `value` so the client can neither read nor alter it.
    pub fn seal<T: Serialize>(&self, value: &T) -> Result<String, CookieError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| CookieError::Payload(e.to_string()))?;
        let nonce_bytes: [u8; NONCE_LENGTH] = rand::rng().random();
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), payload.as_slice())
            .map_err(|e| CookieError::Payload(e.to_string()))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn open<T: DeserializeOwned>(&self, raw: &str) -> Result<T, CookieError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| CookieError::Malformed)?;
        if sealed.len() <= NONCE_LENGTH {
            return Err(CookieError::Malformed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let payload = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CookieError::Undecryptable)?;

        serde_json::from_slice(&payload).map_err(|e| CookieError::Payload(e.to_string()))
    }

    fn cipher(&self) -> Result<Aes256Gcm, CookieError> {
        // AES-256 wants a 32 byte key; the secret is stretched through SHA-256.
        let key = Sha256::new_with_prefix(b"sealed-cookie/")
            .chain_update(&self.key)
            .finalize();
        Aes256Gcm::new_from_slice(&key).map_err(|e| CookieError::Payload(e.to_string()))
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CookieError> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn mac(&self) -> Result<HmacSha256, CookieError> {
        <HmacSha256 as Mac>::new_from_slice(&self.key).map_err(|e| CookieError::Payload(e.to_string()))
    }
}
