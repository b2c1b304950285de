//! Opaque URL tokens
//!
//! Upstream URLs never reach clients. Each one is sealed with AES-256-GCM
//! into a path-safe token:
//!
//! ```text
//! base64url_nopad( version(0x01) || nonce(12) || ciphertext )
//! ```
//!
//! The plaintext is a small JSON object carrying the URL, the referer host
//! upstream expects, and the channel it belongs to. Authentication failure,
//! a wrong key and a truncated token are all rejected by [`OpaqueUrlCodec::decode`].

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::errors::TokenError;

const NONCE_SIZE: usize = 12;
const TOKEN_VERSION: u8 = 0x01;

/// Decoded token contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    #[serde(rename = "u")]
    pub url: String,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub referer_host: Option<String>,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl TokenPayload {
    pub fn new(url: impl Into<String>, referer_host: Option<String>) -> Self {
        Self {
            url: url.into(),
            referer_host,
            channel_id: None,
        }
    }

    pub fn for_channel(mut self, channel_id: Option<String>) -> Self {
        self.channel_id = channel_id;
        self
    }
}

#[derive(Clone)]
pub struct OpaqueUrlCodec {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for OpaqueUrlCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaqueUrlCodec")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

impl OpaqueUrlCodec {
    /// Codec from a 32-byte key
    pub fn new(key_bytes: &[u8]) -> Result<Self, TokenError> {
        if key_bytes.len() != 32 {
            return Err(TokenError::InvalidKey {
                message: format!("expected 32 bytes, got {}", key_bytes.len()),
            });
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Codec from a 64-character hex key
    pub fn from_hex_key(hex_key: &str) -> Result<Self, TokenError> {
        let key_bytes = hex::decode(hex_key.trim()).map_err(|e| TokenError::InvalidKey {
            message: e.to_string(),
        })?;
        Self::new(&key_bytes)
    }

    /// Codec with a fresh random key. Tokens do not survive a restart.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Codec from an optional configured key, generating one when absent
    pub fn from_config(token_key: Option<&str>) -> Result<Self, TokenError> {
        match token_key {
            Some(key) => Self::from_hex_key(key),
            None => Ok(Self::generate()),
        }
    }

    pub fn encode(&self, url: &str, referer_host: Option<&str>) -> Result<String, TokenError> {
        self.encode_payload(&TokenPayload::new(url, referer_host.map(str::to_string)))
    }

    pub fn encode_payload(&self, payload: &TokenPayload) -> Result<String, TokenError> {
        let plaintext = serde_json::to_vec(payload).map_err(|_| TokenError::Payload)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| TokenError::Authentication)?;

        let mut combined = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        combined.push(TOKEN_VERSION);
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(&combined))
    }

    pub fn decode(&self, token: &str) -> Result<TokenPayload, TokenError> {
        let combined = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| TokenError::Malformed)?;

        // version + nonce + 16-byte tag at minimum
        if combined.len() < 1 + NONCE_SIZE + 16 {
            return Err(TokenError::Truncated);
        }
        let version = combined[0];
        if version != TOKEN_VERSION {
            return Err(TokenError::UnsupportedVersion(version));
        }

        let nonce = Nonce::from_slice(&combined[1..1 + NONCE_SIZE]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &combined[1 + NONCE_SIZE..])
            .map_err(|_| TokenError::Authentication)?;

        serde_json::from_slice(&plaintext).map_err(|_| TokenError::Payload)
    }
}
