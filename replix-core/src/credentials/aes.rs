use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use zeroize::Zeroizing;

use super::{CredentialVault, SealedCredential};
use crate::error::VaultError;

const TOKEN_PREFIX: &str = "v1:";
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// AES-256-GCM vault keyed by a base64 encoded 32 byte key.
///
/// A vault built without a key is still usable as a value so the server can
/// start, but every operation fails with [`VaultError::KeyUnavailable`] and
/// submissions are rejected before anything is stored.
#[derive(Clone)]
pub struct AesGcmVault {
    cipher: Option<Aes256Gcm>,
}

impl AesGcmVault {
    pub fn new(encoded_key: Option<&str>) -> Result<Self, VaultError> {
        let cipher = match encoded_key {
            Some(encoded) => Some(Self::cipher_from(encoded)?),
            None => None,
        };
        Ok(Self { cipher })
    }

    pub fn from_key(encoded_key: &str) -> Result<Self, VaultError> {
        Self::new(Some(encoded_key))
    }

    pub fn unconfigured() -> Self {
        Self { cipher: None }
    }

    pub fn is_configured(&self) -> bool {
        self.cipher.is_some()
    }

    /// Checks that `encoded_key` decodes to a usable key.
    pub fn validate_key(encoded_key: &str) -> Result<(), VaultError> {
        Self::decode_key(encoded_key).map(|_| ())
    }

    /// Fresh random key in the encoding accepted by [`AesGcmVault::new`].
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        BASE64.encode(key.as_slice())
    }

    fn decode_key(encoded: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|e| VaultError::InvalidKey(format!("not base64: {e}")))?,
        );
        if bytes.len() != KEY_SIZE {
            return Err(VaultError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    fn cipher_from(encoded: &str) -> Result<Aes256Gcm, VaultError> {
        let bytes = Self::decode_key(encoded)?;
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Aes256Gcm::new(key))
    }

    fn cipher(&self) -> Result<&Aes256Gcm, VaultError> {
        self.cipher.as_ref().ok_or(VaultError::KeyUnavailable)
    }

    fn seal(&self, plaintext: &str) -> Result<SealedCredential, VaultError> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&ciphertext);

        Ok(SealedCredential::from_token(format!(
            "{TOKEN_PREFIX}{}",
            BASE64.encode(payload)
        )))
    }

    fn open(&self, sealed: &SealedCredential) -> Result<Zeroizing<String>, VaultError> {
        let cipher = self.cipher()?;
        let encoded = sealed
            .as_str()
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(VaultError::MalformedToken("unknown token version"))?;
        let payload = BASE64
            .decode(encoded)
            .map_err(|_| VaultError::MalformedToken("payload is not base64"))?;
        if payload.len() <= NONCE_SIZE {
            return Err(VaultError::MalformedToken("payload is truncated"));
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| VaultError::Decrypt)?,
        );
        let text = std::str::from_utf8(&plaintext).map_err(|_| VaultError::Decrypt)?;
        Ok(Zeroizing::new(text.to_owned()))
    }
}

impl fmt::Debug for AesGcmVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmVault")
            .field("configured", &self.is_configured())
            .finish()
    }
}

#[async_trait]
impl CredentialVault for AesGcmVault {
    async fn encrypt(&self, plaintext: &str) -> Result<SealedCredential, VaultError> {
        self.seal(plaintext)
    }

    async fn decrypt(
        &self,
        sealed: &SealedCredential,
    ) -> Result<Zeroizing<String>, VaultError> {
        self.open(sealed)
    }
}
