//! Credential protection: sealing connection strings at rest, keeping them out
//! of logs, and authenticating API callers.

pub mod aes;
pub mod api_key;
pub mod redact;

use std::fmt;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::VaultError;

pub use aes::AesGcmVault;
pub use api_key::{
    ApiKeyHandle, EnvParameterStore, FileParameterStore, InMemoryParameterStore,
    ParameterStore,
};

/// Opaque ciphertext token for a connection string. Safe to persist; never
/// rendered in full by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedCredential(String);

impl SealedCredential {
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for SealedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedCredential(..)")
    }
}

/// Encrypts and decrypts connection strings.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<SealedCredential, VaultError>;

    async fn decrypt(
        &self,
        sealed: &SealedCredential,
    ) -> Result<Zeroizing<String>, VaultError>;
}
