use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CipherError {
    #[error("no key registered for {0}")]
    UnknownKey(String),

    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

/// Decrypts request payloads for the crypto filter. Key management lives with
/// the implementation; the filter only knows who the request belongs to.
#[async_trait]
pub trait PayloadCipher: Send + Sync + 'static {
    /// Decrypts `ciphertext` with the key of `key_owner` into a query string.
    async fn decrypt(&self, key_owner: &str, ciphertext: &str) -> Result<String, CipherError>;
}
