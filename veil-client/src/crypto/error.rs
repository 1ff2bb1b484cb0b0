use thiserror::Error;

/// Errors from key handling and envelope encryption.
///
/// Every failure that could reveal *why* a ciphertext was rejected (wrong
/// password, tampered data, truncated input) collapses into
/// [`CryptoError::AuthFailure`], which only ever displays as "invalid".
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Tag mismatch, wrong key, malformed or truncated ciphertext.
    #[error("invalid")]
    AuthFailure,

    /// Key material could not be parsed or exported.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Plaintext exceeds what RSA-OAEP can carry for this modulus.
    #[error("payload too large for asymmetric encryption: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Length of the rejected plaintext
        len: usize,
        /// Largest plaintext the key accepts
        max: usize,
    },

    /// Encryption itself failed (RNG or cipher error).
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Identity key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// No identity has been created or unlocked yet.
    #[error("no identity loaded")]
    NoIdentity,

    /// No chat key is installed for the chat.
    #[error("no chat key for chat {0}")]
    NoChatKey(String),

    /// OS keyring access failed.
    #[error("key storage error: {0}")]
    Storage(String),

    /// A blocking crypto task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl CryptoError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Authentication failures are final: retrying a bad password only burns
    /// another key derivation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Task(_))
    }
}
