use super::envelope::{ProtectionKey, SymmetricKey, KEY_LEN};
use super::error::CryptoError;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the user's security key in bytes.
pub const SECURITY_KEY_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256 rounds for deriving the protection key.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt for the protection-key derivation. Intentionally empty so existing
/// wrapped private keys keep unwrapping; see DESIGN.md.
const PBKDF2_SALT: &[u8] = &[];

/// The user's high-entropy secret. Never leaves the client.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecurityKey([u8; SECURITY_KEY_LEN]);

impl SecurityKey {
    /// Generate a fresh random security key (signup).
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECURITY_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SECURITY_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECURITY_KEY_LEN] {
        &self.0
    }

    /// Lowercase hex form shown to the user.
    pub fn export(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form produced by [`SecurityKey::export`].
    pub fn import(encoded: &str) -> Result<Self, CryptoError> {
        let mut decoded = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("security key is not hex: {}", e)))?;
        let result = <[u8; SECURITY_KEY_LEN]>::try_from(decoded.as_slice())
            .map(Self)
            .map_err(|_| {
                CryptoError::InvalidKey(format!(
                    "security key must be {} bytes, got {}",
                    SECURITY_KEY_LEN,
                    decoded.len()
                ))
            });
        decoded.zeroize();
        result
    }

    /// Derive the AES key that wraps the private identity key.
    ///
    /// Deliberately slow (PBKDF2, [`PBKDF2_ITERATIONS`] rounds). Use
    /// [`SecurityKey::derive_protection_key_async`] from async code.
    pub fn derive_protection_key(&self) -> ProtectionKey {
        let mut out = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(&self.0, PBKDF2_SALT, PBKDF2_ITERATIONS, &mut out);
        let key = SymmetricKey::from_bytes(out);
        out.zeroize();
        key
    }

    /// [`SecurityKey::derive_protection_key`] on the blocking thread pool.
    pub async fn derive_protection_key_async(&self) -> Result<ProtectionKey, CryptoError> {
        let key = self.clone();
        tokio::task::spawn_blocking(move || key.derive_protection_key())
            .await
            .map_err(|e| CryptoError::Task(e.to_string()))
    }
}

impl fmt::Debug for SecurityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecurityKey(..)")
    }
}
