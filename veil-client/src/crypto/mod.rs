//! Key material and envelope encryption.
//!
//! - [`envelope`]: AES-256-GCM `seal`/`open` of base64 envelopes
//! - [`SecurityKey`]: the user's secret and its PBKDF2 protection key
//! - [`IdentityKeyPair`]: RSA-OAEP identity, wrapped under the protection key
//! - [`CryptoManager`]: the unlocked identity plus per-chat keys
//! - [`storage`]: security key persistence in the OS keyring

pub mod envelope;
mod error;
pub(crate) mod identity;
mod manager;
mod security_key;
pub mod storage;

pub use envelope::{open, seal, ChatKey, ProtectionKey, SymmetricKey, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, IdentityPublicKey, IDENTITY_KEY_BITS, MIN_IDENTITY_KEY_BITS};
pub use manager::{CryptoManager, Registration};
pub use security_key::{SecurityKey, PBKDF2_ITERATIONS, SECURITY_KEY_LEN};
