//! AES-256-GCM envelopes.
//!
//! An envelope is `base64(nonce || ciphertext || tag)` with a fresh 12-byte
//! nonce per seal and no associated data. Every chat message and every
//! wrapped private key passes through [`seal`] and [`open`].

use super::error::CryptoError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// 256-bit AES-GCM key, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

/// Per-chat key shared by the two participants.
pub type ChatKey = SymmetricKey;

/// Key derived from a [`SecurityKey`](super::SecurityKey), used only to wrap
/// the private identity key.
pub type ProtectionKey = SymmetricKey;

impl SymmetricKey {
    /// Fresh random key from the thread RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, failing closed on any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::AuthFailure)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Encrypt `plaintext` under `key` and return the base64 envelope.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(envelope))
}

/// Decrypt an envelope produced by [`seal`].
///
/// Malformed base64, short input and tag mismatch all yield
/// [`CryptoError::AuthFailure`]; no plaintext is returned unless the tag
/// verifies.
pub fn open(key: &SymmetricKey, envelope: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = STANDARD
        .decode(envelope)
        .map_err(|_| CryptoError::AuthFailure)?;
    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AuthFailure);
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::AuthFailure)
}

/// [`seal`] for UTF-8 message content.
pub fn seal_str(key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
    seal(key, plaintext.as_bytes())
}

/// [`open`] for UTF-8 message content. Invalid UTF-8 is reported as an
/// authentication failure too.
pub fn open_str(key: &SymmetricKey, envelope: &str) -> Result<String, CryptoError> {
    let plaintext = open(key, envelope)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::AuthFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn zero_key() -> SymmetricKey {
        SymmetricKey::from_bytes([0u8; KEY_LEN])
    }

    #[test]
    fn hello_envelope_is_33_bytes() {
        let envelope = seal_str(&zero_key(), "hello").unwrap();
        let raw = STANDARD.decode(&envelope).unwrap();
        assert_eq!(raw.len(), NONCE_LEN + 5 + TAG_LEN);
        assert_eq!(raw.len(), 33);
        assert_eq!(open_str(&zero_key(), &envelope).unwrap(), "hello");
    }

    #[test]
    fn nonce_is_fresh_per_seal() {
        let key = SymmetricKey::generate();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a, b);
        assert_ne!(
            &STANDARD.decode(&a).unwrap()[..NONCE_LEN],
            &STANDARD.decode(&b).unwrap()[..NONCE_LEN]
        );
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let key = SymmetricKey::generate();
        let envelope = seal(&key, b"").unwrap();
        assert_eq!(STANDARD.decode(&envelope).unwrap().len(), NONCE_LEN + TAG_LEN);
        assert!(open(&key, &envelope).unwrap().is_empty());
    }

    #[test]
    fn wrong_key_fails() {
        let envelope = seal(&SymmetricKey::generate(), b"secret").unwrap();
        assert!(matches!(
            open(&SymmetricKey::generate(), &envelope),
            Err(CryptoError::AuthFailure)
        ));
    }

    #[test]
    fn malformed_input_fails_closed() {
        let key = zero_key();
        assert!(matches!(open(&key, "not base64!!"), Err(CryptoError::AuthFailure)));
        assert!(matches!(open(&key, ""), Err(CryptoError::AuthFailure)));
        // 27 bytes: one short of nonce + tag
        let short = STANDARD.encode([0u8; NONCE_LEN + TAG_LEN - 1]);
        assert!(matches!(open(&key, &short), Err(CryptoError::AuthFailure)));
    }

    #[test]
    fn truncated_envelope_fails() {
        let key = SymmetricKey::generate();
        let raw = STANDARD.decode(seal(&key, b"truncate me").unwrap()).unwrap();
        let cut = STANDARD.encode(&raw[..raw.len() - 1]);
        assert!(matches!(open(&key, &cut), Err(CryptoError::AuthFailure)));
    }

    #[test]
    fn invalid_utf8_is_auth_failure() {
        let key = SymmetricKey::generate();
        let envelope = seal(&key, &[0xff, 0xfe, 0xfd]).unwrap();
        assert!(matches!(open_str(&key, &envelope), Err(CryptoError::AuthFailure)));
    }

    #[test]
    fn debug_redacts_key() {
        assert_eq!(format!("{:?}", zero_key()), "SymmetricKey(..)");
    }

    proptest! {
        #[test]
        fn seal_open_round_trip(key in any::<[u8; KEY_LEN]>(), plaintext in proptest::collection::vec(any::<u8>(), 0..512)) {
            let key = SymmetricKey::from_bytes(key);
            let envelope = seal(&key, &plaintext).unwrap();
            prop_assert_eq!(open(&key, &envelope).unwrap(), plaintext);
        }

        #[test]
        fn any_bit_flip_is_rejected(plaintext in proptest::collection::vec(any::<u8>(), 1..128), index in any::<prop::sample::Index>(), bit in 0u8..8) {
            let key = SymmetricKey::generate();
            let mut raw = STANDARD.decode(seal(&key, &plaintext).unwrap()).unwrap();
            let i = index.index(raw.len());
            raw[i] ^= 1 << bit;
            let tampered = STANDARD.encode(&raw);
            prop_assert!(matches!(open(&key, &tampered), Err(CryptoError::AuthFailure)));
        }
    }
}
