use super::envelope::{self, ProtectionKey};
use super::error::CryptoError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;

/// Modulus size of identity keys.
pub const IDENTITY_KEY_BITS: usize = 4096;

/// Smallest modulus accepted by [`IdentityKeyPair::generate_with_bits`].
pub const MIN_IDENTITY_KEY_BITS: usize = 2048;

/// OAEP overhead with SHA-256: two digests plus two bytes.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Public half of an identity key. Safe to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey(RsaPublicKey);

impl IdentityPublicKey {
    /// Base64 SPKI DER, the `publicKey` transport form.
    pub fn export(&self) -> Result<String, CryptoError> {
        let der = self
            .0
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(STANDARD.encode(der.as_bytes()))
    }

    /// Parse the form produced by [`IdentityPublicKey::export`].
    pub fn import(encoded: &str) -> Result<Self, CryptoError> {
        let der = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("public key is not base64: {}", e)))?;
        RsaPublicKey::from_public_key_der(&der)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Largest plaintext [`IdentityPublicKey::encrypt_for`] accepts.
    pub fn max_plaintext_len(&self) -> usize {
        self.0.size().saturating_sub(OAEP_SHA256_OVERHEAD)
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.0.size() * 8
    }

    /// RSA-OAEP encrypt a short secret for the holder of this key.
    pub fn encrypt_for(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let max = self.max_plaintext_len();
        if plaintext.len() > max {
            return Err(CryptoError::PayloadTooLarge {
                len: plaintext.len(),
                max,
            });
        }
        self.0
            .encrypt(&mut rand::thread_rng(), oaep(), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }
}

/// A user's long-term RSA-OAEP key pair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    private_key: RsaPrivateKey,
    public_key: IdentityPublicKey,
}

impl IdentityKeyPair {
    /// Generate a 4096-bit identity. Takes hundreds of milliseconds or more;
    /// use [`IdentityKeyPair::generate_async`] from async code.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(IDENTITY_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_IDENTITY_KEY_BITS {
            return Err(CryptoError::KeyGeneration(format!(
                "modulus of {} bits is below the {} bit minimum",
                bits, MIN_IDENTITY_KEY_BITS
            )));
        }
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_private(private_key))
    }

    /// [`IdentityKeyPair::generate_with_bits`] on the blocking thread pool.
    pub async fn generate_async(bits: usize) -> Result<Self, CryptoError> {
        tokio::task::spawn_blocking(move || Self::generate_with_bits(bits))
            .await
            .map_err(|e| CryptoError::Task(e.to_string()))?
    }

    fn from_private(private_key: RsaPrivateKey) -> Self {
        let public_key = IdentityPublicKey(private_key.to_public_key());
        Self {
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> &IdentityPublicKey {
        &self.public_key
    }

    /// RSA-OAEP decrypt a secret addressed to this identity.
    pub fn decrypt_with(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private_key
            .decrypt(oaep(), ciphertext)
            .map_err(|_| CryptoError::AuthFailure)
    }

    /// Seal the PKCS#8 DER private key under the protection key.
    pub fn wrap(&self, protection_key: &ProtectionKey) -> Result<String, CryptoError> {
        let der = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        envelope::seal(protection_key, der.as_bytes())
    }

    /// Open a wrapped private key and pair it with its published public key.
    ///
    /// Fails with [`CryptoError::AuthFailure`] for a wrong protection key, a
    /// tampered envelope, or a private key that does not belong to
    /// `public_key`.
    pub fn unwrap(
        wrapped: &str,
        protection_key: &ProtectionKey,
        public_key: &IdentityPublicKey,
    ) -> Result<Self, CryptoError> {
        let der = zeroize::Zeroizing::new(envelope::open(protection_key, wrapped)?);
        let private_key =
            RsaPrivateKey::from_pkcs8_der(&der).map_err(|_| CryptoError::AuthFailure)?;
        let identity = Self::from_private(private_key);
        if identity.public_key != *public_key {
            return Err(CryptoError::AuthFailure);
        }
        Ok(identity)
    }

    /// PKCS#8 DER export of the private key, zeroized on drop.
    pub fn export_private_der(&self) -> Result<zeroize::Zeroizing<Vec<u8>>, CryptoError> {
        let der = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(zeroize::Zeroizing::new(der.as_bytes().to_vec()))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("bits", &self.public_key.bits())
            .finish_non_exhaustive()
    }
}
