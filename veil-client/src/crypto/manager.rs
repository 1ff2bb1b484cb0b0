use super::envelope::{self, ChatKey};
use super::error::CryptoError;
use super::identity::{IdentityKeyPair, IdentityPublicKey, IDENTITY_KEY_BITS};
use super::security_key::SecurityKey;
use crate::handshake;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// What the server stores for a user: the public key and the wrapped private
/// key. Neither is secret on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub public_key: String,
    pub wrapped_private_key: String,
}

/// Holds the unlocked identity and the chat keys of one logged-in user
pub struct CryptoManager {
    identity: Mutex<Option<Arc<IdentityKeyPair>>>,
    chat_keys: Mutex<HashMap<String, ChatKey>>,
}

impl Default for CryptoManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoManager {
    pub fn new() -> Self {
        Self {
            identity: Mutex::new(None),
            chat_keys: Mutex::new(HashMap::new()),
        }
    }

    /// Signup: create a security key and a 4096-bit identity.
    ///
    /// Returns the security key (to show the user and keep locally) and the
    /// registration payload to publish.
    pub async fn create_account(&self) -> Result<(SecurityKey, Registration), CryptoError> {
        self.create_account_with_bits(IDENTITY_KEY_BITS).await
    }

    pub async fn create_account_with_bits(
        &self,
        bits: usize,
    ) -> Result<(SecurityKey, Registration), CryptoError> {
        let security_key = SecurityKey::generate();
        let (identity, protection_key) = tokio::try_join!(
            IdentityKeyPair::generate_async(bits),
            security_key.derive_protection_key_async()
        )?;

        let registration = Registration {
            public_key: identity.public_key().export()?,
            wrapped_private_key: identity.wrap(&protection_key)?,
        };

        self.set_identity(identity);
        info!("Created new identity");
        Ok((security_key, registration))
    }

    /// Login: unwrap the stored private key with the user's security key.
    pub async fn unlock(
        &self,
        security_key: &SecurityKey,
        registration: &Registration,
    ) -> Result<(), CryptoError> {
        let public_key = IdentityPublicKey::import(&registration.public_key)?;
        let protection_key = security_key.derive_protection_key_async().await?;
        let identity =
            IdentityKeyPair::unwrap(&registration.wrapped_private_key, &protection_key, &public_key)?;

        self.set_identity(identity);
        info!("Identity unlocked");
        Ok(())
    }

    pub fn set_identity(&self, identity: IdentityKeyPair) {
        *self
            .identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(identity));
    }

    pub fn identity(&self) -> Result<Arc<IdentityKeyPair>, CryptoError> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CryptoError::NoIdentity)
    }

    /// Unwrap this user's copy of a chat key and keep it for the chat.
    pub fn install_chat_key(&self, chat_id: &str, wrapped: &str) -> Result<(), CryptoError> {
        let identity = self.identity()?;
        let chat_key = handshake::open_chat_key(&identity, wrapped)?;
        self.set_chat_key(chat_id, chat_key);
        Ok(())
    }

    pub fn set_chat_key(&self, chat_id: &str, chat_key: ChatKey) {
        self.chat_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chat_id.to_string(), chat_key);
    }

    pub fn has_chat_key(&self, chat_id: &str) -> bool {
        self.chat_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(chat_id)
    }

    fn chat_key(&self, chat_id: &str) -> Result<ChatKey, CryptoError> {
        self.chat_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chat_id)
            .cloned()
            .ok_or_else(|| CryptoError::NoChatKey(chat_id.to_string()))
    }

    /// Seal message content for a chat.
    pub fn encrypt(&self, plaintext: &str, chat_id: &str) -> Result<String, CryptoError> {
        let key = self.chat_key(chat_id)?;
        envelope::seal_str(&key, plaintext)
    }

    /// Open message content received in a chat.
    pub fn decrypt(&self, envelope: &str, chat_id: &str) -> Result<String, CryptoError> {
        let key = self.chat_key(chat_id)?;
        envelope::open_str(&key, envelope)
    }

    /// Logout: forget the identity and every chat key.
    pub fn lock(&self) {
        *self
            .identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.chat_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Crypto state cleared");
    }
}
