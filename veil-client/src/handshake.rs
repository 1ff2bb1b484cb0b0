//! Client side of the chat-key handshake.
//!
//! The server brokers the exchange but only ever sees the two wrapped copies
//! produced by [`prepare_approval`]:
//!
//! 1. the requester (Alice) creates a pending chat request;
//! 2. the approver (Bob) fetches Alice's public key, calls
//!    [`prepare_approval`] and submits both wrapped copies;
//! 3. each side later fetches its own copy and calls [`open_chat_key`].

use crate::crypto::{ChatKey, CryptoError, IdentityKeyPair, IdentityPublicKey, KEY_LEN};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use zeroize::Zeroizing;

/// Output of the approver's local step.
#[derive(Debug)]
pub struct ApprovalKeys {
    /// The new chat key, kept by the approver.
    pub chat_key: ChatKey,
    /// Chat key wrapped for the approver (the request's recipient).
    pub encrypted_recipient_key: String,
    /// Chat key wrapped for the requester (the request's sender).
    pub encrypted_sender_key: String,
}

/// Body of the "finish approval" call, in its wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishApprovalRequest {
    pub request_id: String,
    pub encrypted_recipient_key: String,
    pub encrypted_sender_key: String,
}

impl ApprovalKeys {
    pub fn into_request(self, request_id: impl Into<String>) -> (ChatKey, FinishApprovalRequest) {
        let request = FinishApprovalRequest {
            request_id: request_id.into(),
            encrypted_recipient_key: self.encrypted_recipient_key,
            encrypted_sender_key: self.encrypted_sender_key,
        };
        (self.chat_key, request)
    }
}

/// Wrap `chat_key` for the holder of `public_key` (base64 RSA-OAEP).
pub fn wrap_chat_key(public_key: &IdentityPublicKey, chat_key: &ChatKey) -> Result<String, CryptoError> {
    let ciphertext = public_key.encrypt_for(chat_key.as_bytes())?;
    Ok(STANDARD.encode(ciphertext))
}

/// Generate a chat key and wrap it once for each participant.
pub fn prepare_approval(
    own_public_key: &IdentityPublicKey,
    requester_public_key: &IdentityPublicKey,
) -> Result<ApprovalKeys, CryptoError> {
    let chat_key = ChatKey::generate();
    let encrypted_recipient_key = wrap_chat_key(own_public_key, &chat_key)?;
    let encrypted_sender_key = wrap_chat_key(requester_public_key, &chat_key)?;
    Ok(ApprovalKeys {
        chat_key,
        encrypted_recipient_key,
        encrypted_sender_key,
    })
}

/// [`prepare_approval`] taking the requester's key in its `publicKey`
/// transport form.
pub fn prepare_approval_for(
    identity: &IdentityKeyPair,
    requester_public_key: &str,
) -> Result<ApprovalKeys, CryptoError> {
    let requester = IdentityPublicKey::import(requester_public_key)?;
    prepare_approval(identity.public_key(), &requester)
}

/// Recover the chat key from this participant's wrapped copy.
pub fn open_chat_key(identity: &IdentityKeyPair, wrapped: &str) -> Result<ChatKey, CryptoError> {
    let ciphertext = STANDARD
        .decode(wrapped)
        .map_err(|_| CryptoError::AuthFailure)?;
    let raw = Zeroizing::new(identity.decrypt_with(&ciphertext)?);
    if raw.len() != KEY_LEN {
        return Err(CryptoError::AuthFailure);
    }
    ChatKey::from_slice(&raw)
}
