use super::error::CryptoError;
use super::security_key::SecurityKey;
use keyring::Entry;

const KEYRING_SERVICE: &str = "veil-chat";
const KEYRING_SECURITY_KEY_PREFIX: &str = "security-key-";

fn entry(user_id: &str) -> Result<Entry, CryptoError> {
    Entry::new(
        KEYRING_SERVICE,
        &format!("{}{}", KEYRING_SECURITY_KEY_PREFIX, user_id),
    )
    .map_err(|e| CryptoError::Storage(format!("Failed to access keyring: {}", e)))
}

/// Store the security key in the OS keyring (Windows Credential Manager,
/// macOS Keychain, Linux Secret Service).
pub fn store_security_key(user_id: &str, key: &SecurityKey) -> Result<(), CryptoError> {
    // Keyring entries are strings; store the same hex form the user sees
    entry(user_id)?
        .set_password(&key.export())
        .map_err(|e| CryptoError::Storage(format!("Failed to store security key: {}", e)))
}

/// Load the security key from the OS keyring, if one was stored.
pub fn load_security_key(user_id: &str) -> Result<Option<SecurityKey>, CryptoError> {
    match entry(user_id)?.get_password() {
        Ok(encoded) => SecurityKey::import(&encoded).map(Some),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(CryptoError::Storage(format!(
            "Failed to retrieve security key: {}",
            e
        ))),
    }
}

/// Remove the security key from the OS keyring (logout).
pub fn delete_security_key(user_id: &str) -> Result<(), CryptoError> {
    match entry(user_id)?.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
        Err(e) => Err(CryptoError::Storage(format!(
            "Failed to delete security key: {}",
            e
        ))),
    }
}
