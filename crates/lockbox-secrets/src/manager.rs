//! KeyManager: owns the store handle and the key lifecycle policy

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lockbox_core::KeyError;
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::credential::KdfParams;
use crate::store::{CipherRequest, KeyStatus, PendingCipher, SecureKeyStore};

/// Summary of the key's usability, for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHealth {
    /// No credential enrolled, so no key can be created
    NoCredential,
    /// Credential enrolled, key not generated yet
    Missing,
    Ready,
    /// Credential changed since the key was created
    Invalidated,
}

impl std::fmt::Display for KeyHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyHealth::NoCredential => "no credential enrolled",
            KeyHealth::Missing => "not created",
            KeyHealth::Ready => "ready",
            KeyHealth::Invalidated => "invalidated (must be recreated)",
        };
        f.write_str(s)
    }
}

/// Explicitly constructed owner of the secure key store.
///
/// Once a `KeyInvalidated` error has been observed, every further request fails
/// the same way until [`KeyManager::recreate_key`] is called. Nothing recreates
/// the key silently.
pub struct KeyManager {
    store: Arc<dyn SecureKeyStore>,
    invalidated: AtomicBool,
}

impl KeyManager {
    pub fn new(store: Arc<dyn SecureKeyStore>) -> Self {
        Self {
            store,
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn alias(&self) -> &str {
        self.store.alias()
    }

    pub fn ensure_key(&self) -> Result<KeyStatus, KeyError> {
        let status = self.store.ensure_key()?;
        match status {
            KeyStatus::Created => info!(alias = self.alias(), "created key"),
            KeyStatus::Exists => debug!(alias = self.alias(), "key already exists"),
        }
        Ok(status)
    }

    /// Bind the key to a new cipher awaiting authentication. Each file
    /// operation must make its own request.
    pub fn request_cipher(&self, request: CipherRequest) -> Result<PendingCipher, KeyError> {
        if self.invalidated.load(Ordering::Acquire) {
            return Err(KeyError::KeyInvalidated(self.alias().to_string()));
        }
        match self.store.cipher_for(request) {
            Err(KeyError::KeyInvalidated(alias)) => {
                warn!(alias = %alias, "key invalidated by credential change; recreate it explicitly");
                self.invalidated.store(true, Ordering::Release);
                Err(KeyError::KeyInvalidated(alias))
            }
            other => other,
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub fn key_status(&self) -> Result<KeyHealth, KeyError> {
        if !self.store.has_credential()? {
            return Ok(if self.store.has_key()? {
                KeyHealth::Invalidated
            } else {
                KeyHealth::NoCredential
            });
        }
        if !self.store.has_key()? {
            return Ok(KeyHealth::Missing);
        }
        if self.is_invalidated() {
            return Ok(KeyHealth::Invalidated);
        }
        match self.store.cipher_for(CipherRequest::Encrypt) {
            Ok(_) => Ok(KeyHealth::Ready),
            Err(KeyError::KeyInvalidated(_)) => Ok(KeyHealth::Invalidated),
            Err(e) => Err(e),
        }
    }

    /// Destroy and regenerate the key. Containers written with the old key
    /// can never be decrypted again; callers must have the user acknowledge this.
    pub fn recreate_key(&self) -> Result<KeyStatus, KeyError> {
        warn!(
            alias = self.alias(),
            "recreating key; existing containers become undecryptable"
        );
        self.store.delete_key()?;
        let status = self.store.ensure_key()?;
        self.invalidated.store(false, Ordering::Release);
        Ok(status)
    }

    pub fn enroll_credential(
        &self,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> Result<(), KeyError> {
        self.store.enroll_credential(passphrase, params)?;
        info!("enrolled user credential");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::tests::fast_params;
    use crate::memory::MemoryKeyStore;
    use lockbox_core::CipherMode;

    fn manager() -> (Arc<MemoryKeyStore>, KeyManager) {
        let store = Arc::new(MemoryKeyStore::new("my_key"));
        store
            .enroll_credential(&SecretString::from("1234"), &fast_params())
            .unwrap();
        let manager = KeyManager::new(store.clone());
        (store, manager)
    }

    #[test]
    fn test_request_modes() {
        let (_, manager) = manager();
        manager.ensure_key().unwrap();

        let enc = manager.request_cipher(CipherRequest::Encrypt).unwrap();
        assert_eq!(enc.mode(), CipherMode::Encrypt);
        let dec = manager
            .request_cipher(CipherRequest::Decrypt { iv: [1u8; 16] })
            .unwrap();
        assert_eq!(dec.mode(), CipherMode::Decrypt);
    }

    #[test]
    fn test_invalidation_latches_until_recreate() {
        let (store, manager) = manager();
        manager.ensure_key().unwrap();
        assert_eq!(manager.key_status().unwrap(), KeyHealth::Ready);

        store
            .enroll_credential(&SecretString::from("new-pin"), &fast_params())
            .unwrap();
        assert!(matches!(
            manager.request_cipher(CipherRequest::Encrypt),
            Err(KeyError::KeyInvalidated(_))
        ));
        assert!(manager.is_invalidated());
        assert_eq!(manager.key_status().unwrap(), KeyHealth::Invalidated);

        // ensure_key does not paper over it
        assert_eq!(manager.ensure_key().unwrap(), KeyStatus::Exists);
        assert!(manager.request_cipher(CipherRequest::Encrypt).is_err());

        assert_eq!(manager.recreate_key().unwrap(), KeyStatus::Created);
        assert!(!manager.is_invalidated());
        assert!(manager.request_cipher(CipherRequest::Encrypt).is_ok());
    }

    #[test]
    fn test_health_states() {
        let store = Arc::new(MemoryKeyStore::new("my_key"));
        let manager = KeyManager::new(store.clone());
        assert_eq!(manager.key_status().unwrap(), KeyHealth::NoCredential);

        manager
            .enroll_credential(&SecretString::from("1234"), &fast_params())
            .unwrap();
        assert_eq!(manager.key_status().unwrap(), KeyHealth::Missing);

        manager.ensure_key().unwrap();
        assert_eq!(manager.key_status().unwrap(), KeyHealth::Ready);

        store.remove_credential().unwrap();
        assert_eq!(manager.key_status().unwrap(), KeyHealth::Invalidated);
    }
}
