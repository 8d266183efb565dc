//! Process-local key store for tests and throwaway sessions

use std::sync::{Mutex, MutexGuard};

use lockbox_core::KeyError;
use lockbox_crypto::SymmetricKey;
use secrecy::SecretString;
use tracing::debug;

use crate::credential::{CredentialVerifier, KdfParams};
use crate::store::{CipherRequest, KeyStatus, PendingCipher, SecureKeyStore};

struct StoredKey {
    key: SymmetricKey,
    credential_fingerprint: String,
}

/// Keeps the key and the credential in memory; both vanish with the process.
pub struct MemoryKeyStore {
    alias: String,
    key: Mutex<Option<StoredKey>>,
    credential: Mutex<Option<CredentialVerifier>>,
}

impl MemoryKeyStore {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            key: Mutex::new(None),
            credential: Mutex::new(None),
        }
    }

    /// Drop the enrolled credential, as when the user removes their lock screen.
    pub fn remove_credential(&self) -> Result<(), KeyError> {
        *lock(&self.credential)? = None;
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, KeyError> {
    m.lock()
        .map_err(|_| KeyError::StoreUnavailable("memory key store lock poisoned".into()))
}

impl SecureKeyStore for MemoryKeyStore {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn ensure_key(&self) -> Result<KeyStatus, KeyError> {
        let mut key = lock(&self.key)?;
        if key.is_some() {
            return Ok(KeyStatus::Exists);
        }
        let fingerprint = lock(&self.credential)?
            .as_ref()
            .map(CredentialVerifier::fingerprint)
            .ok_or_else(|| {
                KeyError::GenerationFailed(
                    "no user credential enrolled; enroll one before creating the key".into(),
                )
            })?;

        *key = Some(StoredKey {
            key: SymmetricKey::generate(),
            credential_fingerprint: fingerprint,
        });
        debug!(alias = %self.alias, "generated key in memory store");
        Ok(KeyStatus::Created)
    }

    fn has_key(&self) -> Result<bool, KeyError> {
        Ok(lock(&self.key)?.is_some())
    }

    fn cipher_for(&self, request: CipherRequest) -> Result<PendingCipher, KeyError> {
        let key = lock(&self.key)?;
        let stored = key
            .as_ref()
            .ok_or_else(|| KeyError::KeyNotFound(self.alias.clone()))?;

        let credential = lock(&self.credential)?;
        let verifier = match credential.as_ref() {
            Some(v) if v.fingerprint() == stored.credential_fingerprint => v.clone(),
            _ => return Err(KeyError::KeyInvalidated(self.alias.clone())),
        };

        Ok(PendingCipher::new(
            request,
            stored.key.clone(),
            verifier,
            &self.alias,
        ))
    }

    fn delete_key(&self) -> Result<(), KeyError> {
        *lock(&self.key)? = None;
        Ok(())
    }

    fn enroll_credential(
        &self,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> Result<(), KeyError> {
        let verifier = CredentialVerifier::enroll(passphrase, params)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
        *lock(&self.credential)? = Some(verifier);
        Ok(())
    }

    fn has_credential(&self) -> Result<bool, KeyError> {
        Ok(lock(&self.credential)?.is_some())
    }
}
