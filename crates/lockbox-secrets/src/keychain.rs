//! Platform keychain key store.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS: Keychain Services
//! - Linux: kernel keyutils (persists for the login session)
//! - Windows: Credential Manager (DPAPI)
//!
//! Two JSON entries live under the configured service: `key:<alias>` holds the
//! [`KeyRecord`], `credential` holds the user's [`CredentialVerifier`].

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use lockbox_core::KeyError;
use lockbox_crypto::{SymmetricKey, KEY_SIZE};
use secrecy::SecretString;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::credential::{CredentialVerifier, KdfParams};
use crate::store::{now_unix, CipherRequest, KeyRecord, KeyStatus, PendingCipher, SecureKeyStore};

/// Well-known keychain entry names
pub mod entries {
    /// The enrolled user credential verifier
    pub const CREDENTIAL: &str = "credential";

    /// Scratch entry written and removed by the availability check
    pub const AVAILABILITY_CHECK: &str = "__lockbox_check__";

    /// Entry name of the key record for `alias`
    pub fn key(alias: &str) -> String {
        format!("key:{alias}")
    }
}

pub struct KeychainKeyStore {
    service: String,
    alias: String,
}

impl KeychainKeyStore {
    pub fn new(service: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            alias: alias.into(),
        }
    }

    /// Check if the platform keychain is reachable.
    pub fn is_available(&self) -> bool {
        self.check_available().is_ok()
    }

    /// Write, read back and delete a scratch entry. Fails when no persistent
    /// backend is compiled in or the platform store rejects the round trip.
    pub fn check_available(&self) -> Result<(), KeyError> {
        let nonce: u64 = rand::random();
        let token = format!("{nonce:016x}");
        let entry = self.entry(entries::AVAILABILITY_CHECK)?;

        entry
            .set_password(&token)
            .map_err(|e| KeyError::StoreUnavailable(format!("keychain write check: {e}")))?;
        // a fresh handle, so a backend that only remembers per handle is caught
        let read_back = self
            .entry(entries::AVAILABILITY_CHECK)?
            .get_password()
            .map_err(|e| KeyError::StoreUnavailable(format!("keychain read check: {e}")));
        let _ = entry.delete_credential();

        if read_back? != token {
            return Err(KeyError::StoreUnavailable(
                "keychain did not return the value just stored".into(),
            ));
        }
        debug!(service = %self.service, "platform keychain available");
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, name)
            .map_err(|e| KeyError::StoreUnavailable(format!("keychain entry '{name}': {e}")))
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, KeyError> {
        match self.entry(name)?.get_password() {
            Ok(mut json) => {
                let parsed = serde_json::from_str(&json).map_err(|e| {
                    KeyError::StoreUnavailable(format!("corrupt keychain entry '{name}': {e}"))
                });
                json.zeroize();
                parsed.map(Some)
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeyError::StoreUnavailable(format!(
                "keychain get for '{name}': {e}"
            ))),
        }
    }

    fn store<T: Serialize>(&self, name: &str, value: &T) -> Result<(), KeyError> {
        let mut json = serde_json::to_string(value)
            .map_err(|e| KeyError::StoreUnavailable(format!("serializing '{name}': {e}")))?;
        let result = self
            .entry(name)?
            .set_password(&json)
            .map_err(|e| KeyError::StoreUnavailable(format!("keychain store for '{name}': {e}")));
        json.zeroize();
        result?;
        debug!(entry = name, "stored entry in platform keychain");
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), KeyError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeyError::StoreUnavailable(format!(
                "keychain delete for '{name}': {e}"
            ))),
        }
    }
}

fn decode_key(record: &KeyRecord, alias: &str) -> Result<SymmetricKey, KeyError> {
    let mut bytes = B64
        .decode(&record.key)
        .map_err(|e| KeyError::StoreUnavailable(format!("key '{alias}' is not valid base64: {e}")))?;
    if bytes.len() != KEY_SIZE {
        bytes.zeroize();
        return Err(KeyError::StoreUnavailable(format!(
            "key '{alias}' has wrong size"
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(SymmetricKey::from_bytes(key))
}

impl SecureKeyStore for KeychainKeyStore {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn ensure_key(&self) -> Result<KeyStatus, KeyError> {
        let name = entries::key(&self.alias);
        if self.load::<KeyRecord>(&name)?.is_some() {
            return Ok(KeyStatus::Exists);
        }

        let credential: CredentialVerifier =
            self.load(entries::CREDENTIAL)?.ok_or_else(|| {
                KeyError::GenerationFailed(
                    "no user credential enrolled; run `lockbox credential set` first".into(),
                )
            })?;

        let key = SymmetricKey::generate();
        let record = KeyRecord {
            key: B64.encode(key.as_bytes()),
            credential_fingerprint: credential.fingerprint(),
            created_at: now_unix(),
        };
        self.store(&name, &record)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
        info!(alias = %self.alias, service = %self.service, "generated key in platform keychain");
        Ok(KeyStatus::Created)
    }

    fn has_key(&self) -> Result<bool, KeyError> {
        Ok(self.load::<KeyRecord>(&entries::key(&self.alias))?.is_some())
    }

    fn cipher_for(&self, request: CipherRequest) -> Result<PendingCipher, KeyError> {
        let record: KeyRecord = self
            .load(&entries::key(&self.alias))?
            .ok_or_else(|| KeyError::KeyNotFound(self.alias.clone()))?;

        let verifier = match self.load::<CredentialVerifier>(entries::CREDENTIAL)? {
            Some(v) if v.fingerprint() == record.credential_fingerprint => v,
            _ => return Err(KeyError::KeyInvalidated(self.alias.clone())),
        };

        let key = decode_key(&record, &self.alias)?;
        Ok(PendingCipher::new(request, key, verifier, &self.alias))
    }

    fn delete_key(&self) -> Result<(), KeyError> {
        self.remove(&entries::key(&self.alias))?;
        info!(alias = %self.alias, "deleted key from platform keychain");
        Ok(())
    }

    fn enroll_credential(
        &self,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> Result<(), KeyError> {
        let verifier = CredentialVerifier::enroll(passphrase, params)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
        self.store(entries::CREDENTIAL, &verifier)
    }

    fn has_credential(&self) -> Result<bool, KeyError> {
        Ok(self
            .load::<CredentialVerifier>(entries::CREDENTIAL)?
            .is_some())
    }
}
