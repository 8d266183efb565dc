//! Secure key store capability and the pending-cipher handle it hands out

use lockbox_core::{CipherMode, KeyError};
use lockbox_crypto::{generate_iv, Cipher, Iv, SymmetricKey};
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::credential::{CredentialVerifier, KdfParams};

/// Outcome of `ensure_key`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Created,
    Exists,
}

/// What a caller may ask the store for. Encryption never takes an IV from the
/// caller; a fresh one is generated per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherRequest {
    Encrypt,
    Decrypt { iv: Iv },
}

impl CipherRequest {
    pub fn mode(&self) -> CipherMode {
        match self {
            CipherRequest::Encrypt => CipherMode::Encrypt,
            CipherRequest::Decrypt { .. } => CipherMode::Decrypt,
        }
    }
}

/// Persisted form of the key: material plus the credential it was created under.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// base64 key material
    pub key: String,
    /// Fingerprint of the credential enrolled when the key was generated
    pub credential_fingerprint: String,
    /// Unix timestamp of creation
    pub created_at: u64,
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("key", &"[REDACTED]")
            .field("credential_fingerprint", &self.credential_fingerprint)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Hardware- or OS-backed key storage.
///
/// Implementations keep the key under a fixed alias and only ever release it
/// wrapped in a [`PendingCipher`].
pub trait SecureKeyStore: Send + Sync {
    /// Alias the key lives under
    fn alias(&self) -> &str;

    /// Create the key if it does not exist yet. Idempotent.
    fn ensure_key(&self) -> Result<KeyStatus, KeyError>;

    fn has_key(&self) -> Result<bool, KeyError>;

    /// Bind the stored key to a cipher awaiting authentication.
    ///
    /// Fails with `KeyInvalidated` when the credential the key was created
    /// under has been removed or replaced.
    fn cipher_for(&self, request: CipherRequest) -> Result<PendingCipher, KeyError>;

    /// Destroy the key. Every container written with it becomes undecryptable.
    fn delete_key(&self) -> Result<(), KeyError>;

    /// Enroll (or replace) the user credential.
    fn enroll_credential(&self, passphrase: &SecretString, params: &KdfParams)
        -> Result<(), KeyError>;

    fn has_credential(&self) -> Result<bool, KeyError>;
}

/// One authentication challenge, bound to a single pending cipher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub id: u64,
    pub mode: CipherMode,
    pub key_alias: String,
}

/// A cipher bound to the stored key that cannot be used until the
/// [`AuthGate`](crate::AuthGate) resolves its challenge. Dropping it releases
/// the key material.
pub struct PendingCipher {
    challenge: Challenge,
    iv: Iv,
    key: SymmetricKey,
    verifier: CredentialVerifier,
}

impl PendingCipher {
    pub fn new(
        request: CipherRequest,
        key: SymmetricKey,
        verifier: CredentialVerifier,
        key_alias: &str,
    ) -> Self {
        let iv = match request {
            CipherRequest::Encrypt => generate_iv(),
            CipherRequest::Decrypt { iv } => iv,
        };
        Self {
            challenge: Challenge {
                id: rand::thread_rng().next_u64(),
                mode: request.mode(),
                key_alias: key_alias.to_string(),
            },
            iv,
            key,
            verifier,
        }
    }

    pub fn challenge(&self) -> &Challenge {
        &self.challenge
    }

    pub fn mode(&self) -> CipherMode {
        self.challenge.mode
    }

    pub(crate) fn verify(&self, passphrase: &SecretString) -> anyhow::Result<bool> {
        self.verifier.verify(passphrase)
    }

    /// Only the auth gate turns a pending cipher into a usable one.
    pub(crate) fn into_cipher(self) -> Cipher {
        Cipher::new(self.challenge.mode, self.key, self.iv)
    }
}

impl std::fmt::Debug for PendingCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCipher")
            .field("challenge", &self.challenge)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

pub(crate) fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
