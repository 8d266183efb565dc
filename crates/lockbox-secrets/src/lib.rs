//! lockbox-secrets: the key lifecycle in front of every cipher
//!
//! Flow for one file operation:
//! ```text
//! KeyManager::request_cipher(Encrypt | Decrypt{iv})
//!   └── SecureKeyStore::cipher_for  → PendingCipher (key bound, not yet usable)
//!         └── AuthGate::authenticate → Authenticator::prompt → credential check
//!               └── Cipher (usable for exactly one stream)
//! ```
//!
//! The key never leaves its store through this API; callers only ever hold a
//! pending cipher, and only the gate can turn that into a usable one.

pub mod auth;
pub mod credential;
pub mod keychain;
pub mod manager;
pub mod memory;
pub mod store;

pub use auth::{AuthGate, AuthState, Authenticator, EnvAuthenticator, TerminalAuthenticator};
pub use credential::{CredentialVerifier, KdfParams};
pub use keychain::KeychainKeyStore;
pub use manager::{KeyHealth, KeyManager};
pub use memory::MemoryKeyStore;
pub use store::{Challenge, CipherRequest, KeyRecord, KeyStatus, PendingCipher, SecureKeyStore};
