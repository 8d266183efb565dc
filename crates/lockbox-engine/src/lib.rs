//! lockbox-engine: encrypt/decrypt operations on top of the key lifecycle
//!
//! A host builds one [`CryptoOrchestrator`] from a [`KeyManager`](lockbox_secrets::KeyManager),
//! an [`AuthGate`](lockbox_secrets::AuthGate) and a [`Catalog`], then starts
//! operations with [`CryptoOrchestrator::encrypt`] / [`CryptoOrchestrator::decrypt`].
//! Each returns an [`OperationHandle`] delivering [`CryptoEvent`]s.

pub mod catalog;
pub mod events;
pub mod orchestrator;

pub use catalog::{Catalog, JsonCatalog};
pub use events::{CryptoEvent, OperationHandle};
pub use orchestrator::{
    candidate_name, is_same_file, reserve_target, CryptoOrchestrator, OrchestratorOptions, MAX_NAME_ATTEMPTS,
};
