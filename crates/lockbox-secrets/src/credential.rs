//! User credential: Argon2id passphrase verifier
//!
//! Stands in for the device lock-screen credential. A key can only be created
//! while a credential is enrolled, and it stops working once that credential
//! is replaced or removed.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use lockbox_core::config::AuthConfig;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

const SALT_SIZE: usize = 16;
const VERIFIER_SIZE: usize = 32;

/// Argon2id parameters for the verifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&AuthConfig> for KdfParams {
    fn from(config: &AuthConfig) -> Self {
        Self {
            mem_cost_kib: config.argon2_mem_cost_kib,
            time_cost: config.argon2_time_cost,
            parallelism: config.argon2_parallelism,
        }
    }
}

/// Salted Argon2id output for the enrolled passphrase. Holds no secret that
/// lets anyone recover the passphrase.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialVerifier {
    salt: String,
    verifier: String,
    params: KdfParams,
}

impl CredentialVerifier {
    /// Enroll a passphrase with a fresh random salt.
    pub fn enroll(passphrase: &SecretString, params: &KdfParams) -> anyhow::Result<Self> {
        if passphrase.expose_secret().is_empty() {
            anyhow::bail!("credential passphrase must not be empty");
        }
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut derived = derive(passphrase, &salt, params)?;
        let verifier = CredentialVerifier {
            salt: B64.encode(salt),
            verifier: B64.encode(derived),
            params: params.clone(),
        };
        derived.zeroize();
        Ok(verifier)
    }

    /// Check a candidate passphrase in constant time.
    pub fn verify(&self, passphrase: &SecretString) -> anyhow::Result<bool> {
        let salt = decode_fixed::<SALT_SIZE>(&self.salt, "salt")?;
        let stored = decode_fixed::<VERIFIER_SIZE>(&self.verifier, "verifier")?;

        let mut candidate = derive(passphrase, &salt, &self.params)?;
        // blake3::Hash equality is constant-time
        let matches = blake3::hash(&candidate) == blake3::hash(&stored);
        candidate.zeroize();
        Ok(matches)
    }

    /// Short stable identifier of this enrollment, recorded with the key so a
    /// later credential change is detectable.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(self.verifier.as_bytes());
        hasher.finalize().to_hex().as_str()[..16].to_string()
    }
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("fingerprint", &self.fingerprint())
            .field("params", &self.params)
            .finish()
    }
}

fn derive(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> anyhow::Result<[u8; VERIFIER_SIZE]> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(VERIFIER_SIZE),
    )
    .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut out = [0u8; VERIFIER_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut out)
        .map_err(|e| anyhow::anyhow!("Argon2id KDF failed: {e}"))?;
    Ok(out)
}

fn decode_fixed<const N: usize>(encoded: &str, what: &str) -> anyhow::Result<[u8; N]> {
    let mut bytes = B64
        .decode(encoded)
        .map_err(|e| anyhow::anyhow!("credential {what} is not valid base64: {e}"))?;
    if bytes.len() != N {
        bytes.zeroize();
        anyhow::bail!("credential {what} has {} bytes, expected {N}", bytes.len());
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(out)
}
