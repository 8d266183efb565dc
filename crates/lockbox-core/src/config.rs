use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest and largest chunk size the transfer loop accepts
pub const MIN_BUFFER_SIZE: usize = 4096;
pub const MAX_BUFFER_SIZE: usize = 8192;

/// Top-level configuration (loaded from lockbox.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockboxConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub keystore: KeystoreConfig,
    pub auth: AuthConfig,
    pub transfer: TransferConfig,
    /// Warn if the config file is world-readable (default: true)
    pub config_file_mode_check: bool,
}

impl Default for LockboxConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            keystore: KeystoreConfig::default(),
            auth: AuthConfig::default(),
            transfer: TransferConfig::default(),
            config_file_mode_check: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory encrypted artifacts are written to
    pub output_dir: PathBuf,
    /// JSON catalog of produced files
    pub catalog_path: PathBuf,
    /// Suffix appended to the plaintext name to form the artifact name
    pub encrypted_suffix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeystoreBackend {
    /// Platform keychain (macOS Keychain, Linux keyutils, Credential Manager)
    Keychain,
    /// Process-local store; the credential is enrolled at startup and the
    /// key vanishes on exit
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoreConfig {
    pub backend: KeystoreBackend,
    /// Keychain service name entries are stored under
    pub service: String,
    /// Alias of the single active key
    pub key_alias: String,
}

/// User credential and challenge policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Failed attempts allowed per challenge before lockout
    pub max_attempts: u32,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for the copy loop, clamped to 4096..=8192
    pub buffer_size: usize,
    /// Progress is reported each time this percentage of the total is crossed
    pub progress_step_percent: u8,
}

impl TransferConfig {
    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
    }

    pub fn effective_step_percent(&self) -> u8 {
        self.progress_step_percent.clamp(1, 100)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("~/.local/share/lockbox/files"),
            catalog_path: PathBuf::from("~/.local/share/lockbox/catalog.json"),
            encrypted_suffix: ".enc".into(),
        }
    }
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            backend: KeystoreBackend::Keychain,
            service: "lockbox".into(),
            key_alias: "my_key".into(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: MIN_BUFFER_SIZE,
            progress_step_percent: 5,
        }
    }
}

/// Expand a leading `~/` to `$HOME`
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

/// `$XDG_CONFIG_HOME/lockbox/config.toml`, falling back to `~/.config`
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| expand_tilde(Path::new("~/.config")))
        .join("lockbox")
        .join("config.toml")
}
