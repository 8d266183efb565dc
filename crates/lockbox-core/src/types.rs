use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Direction of a cipher operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

impl std::fmt::Display for CipherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherMode::Encrypt => f.write_str("encrypt"),
            CipherMode::Decrypt => f.write_str("decrypt"),
        }
    }
}

/// Per-operation state machine: `Start → AwaitingAuth → Transferring → Complete`,
/// or `Failed` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Start,
    AwaitingAuth,
    Transferring,
    Complete,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Complete | OperationState::Failed)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationState::Start => "start",
            OperationState::AwaitingAuth => "awaiting-auth",
            OperationState::Transferring => "transferring",
            OperationState::Complete => "complete",
            OperationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One side of a conversion: either the plaintext file or the encrypted artifact.
///
/// For encrypted artifacts, `display_name`, `mime_type` and `size` describe the
/// originating plaintext file; the ciphertext is larger by the header and padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Catalog id, `None` until persisted
    #[serde(default)]
    pub id: Option<i64>,
    pub display_name: String,
    pub mime_type: String,
    pub location: PathBuf,
    /// Plaintext size in bytes
    pub size: u64,
    pub is_encrypted: bool,
}

impl FileDescriptor {
    /// Describe a plaintext file on disk, guessing its mime type from the extension.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".into());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(FileDescriptor {
            id: None,
            display_name,
            mime_type,
            location: path.to_path_buf(),
            size: meta.len(),
            is_encrypted: false,
        })
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

impl std::fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id {
            Some(id) => write!(f, "#{id} ")?,
            None => f.write_str("#- ")?,
        }
        write!(
            f,
            "{} ({}, {} bytes{}) at {}",
            self.display_name,
            self.mime_type,
            self.size,
            if self.is_encrypted { ", encrypted" } else { "" },
            self.location.display()
        )
    }
}
