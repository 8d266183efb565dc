//! CryptoOrchestrator: runs one encrypt or decrypt operation end to end.
//!
//! ```text
//! encrypt: open source → reserve <name>.enc → ensure key → request cipher
//!          → authenticate → write header → copy(source → CbcEncryptWriter(sink))
//!          → catalog.add_entry
//! decrypt: open source → read header (IV) → request cipher → authenticate
//!          → create target → copy(CbcDecryptReader(source) → target)
//!          → catalog.add_entry
//! ```
//!
//! Each operation runs as its own tokio task and obtains its own cipher. The
//! authentication wait is async and cancellable; the transfer itself runs on
//! the blocking pool and cannot be cancelled once started.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lockbox_core::config::{expand_tilde, LockboxConfig};
use lockbox_core::{
    CipherMode, FileDescriptor, IoError, LockboxError, LockboxResult, OperationState,
};
use lockbox_crypto::{copy, read_header, write_header, Cipher, TransferOptions};
use lockbox_secrets::{AuthGate, CipherRequest, KeyManager};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::events::{CryptoEvent, EventSink, OperationHandle};

/// Upper bound on `<name>_<n>.enc` candidates before giving up
pub const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Where and how operations write their output
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Directory encrypted artifacts are created in
    pub output_dir: PathBuf,
    /// Appended to the source name, e.g. `.enc`
    pub encrypted_suffix: String,
    pub transfer: TransferOptions,
}

impl OrchestratorOptions {
    pub fn from_config(config: &LockboxConfig) -> Self {
        Self {
            output_dir: expand_tilde(&config.storage.output_dir),
            encrypted_suffix: config.storage.encrypted_suffix.clone(),
            transfer: TransferOptions::from(&config.transfer),
        }
    }
}

#[derive(Clone)]
pub struct CryptoOrchestrator {
    keys: Arc<KeyManager>,
    gate: Arc<AuthGate>,
    catalog: Arc<dyn Catalog>,
    options: OrchestratorOptions,
}

impl CryptoOrchestrator {
    pub fn new(
        keys: Arc<KeyManager>,
        gate: Arc<AuthGate>,
        catalog: Arc<dyn Catalog>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            keys,
            gate,
            catalog,
            options,
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Encrypt `source` into a new artifact under the output directory.
    ///
    /// Must be called from within a tokio runtime.
    pub fn encrypt(&self, source: FileDescriptor) -> OperationHandle {
        let this = self.clone();
        self.spawn(CipherMode::Encrypt, move |events, cancel| async move {
            this.run_encrypt(source, &events, &cancel).await
        })
    }

    /// Decrypt the container described by `source` into `target`, recording
    /// the result under `expected_name`.
    ///
    /// An existing file at `target` is overwritten.
    pub fn decrypt(
        &self,
        source: FileDescriptor,
        target: PathBuf,
        expected_name: String,
    ) -> OperationHandle {
        let this = self.clone();
        self.spawn(CipherMode::Decrypt, move |events, cancel| async move {
            this.run_decrypt(source, target, expected_name, &events, &cancel)
                .await
        })
    }

    fn spawn<F, Fut>(&self, mode: CipherMode, op: F) -> OperationHandle
    where
        F: FnOnce(EventSink, CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = LockboxResult<FileDescriptor>> + Send + 'static,
    {
        let (events, rx) = EventSink::channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            events.emit(CryptoEvent::State(OperationState::Start));
            let result = op(events.clone(), task_cancel).await;
            match &result {
                Ok(fd) => {
                    info!(op = %mode, path = %fd.location.display(), bytes = fd.size, "operation complete");
                    events.emit(CryptoEvent::State(OperationState::Complete));
                    events.emit(CryptoEvent::Complete(fd.clone()));
                }
                Err(e) => {
                    warn!(op = %mode, kind = ?e.kind(), error = %e, "operation failed");
                    events.emit(CryptoEvent::State(OperationState::Failed));
                    events.emit(CryptoEvent::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
            result
        });

        OperationHandle::new(mode, cancel, rx, task)
    }

    async fn run_encrypt(
        &self,
        source: FileDescriptor,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> LockboxResult<FileDescriptor> {
        debug!(op = "encrypt", path = %source.location.display(), "start");

        let source_path = source.location.clone();
        let output_dir = self.options.output_dir.clone();
        let base_name = artifact_base_name(&source.display_name);
        let suffix = self.options.encrypted_suffix.clone();
        let (input, (target, output)) = blocking(move || {
            let input = open_source(&source_path)?;
            let reserved = reserve_target(&output_dir, &base_name, &suffix, MAX_NAME_ATTEMPTS)?;
            Ok((input, reserved))
        })
        .await?;
        debug!(op = "encrypt", target = %target.display(), "reserved output name");

        events.emit(CryptoEvent::State(OperationState::AwaitingAuth));
        let cipher = match self.authorize(CipherRequest::Encrypt, cancel).await {
            Ok(cipher) => cipher,
            Err(e) => {
                drop(output);
                discard_placeholder(&target);
                return Err(e);
            }
        };

        events.emit(CryptoEvent::State(OperationState::Transferring));
        let total = known_total(source.size);
        if total.is_none() {
            events.emit(CryptoEvent::Indeterminate);
        }

        let options = self.options.transfer;
        let progress = events.clone();
        let transferred = blocking(move || {
            let mut sink = BufWriter::new(output);
            write_header(&mut sink, cipher.iv()).map_err(|e| IoError::TransferFailed {
                bytes_transferred: 0,
                source: e,
            })?;
            let sink = cipher
                .encrypt_writer(sink)
                .map_err(|e| IoError::TransferFailed {
                    bytes_transferred: 0,
                    source: e,
                })?;
            let n = copy(input, sink, total, &options, |bytes| {
                progress.emit(CryptoEvent::Progress {
                    bytes,
                    total: total.unwrap_or(bytes),
                })
            })?;
            Ok(n)
        })
        .await?;
        debug!(op = "encrypt", bytes = transferred, "transfer finished");

        let result = FileDescriptor {
            id: None,
            display_name: source.display_name,
            mime_type: source.mime_type,
            location: target,
            size: source.size,
            is_encrypted: true,
        };
        self.persist(result).await
    }

    async fn run_decrypt(
        &self,
        source: FileDescriptor,
        target: PathBuf,
        expected_name: String,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> LockboxResult<FileDescriptor> {
        debug!(op = "decrypt", path = %source.location.display(), "start");

        let source_path = source.location.clone();
        let target_check = target.clone();
        let (input, iv) = blocking(move || {
            if is_same_file(&source_path, &target_check) {
                return Err(IoError::Create {
                    path: target_check,
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "target is the encrypted source itself",
                    ),
                }
                .into());
            }
            let mut input = open_source(&source_path)?;
            let iv = read_header(&mut input)?;
            Ok((input, iv))
        })
        .await?;

        events.emit(CryptoEvent::State(OperationState::AwaitingAuth));
        let cipher = self
            .authorize(CipherRequest::Decrypt { iv }, cancel)
            .await?;

        let target_path = target.clone();
        let output = blocking(move || {
            File::create(&target_path).map_err(|e| {
                LockboxError::from(IoError::Create {
                    path: target_path.clone(),
                    source: e,
                })
            })
        })
        .await?;

        events.emit(CryptoEvent::State(OperationState::Transferring));
        let total = known_total(source.size);
        if total.is_none() {
            events.emit(CryptoEvent::Indeterminate);
        }

        let options = self.options.transfer;
        let progress = events.clone();
        let transferred = blocking(move || {
            let reader = cipher
                .decrypt_reader(input)
                .map_err(|e| IoError::TransferFailed {
                    bytes_transferred: 0,
                    source: e,
                })?;
            let n = copy(reader, BufWriter::new(output), total, &options, |bytes| {
                progress.emit(CryptoEvent::Progress {
                    bytes,
                    total: total.unwrap_or(bytes),
                })
            })?;
            Ok(n)
        })
        .await?;
        debug!(op = "decrypt", bytes = transferred, "transfer finished");

        let mime_type = if source.mime_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            source.mime_type
        };
        let result = FileDescriptor {
            id: None,
            display_name: expected_name,
            mime_type,
            location: target,
            size: transferred,
            is_encrypted: false,
        };
        self.persist(result).await
    }

    /// Request a cipher for this operation and resolve its challenge.
    async fn authorize(
        &self,
        request: CipherRequest,
        cancel: &CancellationToken,
    ) -> LockboxResult<Cipher> {
        if request.mode() == CipherMode::Encrypt {
            self.keys.ensure_key()?;
        }
        let pending = self.keys.request_cipher(request)?;
        let cipher = self.gate.authenticate(pending, cancel).await?;
        Ok(cipher)
    }

    async fn persist(&self, mut result: FileDescriptor) -> LockboxResult<FileDescriptor> {
        let catalog = Arc::clone(&self.catalog);
        let entry = result.clone();
        let id = blocking(move || Ok(catalog.add_entry(&entry)?)).await?;
        result.id = Some(id);
        Ok(result)
    }
}

/// Run filesystem work on the blocking pool.
async fn blocking<T, F>(f: F) -> LockboxResult<T>
where
    F: FnOnce() -> LockboxResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LockboxError::Other(anyhow::anyhow!("blocking task failed: {e}")))?
}

fn known_total(size: u64) -> Option<u64> {
    (size > 0).then_some(size)
}

fn open_source(path: &Path) -> LockboxResult<BufReader<File>> {
    let file = File::open(path).map_err(|e| IoError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(BufReader::new(file))
}

/// Whether both paths resolve to the same existing file.
pub fn is_same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// The display name reduced to a single path component.
fn artifact_base_name(display_name: &str) -> String {
    Path::new(display_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Candidate file name for the `attempt`-th try: `<name><suffix>` first, then
/// `<name>_2<suffix>`, `<name>_3<suffix>`, ...
pub fn candidate_name(base: &str, suffix: &str, attempt: u32) -> String {
    if attempt <= 1 {
        format!("{base}{suffix}")
    } else {
        format!("{base}_{attempt}{suffix}")
    }
}

/// Atomically claim a fresh artifact name in `dir`. Never opens an existing
/// file, so nothing is ever overwritten.
pub fn reserve_target(
    dir: &Path,
    base: &str,
    suffix: &str,
    max_attempts: u32,
) -> Result<(PathBuf, File), IoError> {
    std::fs::create_dir_all(dir).map_err(|e| IoError::Create {
        path: dir.to_path_buf(),
        source: e,
    })?;

    for attempt in 1..=max_attempts {
        let path = dir.join(candidate_name(base, suffix, attempt));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(IoError::Create { path, source: e }),
        }
    }
    Err(IoError::TargetExhausted {
        dir: dir.to_path_buf(),
        name: base.to_string(),
        attempts: max_attempts,
    })
}

/// Remove the empty file created by `reserve_target` when the operation
/// never got to write to it.
fn discard_placeholder(path: &Path) {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "could not remove placeholder");
            }
        }
        Ok(_) => warn!(path = %path.display(), "placeholder not empty, leaving it"),
        Err(_) => {}
    }
}
