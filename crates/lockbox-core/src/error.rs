use std::path::PathBuf;
use thiserror::Error;

pub type LockboxResult<T> = Result<T, LockboxError>;

/// Failures of the secure key store or the key lifecycle.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("secure key store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("key generation failed: {0}")]
    GenerationFailed(String),

    #[error("no key stored under alias '{0}'")]
    KeyNotFound(String),

    /// The user credential was removed or replaced after the key was created.
    /// Fatal for the key: it has to be recreated, which orphans every
    /// container written with it.
    #[error("key '{0}' was invalidated by a credential change and must be recreated")]
    KeyInvalidated(String),
}

/// Terminal failures of an authentication challenge. None are retried
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication cancelled")]
    Cancelled,

    #[error("authenticator failure: {0}")]
    HardwareError(String),

    #[error("too many failed attempts ({attempts}), authentication locked out")]
    Lockout { attempts: u32 },

    #[error("another authentication challenge is already outstanding")]
    Busy,
}

/// Container header decoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("container header truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("unexpected IV length in container header: expected {expected}, found {found}")]
    UnexpectedLength { expected: usize, found: usize },

    #[error("reading container header: {0}")]
    Io(#[from] std::io::Error),
}

/// I/O failures around opening streams and pumping bytes between them.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("opening {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("creating {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer failed after {bytes_transferred} bytes: {source}")]
    TransferFailed {
        bytes_transferred: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("no free artifact name for '{name}' in {} after {attempts} attempts", dir.display())]
    TargetExhausted {
        dir: PathBuf,
        name: String,
        attempts: u32,
    },
}

/// Failures of the file catalog collaborator.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing catalog {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no catalog entry with id {0}")]
    NotFound(i64),
}

/// Coarse classification handed to hosts for user-facing messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Key,
    KeyInvalidated,
    Auth,
    AuthCancelled,
    Codec,
    Io,
    Catalog,
    Config,
    Other,
}

#[derive(Debug, Error)]
pub enum LockboxError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LockboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LockboxError::Key(KeyError::KeyInvalidated(_)) => ErrorKind::KeyInvalidated,
            LockboxError::Key(_) => ErrorKind::Key,
            LockboxError::Auth(AuthError::Cancelled) => ErrorKind::AuthCancelled,
            LockboxError::Auth(_) => ErrorKind::Auth,
            LockboxError::Codec(_) => ErrorKind::Codec,
            LockboxError::Io(_) => ErrorKind::Io,
            LockboxError::Catalog(_) => ErrorKind::Catalog,
            LockboxError::Config(_) => ErrorKind::Config,
            LockboxError::Other(_) => ErrorKind::Other,
        }
    }
}
