pub mod config;
pub mod error;
pub mod types;

pub use error::{
    AuthError, CatalogError, CodecError, ErrorKind, IoError, KeyError, LockboxError,
    LockboxResult,
};
pub use types::{CipherMode, FileDescriptor, OperationState};
