//! lockbox-crypto: the cipher pipeline behind every encrypt/decrypt operation
//!
//! Container layout (binary):
//! ```text
//! [1 byte: IV length (16)][16 bytes: IV][N bytes: AES-256-CBC/PKCS7 ciphertext]
//! ```
//!
//! Pipeline:
//! ```text
//! encrypt: plaintext source ──copy──▶ CbcEncryptWriter ──▶ sink (header already written)
//! decrypt: source (header consumed) ──▶ CbcDecryptReader ──copy──▶ plaintext sink
//! ```
//!
//! The copy loop never branches on direction; the cipher is applied by
//! wrapping the sink or the source before it reaches [`stream::copy`].

pub mod cipher;
pub mod container;
pub mod key;
pub mod stream;

pub use cipher::{CbcDecryptReader, CbcEncryptWriter, Cipher};
pub use container::{read_header, write_header, HEADER_LEN};
pub use key::{generate_iv, Iv, SymmetricKey};
pub use stream::{copy, ByteSink, ByteSource, ProgressThrottle, TransferOptions};

/// Size of the AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// AES block size, which is also the CBC IV size
pub const BLOCK_SIZE: usize = 16;

/// Size of the IV carried in the container header
pub const IV_SIZE: usize = BLOCK_SIZE;
