//! AES-256-CBC with PKCS7 padding as streaming `Write`/`Read` adapters
//!
//! `CbcEncryptWriter` wraps a sink and encrypts whole blocks as they fill up;
//! the padded final block is only written by `close()`. `abort()` skips it,
//! leaving a body that fails the padding check on decryption.
//! `CbcDecryptReader` wraps a source and always holds back the last full
//! ciphertext block until EOF, where the padding is checked and stripped.

use std::io::{self, Read, Write};

use cbc::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
    KeyIvInit,
};
use lockbox_core::CipherMode;
use zeroize::Zeroize;

use crate::key::{Iv, SymmetricKey};
use crate::stream::{ByteSink, ByteSource};
use crate::BLOCK_SIZE;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Ciphertext read ahead from the source per refill
const READ_AHEAD: usize = 4096;

/// A cipher initialised with a key, a mode and an IV.
///
/// Consumed by wrapping exactly one stream, so a cipher cannot be reused
/// across files.
pub struct Cipher {
    mode: CipherMode,
    key: SymmetricKey,
    iv: Iv,
}

impl Cipher {
    pub fn new(mode: CipherMode, key: SymmetricKey, iv: Iv) -> Self {
        Self { mode, key, iv }
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn iv(&self) -> &Iv {
        &self.iv
    }

    /// Wrap a sink so everything written to it is encrypted.
    pub fn encrypt_writer<W: ByteSink>(self, sink: W) -> io::Result<CbcEncryptWriter<W>> {
        if self.mode != CipherMode::Encrypt {
            return Err(mode_mismatch(CipherMode::Encrypt, self.mode));
        }
        let cipher = Aes256CbcEnc::new_from_slices(self.key.as_bytes(), &self.iv)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("cipher init: {e}")))?;
        Ok(CbcEncryptWriter {
            inner: sink,
            cipher: Some(cipher),
            pending: Vec::with_capacity(BLOCK_SIZE),
        })
    }

    /// Wrap a source so everything read from it is decrypted.
    pub fn decrypt_reader<R: ByteSource>(self, source: R) -> io::Result<CbcDecryptReader<R>> {
        if self.mode != CipherMode::Decrypt {
            return Err(mode_mismatch(CipherMode::Decrypt, self.mode));
        }
        let cipher = Aes256CbcDec::new_from_slices(self.key.as_bytes(), &self.iv)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("cipher init: {e}")))?;
        Ok(CbcDecryptReader {
            inner: source,
            cipher: Some(cipher),
            ciphertext: Vec::with_capacity(READ_AHEAD + BLOCK_SIZE),
            scratch: vec![0u8; READ_AHEAD],
            plaintext: Vec::new(),
            pos: 0,
        })
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("mode", &self.mode)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn mode_mismatch(wanted: CipherMode, actual: CipherMode) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("cipher initialised for {actual}, cannot {wanted}"),
    )
}

/// Encrypting sink adapter. Must be closed to emit the final padded block.
pub struct CbcEncryptWriter<W> {
    inner: W,
    cipher: Option<Aes256CbcEnc>,
    /// Plaintext tail shorter than one block
    pending: Vec<u8>,
}

impl<W: ByteSink> CbcEncryptWriter<W> {
    /// Pad and encrypt the final block. Idempotent.
    pub fn finish(&mut self) -> io::Result<()> {
        let Some(cipher) = self.cipher.take() else {
            return Ok(());
        };
        let len = self.pending.len();
        let mut block = [0u8; BLOCK_SIZE];
        block[..len].copy_from_slice(&self.pending);
        self.pending.zeroize();

        let result = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut block, len)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "PKCS7 padding failed"))
            .and_then(|last| self.inner.write_all(last));
        block.zeroize();
        result
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: ByteSink> Write for CbcEncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let cipher = self.cipher.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "write after cipher finished")
        })?;

        self.pending.extend_from_slice(buf);
        let whole = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        if whole > 0 {
            let mut blocks: Vec<u8> = self.pending.drain(..whole).collect();
            for block in blocks.chunks_exact_mut(BLOCK_SIZE) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            self.inner.write_all(&blocks)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: ByteSink> ByteSink for CbcEncryptWriter<W> {
    fn close(&mut self) -> io::Result<()> {
        let finished = self.finish();
        let closed = self.inner.close();
        finished.and(closed)
    }

    fn abort(&mut self) -> io::Result<()> {
        self.cipher = None;
        self.pending.zeroize();
        self.pending.clear();
        self.inner.abort()
    }
}

/// Decrypting source adapter.
pub struct CbcDecryptReader<R> {
    inner: R,
    cipher: Option<Aes256CbcDec>,
    /// Ciphertext not yet decrypted; always keeps the last full block
    ciphertext: Vec<u8>,
    scratch: Vec<u8>,
    plaintext: Vec<u8>,
    pos: usize,
}

impl<R: ByteSource> CbcDecryptReader<R> {
    fn refill(&mut self) -> io::Result<()> {
        self.plaintext.zeroize();
        self.plaintext.clear();
        self.pos = 0;

        let n = loop {
            match self.inner.read(&mut self.scratch) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            return self.finish();
        }

        self.ciphertext.extend_from_slice(&self.scratch[..n]);
        let rem = self.ciphertext.len() % BLOCK_SIZE;
        let whole = self.ciphertext.len() - rem;
        let ready = if rem == 0 {
            whole.saturating_sub(BLOCK_SIZE)
        } else {
            whole
        };
        if ready == 0 {
            return Ok(());
        }

        let Some(cipher) = self.cipher.as_mut() else {
            return Ok(());
        };
        let mut blocks: Vec<u8> = self.ciphertext.drain(..ready).collect();
        for block in blocks.chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.plaintext = blocks;
        Ok(())
    }

    /// EOF reached: the held-back block must be the padded final block.
    fn finish(&mut self) -> io::Result<()> {
        let Some(cipher) = self.cipher.take() else {
            return Ok(());
        };
        if self.ciphertext.len() != BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "ciphertext ends with {} trailing bytes, expected one {BLOCK_SIZE}-byte block",
                    self.ciphertext.len()
                ),
            ));
        }
        let last = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut self.ciphertext)
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad padding: wrong key or corrupted ciphertext",
                )
            })?;
        self.plaintext.extend_from_slice(last);
        self.ciphertext.zeroize();
        self.ciphertext.clear();
        Ok(())
    }
}

impl<R: ByteSource> Read for CbcDecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.plaintext.len() {
                let n = buf.len().min(self.plaintext.len() - self.pos);
                buf[..n].copy_from_slice(&self.plaintext[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.cipher.is_none() {
                return Ok(0);
            }
            self.refill()?;
        }
    }
}

impl<R: ByteSource> ByteSource for CbcDecryptReader<R> {
    fn close(&mut self) -> io::Result<()> {
        self.plaintext.zeroize();
        self.ciphertext.zeroize();
        self.inner.close()
    }
}
