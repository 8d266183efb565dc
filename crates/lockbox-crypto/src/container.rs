//! Container header: `[1 byte: IV length][IV bytes]`
//!
//! No magic number and no version field; the IV length check is the only
//! validation a container gets before its ciphertext reaches the cipher.

use std::io::{self, Read, Write};

use lockbox_core::CodecError;

use crate::key::Iv;
use crate::IV_SIZE;

/// Length of the header written in front of every ciphertext
pub const HEADER_LEN: usize = 1 + IV_SIZE;

/// Write the length byte followed by the raw IV.
pub fn write_header<W: Write + ?Sized>(sink: &mut W, iv: &[u8]) -> io::Result<()> {
    let len = u8::try_from(iv.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("IV of {} bytes does not fit a one-byte length", iv.len()),
        )
    })?;
    sink.write_all(&[len])?;
    sink.write_all(iv)
}

/// Read and validate the header, returning the IV.
///
/// The declared length must equal the cipher's IV size; anything else is
/// rejected before any IV bytes are consumed.
pub fn read_header<R: Read + ?Sized>(source: &mut R) -> Result<Iv, CodecError> {
    let mut len = [0u8; 1];
    if read_full(source, &mut len)? == 0 {
        return Err(CodecError::Truncated {
            expected: 1,
            found: 0,
        });
    }

    let declared = usize::from(len[0]);
    if declared != IV_SIZE {
        return Err(CodecError::UnexpectedLength {
            expected: IV_SIZE,
            found: declared,
        });
    }

    let mut iv = [0u8; IV_SIZE];
    let found = read_full(source, &mut iv)?;
    if found < IV_SIZE {
        return Err(CodecError::Truncated {
            expected: IV_SIZE,
            found,
        });
    }
    Ok(iv)
}

/// Fill `buf` until it is full or the source hits EOF; returns bytes read.
fn read_full<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
