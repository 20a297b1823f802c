//! A buffered pack-stream reader that keeps a running digest and offset.
//!
//! Every byte consumed through the tracked methods is fed to the SHA-1 that
//! must eventually equal the pack trailer; the trailer itself is read
//! untracked.

use gitwire_hash::{Hasher, ObjectId};
use std::io;

const BUF_LEN: usize = 64 * 1024;

pub(crate) struct PackInput<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    hasher: Hasher,
    offset: u64,
}

impl<R: io::Read> PackInput<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; BUF_LEN],
            start: 0,
            end: 0,
            hasher: Hasher::new(),
            offset: 0,
        }
    }

    /// The absolute offset of the next unconsumed byte.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// The digest of everything consumed so far.
    pub(crate) fn digest(&self) -> ObjectId {
        self.hasher.clone_and_finalize()
    }

    /// Expose buffered bytes without consuming, refilling if empty.
    ///
    /// An empty return slice means end of stream.
    pub(crate) fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.start == self.end {
            self.start = 0;
            self.end = loop {
                match self.inner.read(&mut self.buf) {
                    Ok(n) => break n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            };
        }
        Ok(&self.buf[self.start..self.end])
    }

    /// Consume `n` buffered bytes, feeding them to the digest.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.hasher.update(&self.buf[self.start..self.start + n]);
        self.start += n;
        self.offset += n as u64;
    }

    /// Read exactly `out.len()` tracked bytes.
    pub(crate) fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let available = self.fill_buf()?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pack stream ended prematurely",
                ));
            }
            let n = available.len().min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&available[..n]);
            filled += n;
            self.consume(n);
        }
        Ok(())
    }

    /// Read a single tracked byte.
    pub(crate) fn read_u8(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Read the 20-byte trailer without feeding it to the digest.
    pub(crate) fn read_trailer(&mut self) -> io::Result<ObjectId> {
        let mut trailer = [0u8; 20];
        let mut filled = 0;
        while filled < trailer.len() {
            let available = self.fill_buf()?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pack stream ended inside the trailing checksum",
                ));
            }
            let n = available.len().min(trailer.len() - filled);
            trailer[filled..filled + n].copy_from_slice(&available[..n]);
            filled += n;
            // untracked: advance the buffer but not the digest
            self.start += n;
            self.offset += n as u64;
        }
        Ok(ObjectId::from_bytes_or_panic(&trailer))
    }
}
