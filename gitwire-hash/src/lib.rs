//! gitwire-hash: Object id and content-hash primitives shared by the gitwire
//! transport crates.
//!
//! Object ids are 20-byte SHA-1 content addresses, compared and hashed by
//! value. The [`Hasher`] computes ids incrementally so pack parsing can digest
//! payloads without holding a second copy.
#![deny(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

use sha1::{Digest, Sha1};
use std::fmt;

/// The number of raw bytes in an object id.
pub const RAW_LEN: usize = 20;

/// The number of hexadecimal characters in an object id.
pub const HEX_LEN: usize = 40;

/// A content-addressed object identifier.
///
/// Immutable once constructed; equality and hashing go by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; RAW_LEN]);

/// The error returned when decoding an object id from its hex form.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The input was not exactly [`HEX_LEN`] characters.
    #[error("hex object id must be {HEX_LEN} characters, got {actual}")]
    InvalidLength {
        /// Length of the rejected input.
        actual: usize,
    },
    /// The input contained a non-hex character.
    #[error("invalid hex digit in object id")]
    InvalidHex,
}

impl ObjectId {
    /// The id consisting of all zeroes, used on the wire to mean "absent".
    pub const fn null() -> Self {
        ObjectId([0u8; RAW_LEN])
    }

    /// `true` if this is the all-zero id.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; RAW_LEN]
    }

    /// Create an id from exactly [`RAW_LEN`] raw bytes.
    ///
    /// # Panics
    /// If `bytes` is not exactly [`RAW_LEN`] long. Use only where the length
    /// is structurally guaranteed, e.g. fixed-size wire fields.
    pub fn from_bytes_or_panic(bytes: &[u8]) -> Self {
        let mut id = [0u8; RAW_LEN];
        id.copy_from_slice(bytes);
        ObjectId(id)
    }

    /// Create an id from raw bytes, failing on a length mismatch.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != RAW_LEN {
            return Err(DecodeError::InvalidLength { actual: bytes.len() * 2 });
        }
        Ok(Self::from_bytes_or_panic(bytes))
    }

    /// Decode an id from its 40-character hex representation.
    pub fn from_hex(hex_bytes: &[u8]) -> Result<Self, DecodeError> {
        if hex_bytes.len() != HEX_LEN {
            return Err(DecodeError::InvalidLength {
                actual: hex_bytes.len(),
            });
        }
        let mut id = [0u8; RAW_LEN];
        hex::decode_to_slice(hex_bytes, &mut id).map_err(|_| DecodeError::InvalidHex)?;
        Ok(ObjectId(id))
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The 40-character lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The first byte of the id, useful for fan-out tables.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An incremental SHA-1 digest producing [`ObjectId`]s.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha1,
}

impl Hasher {
    /// Create a fresh hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Finish and produce the id.
    pub fn finalize(self) -> ObjectId {
        let digest = self.inner.finalize();
        ObjectId::from_bytes_or_panic(&digest)
    }

    /// Produce the id for the current state without consuming the hasher.
    ///
    /// Used for the pack trailer, which is the digest of everything read so
    /// far while the stream must keep going.
    pub fn clone_and_finalize(&self) -> ObjectId {
        self.clone().finalize()
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hasher")
    }
}

/// Hash a loose object: the digest of `"<kind> <size>\0"` followed by the
/// payload bytes.
pub fn hash_object(kind: &str, data: &[u8]) -> ObjectId {
    let mut hasher = Hasher::new();
    hasher.update(kind.as_bytes());
    hasher.update(b" ");
    hasher.update(data.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(data);
    hasher.finalize()
}
