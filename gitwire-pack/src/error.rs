//! Error types for pack parsing and object ingestion.

use gitwire_hash::ObjectId;

/// Result type alias for pack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error produced while parsing a pack stream.
///
/// Variants are deliberately specific: corruption, resource-limit violations
/// and collisions must be distinguishable so callers can react differently
/// (clear user message vs. connection teardown).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stream did not start with the `PACK` signature.
    #[error("pack signature {signature:?} is not 'PACK'")]
    BadSignature {
        /// The four bytes found instead.
        signature: [u8; 4],
    },

    /// The pack version was neither 2 nor 3.
    #[error("unsupported pack version {version}")]
    UnsupportedVersion {
        /// The version field as read.
        version: u32,
    },

    /// A malformed per-object entry header.
    #[error("malformed object entry header at offset {offset}: {message}")]
    BadEntryHeader {
        /// Offset of the entry in the pack stream.
        offset: u64,
        /// What was wrong.
        message: String,
    },

    /// The zlib stream of an entry could not be inflated.
    #[error("failed to inflate object at offset {offset}")]
    Inflate {
        /// Offset of the entry in the pack stream.
        offset: u64,
        /// The underlying decompression error.
        source: flate2::DecompressError,
    },

    /// An entry inflated to a size other than its header declared.
    #[error("object at offset {offset} inflated to {actual} bytes, header declared {declared}")]
    SizeMismatch {
        /// Offset of the entry in the pack stream.
        offset: u64,
        /// Size the entry header declared.
        declared: u64,
        /// Size actually produced.
        actual: u64,
    },

    /// The trailing pack checksum did not match the running digest.
    #[error("pack checksum mismatch: computed {computed}, trailer has {stored}")]
    ChecksumMismatch {
        /// Digest of all bytes preceding the trailer.
        computed: ObjectId,
        /// The trailer as transmitted.
        stored: ObjectId,
    },

    /// An object exceeded the configured size ceiling.
    ///
    /// Kept distinct so a malicious peer cannot force unbounded memory use
    /// while the caller still gets an actionable message.
    #[error("object of {size} bytes exceeds the limit of {limit}")]
    ObjectTooLarge {
        /// Inflated size of the offending object.
        size: u64,
        /// The configured ceiling.
        limit: u64,
    },

    /// The pack as a whole exceeded the configured byte ceiling.
    #[error("pack exceeds the limit of {limit} bytes")]
    PackTooLarge {
        /// The configured ceiling.
        limit: u64,
    },

    /// Delta bases remained unresolved after resolution (and thin-pack
    /// completion, if it was allowed).
    #[error("pack has {count} unresolved delta base(s)")]
    UnresolvedDeltas {
        /// Number of distinct bases still missing.
        count: usize,
    },

    /// A newly decoded object has the id of a stored object with different
    /// content. Never resolved silently in either direction.
    #[error("object {id} collides with existing content of the same id")]
    Collision {
        /// The contested id.
        id: ObjectId,
    },

    /// A delta record could not be applied to its base.
    #[error("invalid delta for object at offset {offset}: {source}")]
    Delta {
        /// Offset of the delta entry in the pack stream.
        offset: u64,
        /// The underlying application failure.
        source: crate::delta::Error,
    },

    /// The pluggable object checker rejected an object.
    #[error("object {id} rejected: {message}")]
    ObjectRejected {
        /// Id of the rejected object.
        id: ObjectId,
        /// The checker's reason.
        message: String,
    },

    /// The object store failed.
    #[error("object store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The caller asked to stop.
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying stream failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// `true` if the failure indicates corruption of the pack itself rather
    /// than an environmental or policy condition.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::BadSignature { .. }
                | Error::UnsupportedVersion { .. }
                | Error::BadEntryHeader { .. }
                | Error::Inflate { .. }
                | Error::SizeMismatch { .. }
                | Error::ChecksumMismatch { .. }
                | Error::Delta { .. }
        )
    }
}
