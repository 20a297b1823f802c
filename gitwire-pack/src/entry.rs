//! Per-object entry headers and the parse-result metadata.

use crate::ObjectKind;
use gitwire_hash::ObjectId;

/// The decoded variable-length header of one pack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryHeader {
    /// A whole object of the given kind.
    Whole {
        /// The object kind.
        kind: ObjectKind,
    },
    /// A delta whose base precedes it in the same pack.
    OfsDelta {
        /// Absolute stream offset of the base entry.
        base_offset: u64,
    },
    /// A delta addressing its base by id; the base may live outside the pack.
    RefDelta {
        /// Id of the base object.
        base_id: ObjectId,
    },
}

impl EntryHeader {
    /// `true` for either delta representation.
    pub fn is_delta(&self) -> bool {
        matches!(self, EntryHeader::OfsDelta { .. } | EntryHeader::RefDelta { .. })
    }
}

/// Metadata recorded for each object produced by a parse.
///
/// The id is the hash of the fully inflated, type-tagged payload; the crc32
/// covers the entry's compressed bytes as they appeared on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedObjectInfo {
    /// The object's content id.
    pub id: ObjectId,
    /// Byte offset of the entry within the pack stream.
    pub offset: u64,
    /// Kind of the (resolved) object.
    pub kind: ObjectKind,
    /// CRC-32 of the entry's compressed payload.
    pub crc32: u32,
    /// Inflated size of the (resolved) object.
    pub size: u64,
}
