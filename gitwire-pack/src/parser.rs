//! The streaming pack parser: one pass over the entries, checksum
//! verification, then delta resolution from every known whole object.

use crate::entry::{EntryHeader, PackedObjectInfo};
use crate::error::{Error, Result};
use crate::input::PackInput;
use crate::store::{ObjectChecker, ObjectStore};
use crate::{delta, ObjectKind};
use gitwire_hash::{hash_object, ObjectId};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// How often long-running loops poll the interrupt flag.
const INTERRUPT_INTERVAL: usize = 32;

/// Configuration for one parse invocation.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Permit completing delta chains from bases that live only in the
    /// destination store (a "thin" pack).
    pub allow_thin_pack: bool,
    /// Ceiling on the inflated size of any single object.
    pub max_object_size: Option<u64>,
    /// Ceiling on the total bytes of the pack stream.
    pub max_pack_bytes: Option<u64>,
}

impl ParseOptions {
    /// Permissive defaults: thin packs refused, no ceilings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Permit thin packs.
    pub fn with_thin_pack(mut self, allow: bool) -> Self {
        self.allow_thin_pack = allow;
        self
    }

    /// Bound the inflated size of any single object.
    pub fn with_max_object_size(mut self, limit: impl Into<Option<u64>>) -> Self {
        self.max_object_size = limit.into();
        self
    }

    /// Bound the total size of the pack stream.
    pub fn with_max_pack_bytes(mut self, limit: impl Into<Option<u64>>) -> Self {
        self.max_pack_bytes = limit.into();
        self
    }
}

/// The result of a completed parse.
#[derive(Debug)]
pub struct Outcome {
    /// Pack format version, 2 or 3.
    pub version: u32,
    /// Object count declared by the pack header.
    pub object_count: u32,
    /// One record per object produced, whole and delta-resolved alike.
    pub entries: Vec<PackedObjectInfo>,
    /// The verified trailing checksum, identifying the pack.
    pub pack_checksum: ObjectId,
    /// Bases opened from the store to complete a thin pack.
    pub thin_bases: Vec<ObjectId>,
}

/// Parses one pack stream into a store.
///
/// All intermediate state (entry table, delta arenas) is owned by a single
/// [`parse`](Self::parse) invocation and discarded at its end.
#[derive(Debug, Clone, Default)]
pub struct PackParser {
    options: ParseOptions,
}

struct DeltaRecord {
    offset: u64,
    crc32: u32,
    data: Vec<u8>,
}

struct ResolveFrame {
    kind: ObjectKind,
    bytes: Vec<u8>,
    children: SmallVec<[usize; 2]>,
    cursor: usize,
}

impl PackParser {
    /// Create a parser with the given options.
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    /// Parse a pack stream positioned at its header, writing objects through
    /// `store` and validating each with `checker`.
    ///
    /// `should_interrupt` is polled at fixed intervals so long parses remain
    /// externally abortable without per-byte overhead.
    pub fn parse<R, S, C>(
        &self,
        read: R,
        store: &S,
        checker: &C,
        should_interrupt: &AtomicBool,
    ) -> Result<Outcome>
    where
        R: io::Read,
        S: ObjectStore,
        C: ObjectChecker,
    {
        let mut input = PackInput::new(read);
        let (version, object_count) = read_pack_header(&mut input)?;
        debug!(version, object_count, "pack header read");

        let mut entries: Vec<PackedObjectInfo> = Vec::with_capacity(object_count as usize);
        let mut delta_records: Vec<DeltaRecord> = Vec::new();
        let mut by_id: HashMap<ObjectId, SmallVec<[usize; 2]>> = HashMap::new();
        let mut by_pos: HashMap<u64, SmallVec<[usize; 2]>> = HashMap::new();

        for entry_index in 0..object_count as usize {
            if entry_index % INTERRUPT_INTERVAL == 0 && should_interrupt.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let entry_offset = input.offset();
            if let Some(limit) = self.options.max_pack_bytes {
                if entry_offset > limit {
                    return Err(Error::PackTooLarge { limit });
                }
            }
            let (header, declared_size) = read_entry_header(&mut input, entry_offset)?;
            if let Some(limit) = self.options.max_object_size {
                if declared_size > limit {
                    return Err(Error::ObjectTooLarge {
                        size: declared_size,
                        limit,
                    });
                }
            }
            let mut crc = crc32fast::Hasher::new();
            let data = inflate_entry(&mut input, declared_size, entry_offset, &mut crc)?;
            let crc32 = crc.finalize();

            match header {
                EntryHeader::Whole { kind } => {
                    let id = self.admit_object(store, checker, kind, &data)?;
                    entries.push(PackedObjectInfo {
                        id,
                        offset: entry_offset,
                        kind,
                        crc32,
                        size: data.len() as u64,
                    });
                }
                EntryHeader::OfsDelta { base_offset } => {
                    let index = push_delta(&mut delta_records, entry_offset, crc32, data);
                    by_pos.entry(base_offset).or_default().push(index);
                }
                EntryHeader::RefDelta { base_id } => {
                    let index = push_delta(&mut delta_records, entry_offset, crc32, data);
                    by_id.entry(base_id).or_default().push(index);
                }
            }
        }

        let computed = input.digest();
        let stored = input.read_trailer()?;
        if computed != stored {
            return Err(Error::ChecksumMismatch { computed, stored });
        }

        let whole_count = entries.len();
        debug!(
            whole = whole_count,
            deltas = delta_records.len(),
            "entry pass complete, resolving deltas"
        );

        // Depth-first from every whole object seen in the stream.
        for root in 0..whole_count {
            let PackedObjectInfo { id, offset, kind, .. } = entries[root];
            let children = take_children(&mut by_id, &mut by_pos, &id, offset);
            if children.is_empty() {
                continue;
            }
            let bytes = open_required(store, &id)?;
            self.resolve_chain(
                store,
                checker,
                ResolveFrame { kind, bytes, children, cursor: 0 },
                &mut entries,
                &mut delta_records,
                &mut by_id,
                &mut by_pos,
                should_interrupt,
            )?;
        }

        // Whatever is left is thin: its bases live only in the store.
        let mut thin_bases = Vec::new();
        if self.options.allow_thin_pack && !by_id.is_empty() {
            let candidates: Vec<ObjectId> = by_id.keys().copied().collect();
            for base_id in candidates {
                let Some((kind, bytes)) = store.open(&base_id).map_err(Error::Store)? else {
                    continue;
                };
                let children = take_children(&mut by_id, &mut by_pos, &base_id, u64::MAX);
                if children.is_empty() {
                    continue;
                }
                thin_bases.push(base_id);
                self.resolve_chain(
                    store,
                    checker,
                    ResolveFrame { kind, bytes, children, cursor: 0 },
                    &mut entries,
                    &mut delta_records,
                    &mut by_id,
                    &mut by_pos,
                    should_interrupt,
                )?;
            }
        }

        let unresolved = by_id.len() + by_pos.len();
        if unresolved > 0 {
            return Err(Error::UnresolvedDeltas { count: unresolved });
        }

        debug!(objects = entries.len(), pack = %stored, "pack parse complete");
        Ok(Outcome {
            version,
            object_count,
            entries,
            pack_checksum: stored,
            thin_bases,
        })
    }

    /// Walk one chain with an explicit work stack so deep chains cannot
    /// overflow the call stack.
    #[allow(clippy::too_many_arguments)]
    fn resolve_chain<S, C>(
        &self,
        store: &S,
        checker: &C,
        root: ResolveFrame,
        entries: &mut Vec<PackedObjectInfo>,
        delta_records: &mut [DeltaRecord],
        by_id: &mut HashMap<ObjectId, SmallVec<[usize; 2]>>,
        by_pos: &mut HashMap<u64, SmallVec<[usize; 2]>>,
        should_interrupt: &AtomicBool,
    ) -> Result<()>
    where
        S: ObjectStore,
        C: ObjectChecker,
    {
        let mut frames = vec![root];
        let mut work = 0usize;
        while let Some(top) = frames.last_mut() {
            if top.cursor == top.children.len() {
                frames.pop();
                continue;
            }
            work += 1;
            if work % INTERRUPT_INTERVAL == 0 && should_interrupt.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let delta_index = top.children[top.cursor];
            top.cursor += 1;
            let kind = top.kind;
            let record_offset = delta_records[delta_index].offset;
            let record_crc = delta_records[delta_index].crc32;
            let result = delta::apply(&top.bytes, &delta_records[delta_index].data)
                .map_err(|source| Error::Delta { offset: record_offset, source })?;
            // the delta payload is no longer needed once applied
            delta_records[delta_index].data = Vec::new();
            if let Some(limit) = self.options.max_object_size {
                if result.len() as u64 > limit {
                    return Err(Error::ObjectTooLarge {
                        size: result.len() as u64,
                        limit,
                    });
                }
            }
            let id = self.admit_object(store, checker, kind, &result)?;
            entries.push(PackedObjectInfo {
                id,
                offset: record_offset,
                kind,
                crc32: record_crc,
                size: result.len() as u64,
            });
            let children = take_children(by_id, by_pos, &id, record_offset);
            if !children.is_empty() {
                frames.push(ResolveFrame {
                    kind,
                    bytes: result,
                    children,
                    cursor: 0,
                });
            }
        }
        Ok(())
    }

    /// Hash, validate and insert one object, with the byte-for-byte
    /// collision check for ids the store already holds.
    fn admit_object<S, C>(&self, store: &S, checker: &C, kind: ObjectKind, data: &[u8]) -> Result<ObjectId>
    where
        S: ObjectStore,
        C: ObjectChecker,
    {
        let id = hash_object(kind.as_str(), data);
        checker
            .check(kind, data)
            .map_err(|message| Error::ObjectRejected { id, message })?;
        if store.has(&id).map_err(Error::Store)? {
            let Some((_, existing)) = store.open(&id).map_err(Error::Store)? else {
                // raced away between has() and open(); insert below
                store.insert(kind, data).map_err(Error::Store)?;
                return Ok(id);
            };
            if existing != data {
                return Err(Error::Collision { id });
            }
        } else {
            store.insert(kind, data).map_err(Error::Store)?;
        }
        Ok(id)
    }
}

fn push_delta(records: &mut Vec<DeltaRecord>, offset: u64, crc32: u32, data: Vec<u8>) -> usize {
    records.push(DeltaRecord { offset, crc32, data });
    records.len() - 1
}

fn take_children(
    by_id: &mut HashMap<ObjectId, SmallVec<[usize; 2]>>,
    by_pos: &mut HashMap<u64, SmallVec<[usize; 2]>>,
    id: &ObjectId,
    offset: u64,
) -> SmallVec<[usize; 2]> {
    let mut children = by_id.remove(id).unwrap_or_default();
    if let Some(more) = by_pos.remove(&offset) {
        children.extend(more);
    }
    children
}

fn open_required<S: ObjectStore>(store: &S, id: &ObjectId) -> Result<Vec<u8>> {
    store
        .open(id)
        .map_err(Error::Store)?
        .map(|(_, bytes)| bytes)
        .ok_or_else(|| {
            Error::Store(format!("object {id} vanished from the store during resolution").into())
        })
}

fn read_pack_header<R: io::Read>(input: &mut PackInput<R>) -> Result<(u32, u32)> {
    let mut signature = [0u8; 4];
    input.read_exact(&mut signature)?;
    if &signature != b"PACK" {
        return Err(Error::BadSignature { signature });
    }
    let version = read_u32(input)?;
    if version != 2 && version != 3 {
        return Err(Error::UnsupportedVersion { version });
    }
    let object_count = read_u32(input)?;
    Ok((version, object_count))
}

fn read_u32<R: io::Read>(input: &mut PackInput<R>) -> Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

/// Read the variable-length `(type, size)` entry header plus the delta base
/// field where the type calls for one.
fn read_entry_header<R: io::Read>(
    input: &mut PackInput<R>,
    entry_offset: u64,
) -> Result<(EntryHeader, u64)> {
    let first = input.read_u8()?;
    let type_id = (first >> 4) & 0x7;
    let mut size = u64::from(first & 0xf);
    let mut shift = 4u32;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = input.read_u8()?;
        if shift > 57 {
            return Err(Error::BadEntryHeader {
                offset: entry_offset,
                message: "object size varint too long".into(),
            });
        }
        size |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }
    let header = match type_id {
        1 | 2 | 3 | 4 => EntryHeader::Whole {
            kind: ObjectKind::from_pack_type(type_id).expect("1..=4 are whole kinds"),
        },
        6 => {
            let distance = read_backwards_varint(input, entry_offset)?;
            if distance > entry_offset {
                return Err(Error::BadEntryHeader {
                    offset: entry_offset,
                    message: format!("delta base distance {distance} points before the pack start"),
                });
            }
            EntryHeader::OfsDelta {
                base_offset: entry_offset - distance,
            }
        }
        7 => {
            let mut base = [0u8; 20];
            input.read_exact(&mut base)?;
            EntryHeader::RefDelta {
                base_id: ObjectId::from_bytes_or_panic(&base),
            }
        }
        other => {
            return Err(Error::BadEntryHeader {
                offset: entry_offset,
                message: format!("invalid object type {other}"),
            })
        }
    };
    Ok((header, size))
}

/// The offset-encoding used by OFS deltas: big-endian 7-bit groups where
/// each continuation adds one to the accumulated value before shifting.
fn read_backwards_varint<R: io::Read>(input: &mut PackInput<R>, entry_offset: u64) -> Result<u64> {
    let mut byte = input.read_u8()?;
    let mut value = u64::from(byte & 0x7f);
    while byte & 0x80 != 0 {
        byte = input.read_u8()?;
        value = value
            .checked_add(1)
            .and_then(|v| v.checked_shl(7))
            .map(|v| v | u64::from(byte & 0x7f))
            .ok_or_else(|| Error::BadEntryHeader {
                offset: entry_offset,
                message: "delta base distance varint overflows".into(),
            })?;
    }
    Ok(value)
}

/// Inflate one entry's zlib stream, feeding consumed compressed bytes into
/// `crc` and consuming exactly the compressed length from the input.
fn inflate_entry<R: io::Read>(
    input: &mut PackInput<R>,
    declared_size: u64,
    entry_offset: u64,
    crc: &mut crc32fast::Hasher,
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; declared_size as usize];
    let mut out_pos = 0usize;
    let mut inflate = flate2::Decompress::new(true);
    loop {
        let available = input.fill_buf()?;
        if available.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pack stream ended inside compressed object data",
            )
            .into());
        }
        let in_before = inflate.total_in();
        let out_before = inflate.total_out();
        let status = inflate
            .decompress(available, &mut out[out_pos..], flate2::FlushDecompress::None)
            .map_err(|source| Error::Inflate { offset: entry_offset, source })?;
        let consumed = (inflate.total_in() - in_before) as usize;
        let produced = (inflate.total_out() - out_before) as usize;
        crc.update(&available[..consumed]);
        input.consume(consumed);
        out_pos += produced;
        match status {
            flate2::Status::StreamEnd => break,
            flate2::Status::Ok | flate2::Status::BufError => {
                if consumed == 0 && produced == 0 {
                    return Err(Error::BadEntryHeader {
                        offset: entry_offset,
                        message: "compressed data continues past the declared object size".into(),
                    });
                }
            }
        }
    }
    if out_pos as u64 != declared_size {
        return Err(Error::SizeMismatch {
            offset: entry_offset,
            declared: declared_size,
            actual: out_pos as u64,
        });
    }
    Ok(out)
}
