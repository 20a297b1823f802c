//! Reference records and the advertisement exchange that transfers them.

use crate::capability::Capabilities;
use crate::error::{Error, Result};
use bstr::{BStr, BString, ByteSlice};
use gitwire_hash::ObjectId;
use gitwire_pktline::{encode, PacketLineRef, StreamingPeekableIter};
use std::io;

/// A named pointer into the object graph, as advertised by a peer.
///
/// Never mutated after construction; new refs replace old ones in a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    /// A ref pointing directly at an object.
    Direct {
        /// The full name, e.g. `refs/heads/main`.
        full_ref_name: BString,
        /// The object it points to.
        object: ObjectId,
    },
    /// An annotated tag along with the object it ultimately points to.
    Peeled {
        /// The full name, e.g. `refs/tags/v1.0`.
        full_ref_name: BString,
        /// The tag object itself.
        tag: ObjectId,
        /// The peeled target of the tag.
        object: ObjectId,
    },
    /// A symbolic ref and the object its target resolves to.
    Symbolic {
        /// The full name, e.g. `HEAD`.
        full_ref_name: BString,
        /// The name of the ref it points to.
        target: BString,
        /// The object the target resolves to.
        object: ObjectId,
    },
    /// A symbolic ref whose target does not exist yet.
    Unborn {
        /// The full name, e.g. `HEAD` in an empty repository.
        full_ref_name: BString,
        /// The name of the nonexistent target.
        target: BString,
    },
}

impl Ref {
    /// The full name of this ref.
    pub fn name(&self) -> &BStr {
        match self {
            Ref::Direct { full_ref_name, .. }
            | Ref::Peeled { full_ref_name, .. }
            | Ref::Symbolic { full_ref_name, .. }
            | Ref::Unborn { full_ref_name, .. } => full_ref_name.as_bstr(),
        }
    }

    /// The object this ref points to, if it points anywhere.
    pub fn target_id(&self) -> Option<ObjectId> {
        match self {
            Ref::Direct { object, .. } | Ref::Symbolic { object, .. } => Some(*object),
            Ref::Peeled { tag, .. } => Some(*tag),
            Ref::Unborn { .. } => None,
        }
    }

    /// The peeled target for annotated tags.
    pub fn peeled_id(&self) -> Option<ObjectId> {
        match self {
            Ref::Peeled { object, .. } => Some(*object),
            _ => None,
        }
    }
}

/// The result of reading a v0 advertisement.
#[derive(Debug, Default)]
pub struct Advertisement {
    /// Advertised refs, in wire order.
    pub refs: Vec<Ref>,
    /// Capabilities from the first ref line.
    pub capabilities: Capabilities,
}

/// Read a v0 ref advertisement up to its flush.
///
/// The first line carries the capability string after a NUL; `<name>^{}`
/// lines attach peeled ids to the preceding tag; an `ERR` line anywhere is a
/// remote rejection.
pub fn read_advertisement<R: io::BufRead>(
    lines: &mut StreamingPeekableIter<R>,
) -> Result<Advertisement> {
    let mut out = Advertisement::default();
    let mut first = true;
    while let Some(line) = lines.read_line() {
        let line = line??;
        let data = match line.as_text() {
            Some(data) => data,
            None => continue,
        };
        if let Some(message) = PacketLineRef::Data(data).check_error() {
            return Err(Error::RemoteRejected {
                message: String::from_utf8_lossy(message).into_owned(),
            });
        }
        let (record, caps) = if first {
            let mut split = data.splitn_str(2, b"\0");
            let record = split.next().expect("split yields at least one part");
            (record, split.next())
        } else {
            (data, None)
        };
        if let Some(caps) = caps {
            out.capabilities = Capabilities::from_bytes(caps);
        }
        first = false;
        parse_advertised_line(record, &mut out.refs)?;
    }
    // resolve symref hints such as symref=HEAD:refs/heads/main
    for (from, to) in out.capabilities.symrefs() {
        if let Some(index) = out.refs.iter().position(|r| r.name() == from.as_bstr()) {
            if let Ref::Direct { object, .. } = out.refs[index] {
                out.refs[index] = Ref::Symbolic {
                    full_ref_name: from,
                    target: to,
                    object,
                };
            }
        }
    }
    Ok(out)
}

fn parse_advertised_line(line: &[u8], refs: &mut Vec<Ref>) -> Result<()> {
    let space = line
        .find_byte(b' ')
        .ok_or_else(|| Error::protocol("expected '<id> <name>'", line))?;
    let id = ObjectId::from_hex(&line[..space])
        .map_err(|_| Error::protocol("invalid object id", line))?;
    let name = &line[space + 1..];
    if name.is_empty() {
        return Err(Error::protocol("empty ref name", line));
    }
    // "capabilities^{}" with the null id advertises an empty repository
    if name == b"capabilities^{}" && id.is_null() {
        return Ok(());
    }
    if let Some(base_name) = name.strip_suffix(b"^{}") {
        // a peeled line refines the immediately preceding tag ref
        let upgraded = match refs.last_mut() {
            Some(Ref::Direct { full_ref_name, object }) if &full_ref_name[..] == base_name => {
                Ref::Peeled {
                    full_ref_name: std::mem::take(full_ref_name),
                    tag: *object,
                    object: id,
                }
            }
            _ => return Err(Error::protocol("peeled line without its base ref", line)),
        };
        *refs.last_mut().expect("matched a last ref above") = upgraded;
        return Ok(());
    }
    refs.push(Ref::Direct {
        full_ref_name: BString::from(name),
        object: id,
    });
    Ok(())
}

/// Parse one `ls-refs` response line:
/// `<id> <name>[ peeled:<id>][ symref-target:<name>]` or
/// `unborn <name> symref-target:<name>`.
pub fn parse_ls_refs_line(line: &[u8]) -> Result<Ref> {
    let mut fields = line.split(|&b| b == b' ');
    let head = fields
        .next()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| Error::protocol("empty ls-refs line", line))?;
    if head == b"unborn" {
        let name = fields
            .next()
            .ok_or_else(|| Error::protocol("unborn line without a ref name", line))?;
        let target = fields
            .next()
            .and_then(|f| f.strip_prefix(b"symref-target:"))
            .ok_or_else(|| Error::protocol("unborn line without a symref target", line))?;
        return Ok(Ref::Unborn {
            full_ref_name: BString::from(name),
            target: BString::from(target),
        });
    }
    let id = ObjectId::from_hex(head).map_err(|_| Error::protocol("invalid object id", line))?;
    let name = fields
        .next()
        .ok_or_else(|| Error::protocol("ls-refs line without a ref name", line))?;
    let mut peeled = None;
    let mut symref_target = None;
    for attribute in fields {
        if let Some(value) = attribute.strip_prefix(b"peeled:") {
            peeled = Some(
                ObjectId::from_hex(value)
                    .map_err(|_| Error::protocol("invalid peeled id", line))?,
            );
        } else if let Some(value) = attribute.strip_prefix(b"symref-target:") {
            symref_target = Some(BString::from(value));
        } else {
            return Err(Error::protocol("unrecognized ls-refs attribute", line));
        }
    }
    Ok(match (peeled, symref_target) {
        (Some(object), _) => Ref::Peeled {
            full_ref_name: BString::from(name),
            tag: id,
            object,
        },
        (None, Some(target)) => Ref::Symbolic {
            full_ref_name: BString::from(name),
            target,
            object: id,
        },
        (None, None) => Ref::Direct {
            full_ref_name: BString::from(name),
            object: id,
        },
    })
}

/// Write a v0 advertisement: capabilities ride the first line after a NUL,
/// peeled tags get their extra `^{}` line, and an empty ref list advertises
/// `capabilities^{}` against the null id.
pub fn write_advertisement(
    refs: &[Ref],
    capabilities: &Capabilities,
    out: &mut impl io::Write,
) -> Result<()> {
    let caps = capabilities.to_wire();
    if refs.is_empty() {
        let line = format!("{} capabilities^{{}}\0{}\n", ObjectId::null(), caps);
        encode::data_to_write(line.as_bytes(), out)?;
    } else {
        for (index, reference) in refs.iter().enumerate() {
            let Some(id) = reference.target_id() else {
                // unborn refs have no v0 representation
                continue;
            };
            let mut line = BString::from(format!("{id} "));
            line.extend_from_slice(reference.name());
            if index == 0 {
                line.push(0);
                line.extend_from_slice(&caps);
            }
            line.push(b'\n');
            encode::data_to_write(&line, out)?;
            if let Some(peeled) = reference.peeled_id() {
                let mut peeled_line = BString::from(format!("{peeled} "));
                peeled_line.extend_from_slice(reference.name());
                peeled_line.extend_from_slice(b"^{}\n");
                encode::data_to_write(&peeled_line, out)?;
            }
        }
    }
    encode::flush_to_write(out)?;
    Ok(())
}
