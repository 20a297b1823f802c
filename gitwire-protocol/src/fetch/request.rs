//! Server-side parsers for fetch requests, wire protocol v0 and v2.

use crate::capability::Capabilities;
use crate::error::{Error, Result};
use crate::filter::FilterSpec;
use bstr::BString;
use gitwire_hash::ObjectId;
use gitwire_pktline::StreamingPeekableIter;
use std::io;

/// Depth-limiting parameters of a fetch.
///
/// `depth` is mutually exclusive with the time and ref based modes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeepenSpec {
    /// `deepen <n>`: commit-count limit.
    pub depth: Option<u32>,
    /// `deepen-since <timestamp>`: cut history older than this.
    pub since: Option<i64>,
    /// `deepen-not <ref>`: exclude history reachable from these refs.
    pub not: Vec<BString>,
    /// `deepen-relative`: depth counts from the current shallow boundary.
    pub relative: bool,
}

impl DeepenSpec {
    /// `true` if no deepening was requested.
    pub fn is_unset(&self) -> bool {
        self.depth.is_none() && self.since.is_none() && self.not.is_empty()
    }
}

/// A client's v0 negotiation opening: everything up to the first flush.
///
/// Built incrementally by the parser, then read-only for the rest of the
/// exchange. The have/ack rounds that follow are handled by the negotiation
/// loop, not here.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// Objects the client asks for.
    pub wants: Vec<ObjectId>,
    /// The client's current shallow boundaries.
    pub shallow: Vec<ObjectId>,
    /// Depth-limiting parameters.
    pub deepen: DeepenSpec,
    /// The object filter, if any.
    pub filter: Option<FilterSpec>,
    /// Capabilities from the first want line.
    pub capabilities: Capabilities,
}

impl FetchRequest {
    /// Parse the want section of a v0 fetch: `want`/`shallow`/`deepen*`/
    /// `filter` lines terminated by a flush.
    ///
    /// Capabilities appear once, attached to the first `want`. A second
    /// `filter` line and conflicting deepen modes are rejected; any
    /// unrecognized line is a protocol error naming it.
    pub fn parse_v0<R: io::BufRead>(lines: &mut StreamingPeekableIter<R>) -> Result<Self> {
        let mut request = FetchRequest::default();
        let mut first_want = true;
        while let Some(line) = lines.read_line() {
            let line = line??;
            let Some(data) = line.as_text() else { continue };
            if let Some(rest) = data.strip_prefix(b"want ") {
                let (id, caps) = split_oid_and_capabilities(rest, data)?;
                request.wants.push(id);
                if first_want {
                    if let Some(caps) = caps {
                        request.capabilities = Capabilities::from_bytes(caps);
                    }
                    first_want = false;
                }
            } else if let Some(rest) = data.strip_prefix(b"shallow ") {
                request.shallow.push(parse_oid(rest, data)?);
            } else {
                parse_common_argument(data, &mut request.deepen, &mut request.filter)?
                    .then_some(())
                    .ok_or_else(|| Error::protocol("unrecognized fetch line", data))?;
            }
        }
        Ok(request)
    }
}

/// One section of v0 haves, read per negotiation round.
#[derive(Debug, Default)]
pub struct HaveSection {
    /// The haves of this round, in order.
    pub haves: Vec<ObjectId>,
    /// `true` once the client sent `done`.
    pub done: bool,
}

/// Read one flush-terminated block of `have` lines, stopping early at
/// `done`.
pub fn parse_have_section<R: io::BufRead>(
    lines: &mut StreamingPeekableIter<R>,
) -> Result<HaveSection> {
    let mut section = HaveSection::default();
    while let Some(line) = lines.read_line() {
        let line = line??;
        let Some(data) = line.as_text() else { continue };
        if let Some(rest) = data.strip_prefix(b"have ") {
            section.haves.push(parse_oid(rest, data)?);
        } else if data == b"done" {
            section.done = true;
            break;
        } else {
            return Err(Error::protocol("expected have or done", data));
        }
    }
    Ok(section)
}

/// A complete v2 `fetch` command request: capability block, then arguments.
#[derive(Debug, Clone, Default)]
pub struct FetchV2Request {
    /// Capabilities sent as `<key>[=<value>]` lines before the delimiter.
    pub capabilities: Capabilities,
    /// Objects the client asks for.
    pub wants: Vec<ObjectId>,
    /// Refs the client asks for by name (`want-ref`).
    pub want_refs: Vec<BString>,
    /// Objects the client claims to have.
    pub haves: Vec<ObjectId>,
    /// The client's current shallow boundaries.
    pub shallow: Vec<ObjectId>,
    /// Depth-limiting parameters.
    pub deepen: DeepenSpec,
    /// The object filter, if any.
    pub filter: Option<FilterSpec>,
    /// `thin-pack` requested.
    pub thin_pack: bool,
    /// `ofs-delta` supported by the client.
    pub ofs_delta: bool,
    /// `no-progress` requested.
    pub no_progress: bool,
    /// `include-tag` requested.
    pub include_tag: bool,
    /// `done`: the client will not send further haves.
    pub done: bool,
}

impl FetchV2Request {
    /// Parse a v2 fetch request: capability lines up to the delimiter, then
    /// argument lines up to the flush.
    pub fn parse<R: io::BufRead>(lines: &mut StreamingPeekableIter<R>) -> Result<Self> {
        let mut request = FetchV2Request {
            capabilities: parse_capability_block(lines)?,
            ..Default::default()
        };
        while let Some(line) = lines.read_line() {
            let line = line??;
            let Some(data) = line.as_text() else { continue };
            if let Some(rest) = data.strip_prefix(b"want ") {
                request.wants.push(parse_oid(rest, data)?);
            } else if let Some(rest) = data.strip_prefix(b"want-ref ") {
                request.want_refs.push(BString::from(rest));
            } else if let Some(rest) = data.strip_prefix(b"have ") {
                request.haves.push(parse_oid(rest, data)?);
            } else if let Some(rest) = data.strip_prefix(b"shallow ") {
                request.shallow.push(parse_oid(rest, data)?);
            } else if data == b"thin-pack" {
                request.thin_pack = true;
            } else if data == b"ofs-delta" {
                request.ofs_delta = true;
            } else if data == b"no-progress" {
                request.no_progress = true;
            } else if data == b"include-tag" {
                request.include_tag = true;
            } else if data == b"done" {
                request.done = true;
            } else if parse_common_argument(data, &mut request.deepen, &mut request.filter)? {
                // handled
            } else {
                return Err(Error::protocol("unrecognized fetch argument", data));
            }
        }
        Ok(request)
    }
}

/// A v2 `ls-refs` request.
#[derive(Debug, Clone, Default)]
pub struct LsRefsRequest {
    /// Capabilities sent before the delimiter.
    pub capabilities: Capabilities,
    /// Only refs matching one of these prefixes are listed.
    pub prefixes: Vec<BString>,
    /// Attach peeled ids to annotated tags.
    pub peel: bool,
    /// Attach symref targets.
    pub symrefs: bool,
}

impl LsRefsRequest {
    /// Parse an ls-refs request: capability lines to the delimiter, then
    /// `peel`/`symrefs`/`ref-prefix` arguments to the flush.
    pub fn parse<R: io::BufRead>(lines: &mut StreamingPeekableIter<R>) -> Result<Self> {
        let mut request = LsRefsRequest {
            capabilities: parse_capability_block(lines)?,
            ..Default::default()
        };
        while let Some(line) = lines.read_line() {
            let line = line??;
            let Some(data) = line.as_text() else { continue };
            if data == b"peel" {
                request.peel = true;
            } else if data == b"symrefs" {
                request.symrefs = true;
            } else if let Some(prefix) = data.strip_prefix(b"ref-prefix ") {
                request.prefixes.push(BString::from(prefix));
            } else {
                return Err(Error::protocol("unrecognized ls-refs argument", data));
            }
        }
        Ok(request)
    }

    /// `true` if `name` passes the prefix filter.
    pub fn matches(&self, name: &[u8]) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| name.starts_with(p))
    }
}

/// A v2 `object-info` request; only the `size` attribute exists.
#[derive(Debug, Clone, Default)]
pub struct ObjectInfoRequest {
    /// Capabilities sent before the delimiter.
    pub capabilities: Capabilities,
    /// `true` if sizes were requested.
    pub size: bool,
    /// The ids to report on.
    pub oids: Vec<ObjectId>,
}

impl ObjectInfoRequest {
    /// Parse an object-info request.
    pub fn parse<R: io::BufRead>(lines: &mut StreamingPeekableIter<R>) -> Result<Self> {
        let mut request = ObjectInfoRequest {
            capabilities: parse_capability_block(lines)?,
            ..Default::default()
        };
        while let Some(line) = lines.read_line() {
            let line = line??;
            let Some(data) = line.as_text() else { continue };
            if data == b"size" {
                request.size = true;
            } else if let Some(rest) = data.strip_prefix(b"oid ") {
                request.oids.push(parse_oid(rest, data)?);
            } else {
                return Err(Error::protocol("unrecognized object-info argument", data));
            }
        }
        Ok(request)
    }
}

/// Read `<key>[=<value>]` capability lines up to the delimiter, then re-arm
/// the reader for the argument section ending at the flush.
fn parse_capability_block<R: io::BufRead>(
    lines: &mut StreamingPeekableIter<R>,
) -> Result<Capabilities> {
    let mut capabilities = Capabilities::default();
    while let Some(line) = lines.read_line() {
        let line = line??;
        if let Some(data) = line.as_text() {
            capabilities.push(data);
        }
    }
    use gitwire_pktline::PacketLineRef;
    match lines.stopped_at() {
        Some(PacketLineRef::Delimiter) => lines.reset_with(&[PacketLineRef::Flush]),
        // a capability-only request (no argument section) ends at flush
        Some(PacketLineRef::Flush) | None => {}
        Some(other) => {
            return Err(Error::protocol(
                "unexpected section boundary",
                format!("{other:?}").as_bytes(),
            ))
        }
    }
    Ok(capabilities)
}

/// Handle the deepen and filter lines shared by v0 and v2 requests.
///
/// `Ok(true)` if the line was consumed.
fn parse_common_argument(
    data: &[u8],
    deepen: &mut DeepenSpec,
    filter: &mut Option<FilterSpec>,
) -> Result<bool> {
    if let Some(rest) = data.strip_prefix(b"deepen ") {
        let depth = std::str::from_utf8(rest)
            .ok()
            .and_then(|d| d.parse::<u32>().ok())
            .ok_or_else(|| Error::protocol("invalid deepen depth", data))?;
        if deepen.since.is_some() || !deepen.not.is_empty() {
            return Err(Error::ConflictingDeepen {
                line: String::from_utf8_lossy(data).into_owned(),
            });
        }
        deepen.depth = Some(depth);
    } else if let Some(rest) = data.strip_prefix(b"deepen-since ") {
        let since = std::str::from_utf8(rest)
            .ok()
            .and_then(|d| d.parse::<i64>().ok())
            .ok_or_else(|| Error::protocol("invalid deepen-since timestamp", data))?;
        if deepen.depth.is_some() {
            return Err(Error::ConflictingDeepen {
                line: String::from_utf8_lossy(data).into_owned(),
            });
        }
        deepen.since = Some(since);
    } else if let Some(rest) = data.strip_prefix(b"deepen-not ") {
        if deepen.depth.is_some() {
            return Err(Error::ConflictingDeepen {
                line: String::from_utf8_lossy(data).into_owned(),
            });
        }
        deepen.not.push(BString::from(rest));
    } else if data == b"deepen-relative" {
        deepen.relative = true;
    } else if let Some(rest) = data.strip_prefix(b"filter ") {
        if filter.is_some() {
            return Err(Error::AmbiguousFilter {
                line: String::from_utf8_lossy(data).into_owned(),
            });
        }
        *filter = Some(FilterSpec::parse(rest)?);
    } else {
        return Ok(false);
    }
    Ok(true)
}

fn parse_oid(hex: &[u8], line: &[u8]) -> Result<ObjectId> {
    ObjectId::from_hex(hex).map_err(|_| Error::protocol("invalid object id", line))
}

/// Split `<oid>[ <capabilities>]`, tolerating a NUL separator as well.
fn split_oid_and_capabilities<'a>(
    rest: &'a [u8],
    line: &[u8],
) -> Result<(ObjectId, Option<&'a [u8]>)> {
    if rest.len() <= gitwire_hash::HEX_LEN {
        return Ok((parse_oid(rest, line)?, None));
    }
    let (hex, tail) = rest.split_at(gitwire_hash::HEX_LEN);
    let id = parse_oid(hex, line)?;
    match tail.first() {
        Some(b' ' | b'\0') => Ok((id, Some(&tail[1..]))),
        _ => Err(Error::protocol("malformed want line", line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitwire_pktline::{encode, PacketLineRef};
    use pretty_assertions::assert_eq;

    fn wire(lines: &[&[u8]], trailer: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in lines {
            encode::text_to_write(line, &mut out).unwrap();
        }
        out.extend_from_slice(trailer);
        out
    }

    fn iter(bytes: &[u8]) -> StreamingPeekableIter<&[u8]> {
        StreamingPeekableIter::new(bytes, &[PacketLineRef::Flush])
    }

    const OID1: &[u8] = b"1111111111111111111111111111111111111111";
    const OID2: &[u8] = b"2222222222222222222222222222222222222222";

    #[test]
    fn v0_request_with_capabilities_on_first_want() {
        let wire = wire(
            &[
                b"want 1111111111111111111111111111111111111111 multi_ack_detailed thin-pack side-band-64k",
                b"want 2222222222222222222222222222222222222222",
                b"shallow 2222222222222222222222222222222222222222",
                b"deepen 5",
            ],
            b"0000",
        );
        let request = FetchRequest::parse_v0(&mut iter(&wire)).unwrap();
        assert_eq!(request.wants.len(), 2);
        assert_eq!(request.shallow.len(), 1);
        assert_eq!(request.deepen.depth, Some(5));
        assert!(request.capabilities.contains("thin-pack"));
        assert_eq!(
            request.capabilities.multi_ack(),
            crate::MultiAckMode::Detailed
        );
    }

    #[test]
    fn v0_duplicate_filter_is_ambiguous() {
        let mut lines: Vec<Vec<u8>> = Vec::new();
        lines.push([b"want ", OID1].concat());
        lines.push(b"filter blob:none".to_vec());
        lines.push(b"filter blob:limit=1k".to_vec());
        let refs: Vec<&[u8]> = lines.iter().map(Vec::as_slice).collect();
        let wire = wire(&refs, b"0000");
        let err = FetchRequest::parse_v0(&mut iter(&wire)).unwrap_err();
        assert!(matches!(err, Error::AmbiguousFilter { .. }));
    }

    #[test]
    fn deepen_conflicts_are_rejected_both_ways() {
        let cases: [&[&[u8]]; 2] = [
            &[b"deepen 3", b"deepen-since 123456"],
            &[b"deepen-not refs/heads/old", b"deepen 3"],
        ];
        for case in cases {
            let mut all: Vec<Vec<u8>> = vec![[b"want ", OID1].concat()];
            all.extend(case.iter().map(|l| l.to_vec()));
            let refs: Vec<&[u8]> = all.iter().map(Vec::as_slice).collect();
            let wire = wire(&refs, b"0000");
            let err = FetchRequest::parse_v0(&mut iter(&wire)).unwrap_err();
            assert!(matches!(err, Error::ConflictingDeepen { .. }), "{err:?}");
        }
    }

    #[test]
    fn v0_unknown_line_is_named_in_the_error() {
        let wire = wire(&[b"wanted everything"], b"0000");
        let err = FetchRequest::parse_v0(&mut iter(&wire)).unwrap_err();
        assert!(err.to_string().contains("wanted everything"));
    }

    #[test]
    fn have_section_stops_at_done() {
        let mut all: Vec<Vec<u8>> = Vec::new();
        all.push([b"have ", OID1].concat());
        all.push([b"have ", OID2].concat());
        all.push(b"done".to_vec());
        let refs: Vec<&[u8]> = all.iter().map(Vec::as_slice).collect();
        let wire = wire(&refs, b"0000");
        let section = parse_have_section(&mut iter(&wire)).unwrap();
        assert_eq!(section.haves.len(), 2);
        assert!(section.done);
    }

    #[test]
    fn v2_request_with_capability_block() {
        let mut out = Vec::new();
        encode::text_to_write(b"agent=git/2.39", &mut out).unwrap();
        encode::text_to_write(b"object-format=sha1", &mut out).unwrap();
        encode::delim_to_write(&mut out).unwrap();
        encode::text_to_write(&[b"want ", OID1].concat(), &mut out).unwrap();
        encode::text_to_write(&[b"have ", OID2].concat(), &mut out).unwrap();
        encode::text_to_write(b"thin-pack", &mut out).unwrap();
        encode::text_to_write(b"filter blob:none", &mut out).unwrap();
        encode::text_to_write(b"done", &mut out).unwrap();
        encode::flush_to_write(&mut out).unwrap();

        let mut lines = StreamingPeekableIter::new(out.as_slice(), &[PacketLineRef::Delimiter]);
        let request = FetchV2Request::parse(&mut lines).unwrap();
        assert_eq!(request.capabilities.agent().unwrap(), "git/2.39");
        assert_eq!(request.wants.len(), 1);
        assert_eq!(request.haves.len(), 1);
        assert!(request.thin_pack);
        assert!(request.done);
        assert!(request.filter.is_some());
    }

    #[test]
    fn v2_unknown_argument_is_rejected() {
        let mut out = Vec::new();
        encode::delim_to_write(&mut out).unwrap();
        encode::text_to_write(b"frobnicate", &mut out).unwrap();
        encode::flush_to_write(&mut out).unwrap();
        let mut lines = StreamingPeekableIter::new(out.as_slice(), &[PacketLineRef::Delimiter]);
        let err = FetchV2Request::parse(&mut lines).unwrap_err();
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn ls_refs_request() {
        let mut out = Vec::new();
        encode::delim_to_write(&mut out).unwrap();
        encode::text_to_write(b"peel", &mut out).unwrap();
        encode::text_to_write(b"symrefs", &mut out).unwrap();
        encode::text_to_write(b"ref-prefix refs/heads/", &mut out).unwrap();
        encode::flush_to_write(&mut out).unwrap();
        let mut lines = StreamingPeekableIter::new(out.as_slice(), &[PacketLineRef::Delimiter]);
        let request = LsRefsRequest::parse(&mut lines).unwrap();
        assert!(request.peel && request.symrefs);
        assert!(request.matches(b"refs/heads/main"));
        assert!(!request.matches(b"refs/tags/v1"));
    }

    #[test]
    fn object_info_request() {
        let mut out = Vec::new();
        encode::delim_to_write(&mut out).unwrap();
        encode::text_to_write(b"size", &mut out).unwrap();
        encode::text_to_write(&[b"oid ", OID1].concat(), &mut out).unwrap();
        encode::flush_to_write(&mut out).unwrap();
        let mut lines = StreamingPeekableIter::new(out.as_slice(), &[PacketLineRef::Delimiter]);
        let request = ObjectInfoRequest::parse(&mut lines).unwrap();
        assert!(request.size);
        assert_eq!(request.oids.len(), 1);
    }
}
