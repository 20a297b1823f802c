//! The fetch-side connection state machine, client role.
//!
//! `AdvertisementRead → Negotiating → (Done | PackTransfer)`: read the ref
//! advertisement, trade haves for acknowledgements in growing batches, and
//! hand the pack bytes to the caller once the server can produce them. The
//! server role is composed with policy in `gitwire-serve`.

use crate::capability::{name, Capabilities, MultiAckMode};
use crate::error::{Error, Result};
use crate::filter::FilterSpec;
use crate::history::History;
use crate::progress::ProgressSink;
use crate::refs::{self, Ref};
use crate::response::{Acknowledgement, ShallowUpdate};
use bstr::BString;
use gitwire_hash::ObjectId;
use gitwire_pktline::{encode, PacketLineRef, ReadWithSidebands, StreamingPeekableIter};
use std::io;
use tracing::debug;

pub mod negotiate;
pub mod request;

pub use negotiate::{HaveBatcher, Negotiator, DEFAULT_MAX_HAVES, MAX_HAVES_WITHOUT_ACK};
pub use request::{
    parse_have_section, DeepenSpec, FetchRequest, FetchV2Request, HaveSection, LsRefsRequest,
    ObjectInfoRequest,
};

/// The default agent token value.
pub const AGENT: &str = concat!("gitwire/", env!("CARGO_PKG_VERSION"));

/// Observable states of a fetch connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Reading the ref advertisement.
    AdvertisementRead,
    /// Trading haves for acknowledgements.
    Negotiating,
    /// Receiving pack bytes.
    PackTransfer,
    /// Finished, successfully or not.
    Done,
}

/// Client-side fetch configuration.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// `true` over stateless (HTTP) transports: have batches double instead
    /// of growing linearly.
    pub stateless: bool,
    /// Ask for thin packs when the server offers them.
    pub thin_pack: bool,
    /// Ask for annotated tags pointing into the pack.
    pub include_tag: bool,
    /// Suppress server progress output.
    pub no_progress: bool,
    /// Limit history depth (`deepen <n>`).
    pub depth: Option<u32>,
    /// Object filter to request.
    pub filter: Option<FilterSpec>,
    /// Agent string to announce.
    pub agent: String,
    /// Absolute ceiling on haves before negotiation is forced to end.
    pub max_haves: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            stateless: false,
            thin_pack: true,
            include_tag: false,
            no_progress: false,
            depth: None,
            filter: None,
            agent: AGENT.into(),
            max_haves: DEFAULT_MAX_HAVES,
        }
    }
}

/// What a completed fetch produced.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Everything wanted is already present locally; nothing was
    /// transferred and no have round-trips happened.
    UpToDate,
    /// A pack was received and handed to the caller.
    PackTransferred {
        /// Commits the server acknowledged as common.
        common: Vec<ObjectId>,
        /// Shallow boundary changes announced by the server.
        shallow_updates: Vec<ShallowUpdate>,
    },
}

/// Run a v0 fetch against a duplex stream.
///
/// `receive_pack` is handed a reader positioned at the start of the pack
/// stream (already demultiplexed when side-band is active); parsing it is
/// the pack layer's concern.
pub fn run_v0<H, R, W, P, F>(
    history: &H,
    options: &FetchOptions,
    input: R,
    mut output: W,
    wants: &[ObjectId],
    progress: &mut P,
    receive_pack: F,
) -> Result<FetchOutcome>
where
    H: History,
    R: io::BufRead,
    W: io::Write,
    P: ProgressSink,
    F: FnOnce(&mut dyn io::Read) -> io::Result<()>,
{
    let mut lines = StreamingPeekableIter::new(input, &[PacketLineRef::Flush]);
    debug!(state = ?FetchState::AdvertisementRead, "reading advertisement");
    let advertisement = refs::read_advertisement(&mut lines)?;
    lines.reset();

    if wants.is_empty() || wants.iter().all(|w| history.contains(w)) {
        // nothing missing: terminate with zero have round-trips
        encode::flush_to_write(&mut output)?;
        output.flush()?;
        return Ok(FetchOutcome::UpToDate);
    }

    let server = &advertisement.capabilities;
    let multi_ack = server.multi_ack();
    let side_band = server.side_band();
    let no_done = server.contains(name::NO_DONE) && multi_ack == MultiAckMode::Detailed;

    send_wants_v0(&mut output, options, server, wants)?;
    output.flush()?;

    let mut shallow_updates = Vec::new();
    if options.depth.is_some() {
        // the shallow/unshallow block answers our deepen request
        while let Some(line) = lines.read_line() {
            let line = line??;
            let Some(data) = line.as_text() else { continue };
            match ShallowUpdate::parse(data) {
                Some(update) => shallow_updates.push(update?),
                None => return Err(Error::protocol("expected shallow or unshallow", data)),
            }
        }
        lines.reset();
    }

    debug!(state = ?FetchState::Negotiating, ?multi_ack, "starting negotiation");
    let mut negotiator = Negotiator::new(history);
    for reference in &advertisement.refs {
        if let Some(id) = reference.target_id() {
            negotiator.mark_advertised(id);
        }
    }
    for want in wants {
        negotiator.mark_want(*want);
    }

    let mut batcher = HaveBatcher::new(options.stateless);
    let mut common = Vec::new();
    let mut ready = false;

    loop {
        if progress.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let batch = negotiator.next_batch(batcher.next_size());
        if batch.is_empty() {
            break;
        }
        for (index, have) in batch.iter().enumerate() {
            if index % 32 == 0 && progress.is_cancelled() {
                return Err(Error::Cancelled);
            }
            encode::text_to_write(format!("have {have}").as_bytes(), &mut output)?;
        }
        encode::flush_to_write(&mut output)?;
        output.flush()?;

        match multi_ack {
            MultiAckMode::Off => match read_ack(&mut lines)? {
                Acknowledgement::Nak => {}
                Acknowledgement::Final(id) => {
                    negotiator.mark_common(id);
                    if !common.contains(&id) {
                        common.push(id);
                    }
                    ready = true;
                }
                other => {
                    return Err(Error::protocol(
                        "unexpected ack in multi-ack off mode",
                        other.to_line().trim_end().as_bytes(),
                    ))
                }
            },
            MultiAckMode::Continue | MultiAckMode::Detailed => loop {
                match read_ack(&mut lines)? {
                    Acknowledgement::Nak => break,
                    Acknowledgement::Common(id) | Acknowledgement::Continue(id) => {
                        negotiator.mark_common(id);
                        if !common.contains(&id) {
                            common.push(id);
                        }
                    }
                    Acknowledgement::Ready(id) => {
                        negotiator.mark_common(id);
                        if !common.contains(&id) {
                            common.push(id);
                        }
                        ready = true;
                    }
                    Acknowledgement::Final(id) => {
                        negotiator.mark_common(id);
                        if !common.contains(&id) {
                            common.push(id);
                        }
                        ready = true;
                        break;
                    }
                }
            },
        }
        if ready || negotiator.ok_to_give_up(options.max_haves) {
            break;
        }
    }

    // under no-done the server proceeds straight to its final ACK once it
    // said ready; otherwise the client closes negotiation with done
    if !(no_done && ready) {
        encode::text_to_write(b"done", &mut output)?;
        output.flush()?;
    }
    // in multi-ack-off mode a server that already ACKed stays silent after
    // done; the pack follows directly
    if !(multi_ack == MultiAckMode::Off && ready) {
        match read_ack(&mut lines)? {
            Acknowledgement::Nak => {}
            Acknowledgement::Final(id) | Acknowledgement::Common(id) => {
                negotiator.mark_common(id);
                if !common.contains(&id) {
                    common.push(id);
                }
            }
            other => {
                return Err(Error::protocol(
                    "unexpected ack after done",
                    other.to_line().trim_end().as_bytes(),
                ))
            }
        }
    }

    debug!(state = ?FetchState::PackTransfer, common = common.len(), "receiving pack");
    if side_band.is_active() {
        let mut reader = ReadWithSidebands::new(&mut lines, |text| progress.progress(text));
        receive_pack(&mut reader)?;
    } else {
        let mut raw = lines.into_inner();
        receive_pack(&mut raw)?;
    }
    debug!(state = ?FetchState::Done, "fetch complete");
    Ok(FetchOutcome::PackTransferred {
        common,
        shallow_updates,
    })
}

fn send_wants_v0<W: io::Write>(
    output: &mut W,
    options: &FetchOptions,
    server: &Capabilities,
    wants: &[ObjectId],
) -> Result<()> {
    let caps = select_capabilities_v0(options, server);
    for (index, want) in wants.iter().enumerate() {
        if index == 0 && !caps.is_empty() {
            let mut line = BString::from(format!("want {want} "));
            line.extend_from_slice(&caps.to_wire());
            encode::text_to_write(&line, output)?;
        } else {
            encode::text_to_write(format!("want {want}").as_bytes(), output)?;
        }
    }
    if let Some(depth) = options.depth {
        encode::text_to_write(format!("deepen {depth}").as_bytes(), output)?;
    }
    if let Some(filter) = &options.filter {
        if server.contains(name::FILTER) {
            encode::text_to_write(format!("filter {}", filter.to_wire()).as_bytes(), output)?;
        }
    }
    encode::flush_to_write(output)?;
    Ok(())
}

/// Pick the capability tokens to attach to the first want line: only what
/// the server advertised and the options ask for.
fn select_capabilities_v0(options: &FetchOptions, server: &Capabilities) -> Capabilities {
    let mut caps = Capabilities::default();
    match server.multi_ack() {
        MultiAckMode::Detailed => caps.push(name::MULTI_ACK_DETAILED),
        MultiAckMode::Continue => caps.push(name::MULTI_ACK),
        MultiAckMode::Off => {}
    }
    if options.thin_pack && server.contains(name::THIN_PACK) {
        caps.push(name::THIN_PACK);
    }
    if server.side_band().is_large() {
        caps.push(name::SIDE_BAND_64K);
    } else if server.side_band().is_active() {
        caps.push(name::SIDE_BAND);
    }
    if server.contains(name::OFS_DELTA) {
        caps.push(name::OFS_DELTA);
    }
    if options.depth.is_some() && server.contains(name::SHALLOW) {
        caps.push(name::SHALLOW);
    }
    if options.no_progress && server.contains(name::NO_PROGRESS) {
        caps.push(name::NO_PROGRESS);
    }
    if options.include_tag && server.contains(name::INCLUDE_TAG) {
        caps.push(name::INCLUDE_TAG);
    }
    if options.filter.is_some() && server.contains(name::FILTER) {
        caps.push(name::FILTER);
    }
    if server.contains(name::NO_DONE) && server.multi_ack() == MultiAckMode::Detailed {
        caps.push(name::NO_DONE);
    }
    caps.push(format!("agent={}", options.agent));
    caps
}

fn read_ack<R: io::BufRead>(lines: &mut StreamingPeekableIter<R>) -> Result<Acknowledgement> {
    match lines.read_line() {
        None => Err(Error::protocol("stream ended while expecting an acknowledgement", b"")),
        Some(line) => {
            let line = line??;
            if let Some(message) = line.check_error() {
                return Err(Error::RemoteRejected {
                    message: String::from_utf8_lossy(message).into_owned(),
                });
            }
            let data = line
                .as_text()
                .ok_or_else(|| Error::protocol("expected an acknowledgement line", b""))?;
            Acknowledgement::parse(data)
        }
    }
}

/// Run a v2 fetch: an `ls-refs` round for the advertisement, then `fetch`
/// rounds until the server signals `ready` or the client gives up with
/// `done`.
pub fn run_v2<H, R, W, P, F>(
    history: &H,
    options: &FetchOptions,
    input: R,
    mut output: W,
    want_prefixes: &[BString],
    select_wants: impl FnOnce(&[Ref]) -> Vec<ObjectId>,
    progress: &mut P,
    receive_pack: F,
) -> Result<FetchOutcome>
where
    H: History,
    R: io::BufRead,
    W: io::Write,
    P: ProgressSink,
    F: FnOnce(&mut dyn io::Read) -> io::Result<()>,
{
    let mut lines = StreamingPeekableIter::new(input, &[PacketLineRef::Flush]);
    lines.fail_on_err_lines(true);

    debug!(state = ?FetchState::AdvertisementRead, "ls-refs round");
    encode::text_to_write(b"command=ls-refs", &mut output)?;
    encode::text_to_write(format!("agent={}", options.agent).as_bytes(), &mut output)?;
    encode::delim_to_write(&mut output)?;
    encode::text_to_write(b"peel", &mut output)?;
    encode::text_to_write(b"symrefs", &mut output)?;
    for prefix in want_prefixes {
        let mut line = BString::from("ref-prefix ");
        line.extend_from_slice(prefix);
        encode::text_to_write(&line, &mut output)?;
    }
    encode::flush_to_write(&mut output)?;
    output.flush()?;

    let mut advertised = Vec::new();
    while let Some(line) = lines.read_line() {
        let line = line??;
        if let Some(data) = line.as_text() {
            advertised.push(refs::parse_ls_refs_line(data)?);
        }
    }
    lines.reset();

    let wants = select_wants(&advertised);
    if wants.is_empty() || wants.iter().all(|w| history.contains(w)) {
        return Ok(FetchOutcome::UpToDate);
    }

    debug!(state = ?FetchState::Negotiating, "fetch rounds");
    let mut negotiator = Negotiator::new(history);
    for reference in &advertised {
        if let Some(id) = reference.target_id() {
            negotiator.mark_advertised(id);
        }
    }
    for want in &wants {
        negotiator.mark_want(*want);
    }

    let mut batcher = HaveBatcher::new(options.stateless);
    let mut common: Vec<ObjectId> = Vec::new();
    let mut shallow_updates = Vec::new();
    let mut receive_pack = Some(receive_pack);

    loop {
        if progress.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let batch = negotiator.next_batch(batcher.next_size());
        let done = batch.is_empty() || negotiator.ok_to_give_up(options.max_haves);

        encode::text_to_write(b"command=fetch", &mut output)?;
        encode::text_to_write(format!("agent={}", options.agent).as_bytes(), &mut output)?;
        encode::delim_to_write(&mut output)?;
        if options.thin_pack {
            encode::text_to_write(b"thin-pack", &mut output)?;
        }
        encode::text_to_write(b"ofs-delta", &mut output)?;
        if options.include_tag {
            encode::text_to_write(b"include-tag", &mut output)?;
        }
        if options.no_progress {
            encode::text_to_write(b"no-progress", &mut output)?;
        }
        if let Some(depth) = options.depth {
            encode::text_to_write(format!("deepen {depth}").as_bytes(), &mut output)?;
        }
        if let Some(filter) = &options.filter {
            encode::text_to_write(format!("filter {}", filter.to_wire()).as_bytes(), &mut output)?;
        }
        for want in &wants {
            encode::text_to_write(format!("want {want}").as_bytes(), &mut output)?;
        }
        // stateless rounds must replay everything agreed so far
        for have in common.iter().chain(batch.iter()) {
            encode::text_to_write(format!("have {have}").as_bytes(), &mut output)?;
        }
        if done {
            encode::text_to_write(b"done", &mut output)?;
        }
        encode::flush_to_write(&mut output)?;
        output.flush()?;

        let response = read_v2_response(
            &mut lines,
            &mut negotiator,
            &mut common,
            &mut shallow_updates,
            progress,
            &mut receive_pack,
        )?;
        match response {
            V2Response::PackReceived => {
                debug!(state = ?FetchState::Done, "fetch complete");
                return Ok(FetchOutcome::PackTransferred {
                    common,
                    shallow_updates,
                });
            }
            V2Response::KeepNegotiating => {
                if done {
                    return Err(Error::protocol(
                        "server ended the exchange without a packfile",
                        b"",
                    ));
                }
            }
        }
    }
}

enum V2Response {
    KeepNegotiating,
    PackReceived,
}

/// Read one v2 fetch response: an `acknowledgments` section, optionally
/// followed by `shallow-info` and `packfile` sections.
fn read_v2_response<R, P, F>(
    lines: &mut StreamingPeekableIter<R>,
    negotiator: &mut Negotiator<'_, impl History>,
    common: &mut Vec<ObjectId>,
    shallow_updates: &mut Vec<ShallowUpdate>,
    progress: &mut P,
    receive_pack: &mut Option<F>,
) -> Result<V2Response>
where
    R: io::BufRead,
    P: ProgressSink,
    F: FnOnce(&mut dyn io::Read) -> io::Result<()>,
{
    lines.reset_with(&[PacketLineRef::Flush, PacketLineRef::Delimiter]);
    let mut received_pack = false;
    let mut section = read_section_header(lines)?;
    loop {
        let next = match section.as_slice() {
            b"acknowledgments" => {
                while let Some(line) = lines.read_line() {
                    let line = line??;
                    let Some(data) = line.as_text() else { continue };
                    if data == b"ready" {
                        // the server can produce a pack without more rounds
                    } else if data == b"NAK" {
                        // nothing new this round
                    } else if let Some(hex) = data.strip_prefix(b"ACK ") {
                        let id = ObjectId::from_hex(hex)
                            .map_err(|_| Error::protocol("invalid id in ACK", data))?;
                        negotiator.mark_common(id);
                        if !common.contains(&id) {
                            common.push(id);
                        }
                    } else {
                        return Err(Error::protocol("unexpected acknowledgment line", data));
                    }
                }
                lines.stopped_at()
            }
            b"shallow-info" => {
                while let Some(line) = lines.read_line() {
                    let line = line??;
                    let Some(data) = line.as_text() else { continue };
                    match ShallowUpdate::parse(data) {
                        Some(update) => shallow_updates.push(update?),
                        None => return Err(Error::protocol("expected shallow or unshallow", data)),
                    }
                }
                lines.stopped_at()
            }
            b"packfile" => {
                lines.reset_with(&[PacketLineRef::Flush]);
                let handler = receive_pack
                    .take()
                    .ok_or_else(|| Error::protocol("second packfile section", b"packfile"))?;
                let mut reader = ReadWithSidebands::new(lines, |text| progress.progress(text));
                handler(&mut reader)?;
                received_pack = true;
                lines.stopped_at()
            }
            other => return Err(Error::protocol("unknown response section", other)),
        };
        match next {
            Some(PacketLineRef::Delimiter) => {
                lines.reset_with(&[PacketLineRef::Flush, PacketLineRef::Delimiter]);
                section = read_section_header(lines)?;
            }
            _ => break,
        }
    }
    lines.reset_with(&[PacketLineRef::Flush]);
    Ok(if received_pack {
        V2Response::PackReceived
    } else {
        V2Response::KeepNegotiating
    })
}

fn read_section_header<R: io::BufRead>(
    lines: &mut StreamingPeekableIter<R>,
) -> Result<Vec<u8>> {
    match lines.read_line() {
        None => Err(Error::protocol("missing response section header", b"")),
        Some(line) => {
            let line = line??;
            line.as_text()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Error::protocol("expected a section header line", b""))
        }
    }
}
