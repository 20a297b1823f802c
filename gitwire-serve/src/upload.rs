//! The upload session: the server half of a fetch.

use crate::interrupt::CancellationFlag;
use crate::visibility::{hide_nothing, visible_refs, HiddenRefPredicate};
use crate::{Error, RefSource};
use bstr::BString;
use gitwire_hash::ObjectId;
use gitwire_pktline::{encode, BandWriter, Channel, PacketLineRef, StreamingPeekableIter};
use gitwire_protocol::capability::{name, Capabilities, MultiAckMode};
use gitwire_protocol::fetch::{
    parse_have_section, FetchRequest, FetchV2Request, LsRefsRequest, ObjectInfoRequest,
};
use gitwire_protocol::filter::FilterSpec;
use gitwire_protocol::history::{is_ancestor, History};
use gitwire_protocol::refs::{write_advertisement, Ref};
use gitwire_protocol::response::Acknowledgement;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// How unadvertised want ids are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WantPolicy {
    /// Only advertised tips may be wanted.
    #[default]
    AdvertisedOnly,
    /// Any ref tip may be wanted, advertised or not.
    Tip,
    /// Anything reachable from a ref tip may be wanted.
    Reachable,
    /// Any object the repository holds may be wanted.
    Any,
}

/// Everything the pack writer needs to produce the data-transfer phase.
///
/// Pack generation itself is outside this crate; sessions only route the
/// negotiated parameters and the output stream.
#[derive(Debug)]
pub struct PackRequest<'a> {
    /// Objects the client asked for.
    pub wants: &'a [ObjectId],
    /// Commits both sides agreed are common.
    pub common: &'a [ObjectId],
    /// The client's shallow boundaries.
    pub shallow: &'a [ObjectId],
    /// The negotiated filter, if any.
    pub filter: Option<&'a FilterSpec>,
    /// `true` if the client accepts thin packs.
    pub thin: bool,
}

/// Produces the pack bytes once negotiation settles.
pub trait PackSource {
    /// Write a pack satisfying `request` to `out`.
    fn write_pack(&mut self, request: &PackRequest<'_>, out: &mut dyn io::Write)
        -> io::Result<()>;
}

/// Configuration for one upload session.
#[derive(Clone)]
pub struct UploadOptions {
    /// Agent token to advertise.
    pub agent: String,
    /// Predicate hiding refs from advertisement and reach.
    pub hidden: Arc<HiddenRefPredicate>,
    /// How unadvertised wants are treated.
    pub want_policy: WantPolicy,
    /// Advertise and honor the `filter` capability.
    pub allow_filter: bool,
    /// Ceiling on want lines per request.
    pub max_wants: Option<usize>,
    /// Ceiling on negotiation rounds before the session is torn down.
    pub max_rounds: Option<usize>,
    /// Only write the advertisement and return (HTTP `info/refs`).
    pub advertise_refs_only: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            agent: concat!("gitwire/", env!("CARGO_PKG_VERSION")).into(),
            hidden: hide_nothing(),
            want_policy: WantPolicy::default(),
            allow_filter: false,
            max_wants: None,
            max_rounds: None,
            advertise_refs_only: false,
        }
    }
}

/// The server half of a fetch, composing the negotiation state machine
/// with visibility and quota policy.
pub struct UploadSession<'a, S> {
    source: &'a S,
    options: UploadOptions,
}

impl<'a, S> UploadSession<'a, S>
where
    S: RefSource + History,
{
    /// Create a session over a repository view.
    pub fn new(source: &'a S, options: UploadOptions) -> Self {
        Self { source, options }
    }

    fn advertised_capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::default();
        caps.push(name::MULTI_ACK_DETAILED);
        caps.push(name::MULTI_ACK);
        caps.push(name::THIN_PACK);
        caps.push(name::SIDE_BAND_64K);
        caps.push(name::SIDE_BAND);
        caps.push(name::OFS_DELTA);
        caps.push(name::SHALLOW);
        caps.push(name::DEEPEN_SINCE);
        caps.push(name::DEEPEN_NOT);
        caps.push(name::NO_PROGRESS);
        caps.push(name::INCLUDE_TAG);
        caps.push(name::NO_DONE);
        if self.options.allow_filter {
            caps.push(name::FILTER);
        }
        match self.options.want_policy {
            WantPolicy::AdvertisedOnly => {}
            WantPolicy::Tip => caps.push(name::ALLOW_TIP_SHA1_IN_WANT),
            WantPolicy::Reachable => caps.push(name::ALLOW_REACHABLE_SHA1_IN_WANT),
            WantPolicy::Any => caps.push(name::ALLOW_ANY_SHA1_IN_WANT),
        }
        caps.push(format!("agent={}", self.options.agent));
        caps
    }

    /// Drive a v0 session over a duplex stream.
    pub fn run_v0<R, W, P>(
        &self,
        input: R,
        mut output: W,
        pack: &mut P,
        cancel: &CancellationFlag,
    ) -> Result<(), Error>
    where
        R: io::BufRead,
        W: io::Write,
        P: PackSource,
    {
        let refs = visible_refs(self.source.advertised_refs(), &*self.options.hidden);
        write_advertisement(&refs, &self.advertised_capabilities(), &mut output)?;
        output.flush()?;
        if self.options.advertise_refs_only {
            return Ok(());
        }

        let mut lines = StreamingPeekableIter::new(input, &[PacketLineRef::Flush]);
        let request = FetchRequest::parse_v0(&mut lines)?;
        if request.wants.is_empty() {
            // the client hung up after the advertisement
            return Ok(());
        }
        if let Some(limit) = self.options.max_wants {
            if request.wants.len() > limit {
                let message = format!("too many wants (limit {limit})");
                encode::error_to_write(message.as_bytes(), &mut output)?;
                return Err(Error::QuotaExceeded { what: message });
            }
        }
        if let Err(err) = self.validate_wants(&refs, &request.wants) {
            encode::error_to_write(err.to_string().as_bytes(), &mut output)?;
            return Err(err);
        }

        let client = &request.capabilities;
        let multi_ack = client.multi_ack();
        let side_band = client.side_band();
        let no_progress = client.contains(name::NO_PROGRESS);
        let client_no_done =
            client.contains(name::NO_DONE) && multi_ack == MultiAckMode::Detailed;
        debug!(wants = request.wants.len(), ?multi_ack, "v0 negotiation");

        let mut common: Vec<ObjectId> = Vec::new();
        let mut done = false;
        let mut rounds = 0usize;
        while !done {
            cancel.check()?;
            rounds += 1;
            if let Some(limit) = self.options.max_rounds {
                if rounds > limit {
                    let message = format!("negotiation exceeded {limit} rounds");
                    encode::error_to_write(message.as_bytes(), &mut output)?;
                    return Err(Error::QuotaExceeded { what: message });
                }
            }
            lines.reset();
            let section = parse_have_section(&mut lines)?;
            if section.haves.is_empty() && !section.done {
                // the client gave up between rounds
                return Ok(());
            }
            for have in &section.haves {
                if self.source.contains(have) {
                    if !common.contains(have) {
                        common.push(*have);
                    }
                    let ack = match multi_ack {
                        MultiAckMode::Off => continue,
                        MultiAckMode::Continue => Acknowledgement::Continue(*have),
                        MultiAckMode::Detailed => Acknowledgement::Common(*have),
                    };
                    encode::data_to_write(ack.to_line().as_bytes(), &mut output)?;
                }
            }
            done = section.done;
            if !done {
                let mut ready_sent = false;
                if multi_ack == MultiAckMode::Detailed && !common.is_empty() {
                    let ready = Acknowledgement::Ready(*common.last().expect("nonempty"));
                    encode::data_to_write(ready.to_line().as_bytes(), &mut output)?;
                    ready_sent = true;
                }
                encode::data_to_write(Acknowledgement::Nak.to_line().as_bytes(), &mut output)?;
                output.flush()?;
                // under no-done, a ready client stops talking: proceed to
                // the final ACK and the pack without waiting for done
                if client_no_done && ready_sent {
                    break;
                }
            }
        }

        let final_ack = match common.last() {
            Some(last) => Acknowledgement::Final(*last),
            None => Acknowledgement::Nak,
        };
        encode::data_to_write(final_ack.to_line().as_bytes(), &mut output)?;

        let pack_request = PackRequest {
            wants: &request.wants,
            common: &common,
            shallow: &request.shallow,
            filter: request.filter.as_ref(),
            thin: client.contains(name::THIN_PACK),
        };
        debug!(common = common.len(), "sending pack");
        if side_band.is_active() {
            if !no_progress {
                encode::band_to_write(Channel::Progress, b"Enumerating objects\n", &mut output)?;
            }
            let mut band = BandWriter::new(&mut output, Channel::Data, side_band.is_large());
            let result = pack
                .write_pack(&pack_request, &mut band)
                .and_then(|()| io::Write::flush(&mut band));
            if let Err(err) = result {
                // once side-band is active, failures travel on the error
                // channel before the connection is torn down
                let message = format!("fatal: {err}\n");
                encode::band_to_write(Channel::Error, message.as_bytes(), &mut output)?;
                return Err(err.into());
            }
            encode::flush_to_write(&mut output)?;
        } else {
            pack.write_pack(&pack_request, &mut output)?;
        }
        output.flush()?;
        Ok(())
    }

    fn validate_wants(&self, advertised: &[Ref], wants: &[ObjectId]) -> Result<(), Error> {
        let tips: Vec<ObjectId> = self
            .source
            .advertised_refs()
            .iter()
            .filter_map(Ref::target_id)
            .collect();
        for want in wants {
            let is_advertised = advertised
                .iter()
                .any(|r| r.target_id() == Some(*want) || r.peeled_id() == Some(*want));
            if is_advertised {
                continue;
            }
            let allowed = match self.options.want_policy {
                WantPolicy::AdvertisedOnly => false,
                WantPolicy::Tip => tips.contains(want),
                WantPolicy::Reachable => {
                    tips.iter().any(|tip| is_ancestor(self.source, *want, *tip))
                }
                WantPolicy::Any => self.source.contains(want),
            };
            if !allowed {
                return Err(Error::Protocol(gitwire_protocol::Error::RemoteRejected {
                    message: format!("upload-pack: not our ref {want}"),
                }));
            }
        }
        Ok(())
    }

    /// Drive a v2 session: one command request per round until the client
    /// disconnects.
    pub fn run_v2<R, W, P>(
        &self,
        input: R,
        mut output: W,
        pack: &mut P,
        cancel: &CancellationFlag,
    ) -> Result<(), Error>
    where
        R: io::BufRead,
        W: io::Write,
        P: PackSource,
    {
        let mut lines = StreamingPeekableIter::new(input, &[PacketLineRef::Delimiter]);
        loop {
            cancel.check()?;
            lines.reset_with(&[PacketLineRef::Delimiter]);
            let command = match lines.read_line() {
                None => return Ok(()),
                Some(line) => {
                    match line?? {
                        // a lone flush between requests is a keepalive
                        PacketLineRef::Flush | PacketLineRef::ResponseEnd => continue,
                        PacketLineRef::Delimiter => {
                            return Err(Error::Protocol(gitwire_protocol::Error::Protocol {
                                reason: "request started with a delimiter".into(),
                                line: "0001".into(),
                            }))
                        }
                        PacketLineRef::Data(data) => {
                            BString::from(data.strip_suffix(b"\n").unwrap_or(data))
                        }
                    }
                }
            };
            match command.as_slice() {
                b"command=ls-refs" => {
                    let request = LsRefsRequest::parse(&mut lines)?;
                    self.respond_ls_refs(&request, &mut output)?;
                }
                b"command=fetch" => {
                    let request = FetchV2Request::parse(&mut lines)?;
                    self.respond_fetch_v2(&request, &mut output, pack)?;
                }
                b"command=object-info" => {
                    let request = ObjectInfoRequest::parse(&mut lines)?;
                    self.respond_object_info(&request, &mut output)?;
                }
                other => {
                    return Err(Error::Protocol(gitwire_protocol::Error::Protocol {
                        reason: "unknown v2 command".into(),
                        line: String::from_utf8_lossy(other).into_owned(),
                    }))
                }
            }
            output.flush()?;
        }
    }

    fn respond_ls_refs<W: io::Write>(
        &self,
        request: &LsRefsRequest,
        output: &mut W,
    ) -> Result<(), Error> {
        let refs = visible_refs(self.source.advertised_refs(), &*self.options.hidden);
        for reference in refs {
            if !request.matches(reference.name()) {
                continue;
            }
            let mut line = match &reference {
                Ref::Unborn { full_ref_name, target } => {
                    if !request.symrefs {
                        continue;
                    }
                    let mut line = BString::from("unborn ");
                    line.extend_from_slice(full_ref_name);
                    line.extend_from_slice(b" symref-target:");
                    line.extend_from_slice(target);
                    line
                }
                other => {
                    let id = other.target_id().expect("non-unborn refs have a target");
                    let mut line = BString::from(format!("{id} "));
                    line.extend_from_slice(other.name());
                    if request.symrefs {
                        if let Ref::Symbolic { target, .. } = other {
                            line.extend_from_slice(b" symref-target:");
                            line.extend_from_slice(target);
                        }
                    }
                    if request.peel {
                        if let Some(peeled) = other.peeled_id() {
                            line.extend_from_slice(format!(" peeled:{peeled}").as_bytes());
                        }
                    }
                    line
                }
            };
            line.push(b'\n');
            encode::data_to_write(&line, output)?;
        }
        encode::flush_to_write(output)?;
        Ok(())
    }

    fn respond_fetch_v2<W: io::Write, P: PackSource>(
        &self,
        request: &FetchV2Request,
        output: &mut W,
        pack: &mut P,
    ) -> Result<(), Error> {
        let refs = visible_refs(self.source.advertised_refs(), &*self.options.hidden);
        self.validate_wants(&refs, &request.wants)?;

        let mut common: Vec<ObjectId> = Vec::new();
        for have in &request.haves {
            if self.source.contains(have) && !common.contains(have) {
                common.push(*have);
            }
        }
        // a server with common ground can complete without another round
        let ready = request.done || !common.is_empty();

        encode::text_to_write(b"acknowledgments", output)?;
        if common.is_empty() {
            encode::text_to_write(b"NAK", output)?;
        } else {
            for id in &common {
                encode::text_to_write(format!("ACK {id}").as_bytes(), output)?;
            }
        }
        if ready {
            encode::text_to_write(b"ready", output)?;
            encode::delim_to_write(output)?;
            encode::text_to_write(b"packfile", output)?;
            let pack_request = PackRequest {
                wants: &request.wants,
                common: &common,
                shallow: &request.shallow,
                filter: request.filter.as_ref(),
                thin: request.thin_pack,
            };
            let mut band = BandWriter::new(&mut *output, Channel::Data, true);
            pack.write_pack(&pack_request, &mut band)?;
            io::Write::flush(&mut band)?;
        }
        encode::flush_to_write(output)?;
        Ok(())
    }

    fn respond_object_info<W: io::Write>(
        &self,
        request: &ObjectInfoRequest,
        output: &mut W,
    ) -> Result<(), Error> {
        encode::text_to_write(b"size", output)?;
        for id in &request.oids {
            let line = match self.source.object_size(id) {
                Some(size) => format!("{id} {size}"),
                None => format!("{id} "),
            };
            encode::text_to_write(line.as_bytes(), output)?;
        }
        encode::flush_to_write(output)?;
        Ok(())
    }
}
