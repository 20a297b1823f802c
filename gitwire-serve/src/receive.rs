//! The receive session: the server half of a push.

use crate::hooks::Hooks;
use crate::interrupt::CancellationFlag;
use crate::policy::PolicySet;
use crate::visibility::{hide_nothing, visible_refs, HiddenRefPredicate};
use crate::{Error, RefSource};
use bstr::BString;
use gitwire_hash::ObjectId;
use gitwire_pack::store::{AcceptAll, ObjectStore};
use gitwire_pack::{PackParser, ParseOptions};
use gitwire_pktline::{encode, BandWriter, Channel, PacketLineRef, StreamingPeekableIter};
use gitwire_protocol::capability::name;
use gitwire_protocol::history::History;
use gitwire_protocol::push::report::{RefResult, Report};
use gitwire_protocol::push::{CommandList, CommandUpdate};
use gitwire_protocol::refs::{write_advertisement, Ref};
use gitwire_protocol::Capabilities;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// Applies accepted ref updates to the repository.
///
/// The store provides its own consistency for concurrent writers; this
/// trait only sequences one session's batch.
pub trait RefTransaction {
    /// Apply `updates`, returning one outcome per update in order.
    ///
    /// Under `atomic`, implementations must apply all or none, reporting
    /// the same failure for every update when any of them cannot proceed.
    fn apply(
        &mut self,
        updates: &[CommandUpdate],
        atomic: bool,
    ) -> Vec<Result<(), String>>;
}

/// Configuration for one receive session.
#[derive(Clone)]
pub struct ReceiveOptions {
    /// Agent token to advertise.
    pub agent: String,
    /// Predicate hiding refs from advertisement.
    pub hidden: Arc<HiddenRefPredicate>,
    /// Update policy evaluated per command.
    pub policy: PolicySet,
    /// Advertise and honor atomic pushes.
    pub allow_atomic: bool,
    /// Permit packs with store-resident delta bases.
    pub allow_thin_pack: bool,
    /// Ceiling on the incoming pack size.
    pub max_pack_bytes: Option<u64>,
    /// Ceiling on any single object's inflated size.
    pub max_object_size: Option<u64>,
    /// Only write the advertisement and return (HTTP `info/refs`).
    pub advertise_refs_only: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            agent: concat!("gitwire/", env!("CARGO_PKG_VERSION")).into(),
            hidden: hide_nothing(),
            policy: PolicySet::default(),
            allow_atomic: true,
            allow_thin_pack: true,
            max_pack_bytes: None,
            max_object_size: None,
            advertise_refs_only: false,
        }
    }
}

/// The server half of a push: command validation, pack ingestion under
/// quota, hook consultation, batch application and the status report.
pub struct ReceiveSession<'a, S> {
    source: &'a S,
    options: ReceiveOptions,
}

impl<'a, S> ReceiveSession<'a, S>
where
    S: RefSource + History,
{
    /// Create a session over a repository view.
    pub fn new(source: &'a S, options: ReceiveOptions) -> Self {
        Self { source, options }
    }

    fn advertised_capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::default();
        caps.push(name::REPORT_STATUS);
        if !self.options.policy.deny_deletes() {
            caps.push(name::DELETE_REFS);
        }
        caps.push(name::OFS_DELTA);
        caps.push(name::SIDE_BAND_64K);
        caps.push(name::QUIET);
        if self.options.allow_atomic {
            caps.push(name::ATOMIC);
        }
        caps.push(name::PUSH_OPTIONS);
        caps.push(format!("agent={}", self.options.agent));
        caps
    }

    /// Drive a v0 receive session over a duplex stream.
    ///
    /// Objects land in `store` (quarantining them is the store's choice);
    /// accepted updates are applied through `transaction`.
    pub fn run<R, W, O, T, H>(
        &self,
        input: R,
        mut output: W,
        store: &O,
        transaction: &mut T,
        hooks: &mut H,
        cancel: &CancellationFlag,
    ) -> Result<Option<Report>, Error>
    where
        R: io::BufRead,
        W: io::Write,
        O: ObjectStore,
        T: RefTransaction,
        H: Hooks,
    {
        let refs = visible_refs(self.source.advertised_refs(), &*self.options.hidden);
        write_advertisement(&refs, &self.advertised_capabilities(), &mut output)?;
        output.flush()?;
        if self.options.advertise_refs_only {
            return Ok(None);
        }

        let mut lines = StreamingPeekableIter::new(input, &[PacketLineRef::Flush]);
        let list = CommandList::parse(&mut lines)?;
        if list.is_empty() {
            return Ok(None);
        }
        let client = &list.capabilities;
        let atomic = client.contains(name::ATOMIC);
        if atomic && !self.options.allow_atomic {
            return Err(Error::Protocol(gitwire_protocol::Error::Protocol {
                reason: "atomic push was not advertised".into(),
                line: "atomic".into(),
            }));
        }
        let report_status = client.contains(name::REPORT_STATUS);
        let side_band = client.side_band();
        debug!(commands = list.commands.len(), atomic, "receive commands parsed");

        // One slot per command; exactly one outcome each, no more, no less.
        let mut outcomes: Vec<Option<String>> = vec![None; list.commands.len()];

        // Ingest the pack before judging commands: a broken pack fails
        // every command at once.
        let mut unpack_status = BString::from("ok");
        if list.expects_pack() {
            let parse_options = ParseOptions::new()
                .with_thin_pack(self.options.allow_thin_pack)
                .with_max_object_size(self.options.max_object_size)
                .with_max_pack_bytes(self.options.max_pack_bytes);
            let mut raw = lines.into_inner();
            match PackParser::new(parse_options).parse(
                &mut raw,
                store,
                &AcceptAll,
                cancel.as_atomic(),
            ) {
                Ok(outcome) => {
                    debug!(objects = outcome.entries.len(), "pack ingested");
                }
                Err(err) => {
                    unpack_status = BString::from(err.to_string());
                    for slot in &mut outcomes {
                        *slot = Some("unpacker error".into());
                    }
                    let report = self.build_report(&list, unpack_status, outcomes);
                    if report_status {
                        self.write_report(&report, side_band.is_active(), &mut output)?;
                    }
                    return Err(err.into());
                }
            }
        } else {
            // delete-only pushes carry no pack; keep the line reader alive
            // only long enough to know that
            let _ = lines;
        }

        let current: HashMap<BString, ObjectId> = self
            .source
            .advertised_refs()
            .iter()
            .filter_map(|r| r.target_id().map(|id| (BString::from(r.name().to_vec()), id)))
            .collect();

        if let Err(message) = hooks.pre_receive(&list.commands, &list.push_options) {
            for slot in &mut outcomes {
                *slot = Some(format!("pre-receive hook declined: {message}"));
            }
        }

        for (index, command) in list.commands.iter().enumerate() {
            if index % 32 == 0 {
                cancel.check()?;
            }
            if outcomes[index].is_some() {
                continue;
            }
            if let Err(reason) = self.validate_command(command, &current) {
                outcomes[index] = Some(reason);
                continue;
            }
            if let Err(message) = hooks.update(command) {
                outcomes[index] = Some(format!("hook declined: {message}"));
            }
        }

        if atomic && outcomes.iter().any(Option::is_some) {
            for slot in &mut outcomes {
                if slot.is_none() {
                    *slot = Some("atomic transaction failed".into());
                }
            }
        }

        let accepted: Vec<CommandUpdate> = list
            .commands
            .iter()
            .zip(&outcomes)
            .filter(|(_, outcome)| outcome.is_none())
            .map(|(command, _)| command.clone())
            .collect();
        if !accepted.is_empty() {
            let results = transaction.apply(&accepted, atomic);
            debug_assert_eq!(results.len(), accepted.len());
            let mut results = results.into_iter();
            for outcome in &mut outcomes {
                if outcome.is_none() {
                    if let Some(Err(message)) = results.next() {
                        *outcome = Some(message);
                    }
                }
            }
            hooks.post_receive(&accepted);
        }

        let report = self.build_report(&list, unpack_status, outcomes);
        if report_status {
            self.write_report(&report, side_band.is_active(), &mut output)?;
        }
        output.flush()?;
        Ok(Some(report))
    }

    /// Check a command against the current ref values and the policy set.
    fn validate_command(
        &self,
        command: &CommandUpdate,
        current: &HashMap<BString, ObjectId>,
    ) -> Result<(), String> {
        let existing = current.get(command.name());
        match command {
            CommandUpdate::Create { .. } if existing.is_some() => {
                return Err("stale info".into());
            }
            CommandUpdate::Update { old, .. } | CommandUpdate::Delete { old, .. } => {
                if existing != Some(old) {
                    return Err("stale info".into());
                }
            }
            CommandUpdate::Create { .. } => {}
        }
        self.options
            .policy
            .evaluate(command, self.source)
            .map_err(|reason| reason.as_report().to_string())
    }

    fn build_report(
        &self,
        list: &CommandList,
        unpack: BString,
        outcomes: Vec<Option<String>>,
    ) -> Report {
        let statuses = list
            .commands
            .iter()
            .zip(outcomes)
            .map(|(command, outcome)| {
                let name = BString::from(command.name().to_vec());
                match outcome {
                    None => (name, RefResult::Ok),
                    Some(reason) => (name, RefResult::Rejected(BString::from(reason))),
                }
            })
            .collect();
        Report { unpack, statuses }
    }

    fn write_report<W: io::Write>(
        &self,
        report: &Report,
        side_band: bool,
        output: &mut W,
    ) -> Result<(), Error> {
        if side_band {
            let mut framed = Vec::new();
            report.write_to(&mut framed)?;
            let mut band = BandWriter::new(&mut *output, Channel::Data, true);
            io::Write::write_all(&mut band, &framed)?;
            io::Write::flush(&mut band)?;
            encode::flush_to_write(output)?;
        } else {
            report.write_to(output)?;
        }
        Ok(())
    }
}
