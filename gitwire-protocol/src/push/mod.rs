//! The push-side connection state machine, client role.
//!
//! `AdvertisementRead → CommandsSent → (PackSent?) → StatusReportRead`. The
//! client decides fast-forward-ness locally, refuses non-fast-forwards
//! unless forced, aborts the whole batch under atomic semantics, and
//! requires exactly one reported outcome per command it sent.

use crate::capability::{name, Capabilities};
use crate::error::{Error, Result};
use crate::history::{is_ancestor, History};
use crate::progress::ProgressSink;
use crate::refs;
use bstr::{BString, ByteSlice};
use gitwire_hash::ObjectId;
use gitwire_pktline::{encode, PacketLineRef, ReadWithSidebands, StreamingPeekableIter};
use std::io;
use tracing::debug;

pub mod commands;
pub mod report;

pub use commands::{CommandList, CommandUpdate};
pub use report::{RefResult, Report};

/// Observable states of a push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    /// Reading the ref advertisement.
    AdvertisementRead,
    /// Command list written.
    CommandsSent,
    /// Pack bytes written.
    PackSent,
    /// Reading the status report.
    StatusReportRead,
}

/// One requested ref update, before reconciliation with the remote state.
#[derive(Debug, Clone)]
pub struct RefUpdate {
    /// The full ref name to update.
    pub name: BString,
    /// The desired new value; null deletes the ref.
    pub new: ObjectId,
    /// Allow non-fast-forward updates.
    pub force: bool,
}

/// Client-side push configuration.
#[derive(Debug, Clone)]
pub struct PushOptions {
    /// All-or-nothing updates: abort the whole batch if any single update
    /// would be rejected.
    pub atomic: bool,
    /// Agent string to announce.
    pub agent: String,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            atomic: false,
            agent: super::fetch::AGENT.into(),
        }
    }
}

/// Per-ref outcome of a push, merging local and remote decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Applied by the server.
    Ok,
    /// Rejected locally before anything was sent.
    RejectedLocally(String),
    /// Rejected by the server with its reason.
    RejectedByServer(BString),
}

/// The overall result of a push.
#[derive(Debug)]
pub struct PushReport {
    /// `true` if the server indexed the pack successfully.
    pub unpack_ok: bool,
    /// One outcome per requested update, in request order.
    pub results: Vec<(BString, UpdateStatus)>,
}

/// Run a v0 push against a duplex stream.
///
/// `provide_pack` is invoked with the raw output stream when at least one
/// accepted update is not a deletion; generating the pack is the caller's
/// concern.
pub fn run_v0<H, R, W, P, F>(
    history: &H,
    options: &PushOptions,
    input: R,
    mut output: W,
    updates: &[RefUpdate],
    progress: &mut P,
    provide_pack: F,
) -> Result<PushReport>
where
    H: History,
    R: io::BufRead,
    W: io::Write,
    P: ProgressSink,
    F: FnOnce(&mut dyn io::Write) -> io::Result<()>,
{
    let mut lines = StreamingPeekableIter::new(input, &[PacketLineRef::Flush]);
    debug!(state = ?PushState::AdvertisementRead, "reading advertisement");
    let advertisement = refs::read_advertisement(&mut lines)?;
    lines.reset();
    let server = &advertisement.capabilities;
    if options.atomic && !server.contains(name::ATOMIC) {
        return Err(Error::protocol("server does not support atomic push", b"atomic"));
    }

    // Reconcile each requested update against the advertised state.
    let mut accepted: Vec<CommandUpdate> = Vec::new();
    let mut results: Vec<(BString, UpdateStatus)> = Vec::new();
    for update in updates {
        if progress.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let old = advertisement
            .refs
            .iter()
            .find(|r| r.name() == update.name.as_bstr())
            .and_then(|r| r.target_id())
            .unwrap_or_else(ObjectId::null);
        match validate_update(history, server, update, old) {
            Ok(command) => {
                accepted.push(command);
                results.push((update.name.clone(), UpdateStatus::Ok)); // provisional
            }
            Err(reason) => {
                if options.atomic {
                    // abort the entire batch before sending anything
                    return Err(Error::AtomicAborted {
                        refname: update.name.to_string(),
                    });
                }
                results.push((update.name.clone(), UpdateStatus::RejectedLocally(reason)));
            }
        }
    }

    if accepted.is_empty() {
        encode::flush_to_write(&mut output)?;
        output.flush()?;
        return Ok(PushReport {
            unpack_ok: true,
            results,
        });
    }

    let caps = select_capabilities(options, server);
    let side_band = server.side_band().is_active() && caps.contains(name::SIDE_BAND_64K);
    let report_status = caps.contains(name::REPORT_STATUS);

    for (index, command) in accepted.iter().enumerate() {
        let mut line = BString::from(format!("{} {} ", command.old_id(), command.new_id()));
        line.extend_from_slice(command.name());
        if index == 0 {
            line.push(0);
            line.extend_from_slice(&caps.to_wire());
        }
        line.push(b'\n');
        encode::data_to_write(&line, &mut output)?;
    }
    encode::flush_to_write(&mut output)?;
    debug!(state = ?PushState::CommandsSent, commands = accepted.len(), "commands written");

    if accepted.iter().any(|c| !c.is_delete()) {
        provide_pack(&mut output)?;
        debug!(state = ?PushState::PackSent, "pack written");
    }
    output.flush()?;

    let mut unpack_ok = true;
    if report_status {
        debug!(state = ?PushState::StatusReportRead, "reading report");
        let report = if side_band {
            // the report itself arrives pkt-line framed inside band 1
            let mut demuxed = Vec::new();
            {
                let mut reader = ReadWithSidebands::new(&mut lines, |text| progress.progress(text));
                io::Read::read_to_end(&mut reader, &mut demuxed)?;
            }
            let mut report_lines =
                StreamingPeekableIter::new(demuxed.as_slice(), &[PacketLineRef::Flush]);
            Report::parse(&mut report_lines)?
        } else {
            Report::parse(&mut lines)?
        };
        report.ensure_complete(accepted.iter().map(CommandUpdate::name))?;
        unpack_ok = report.unpack_ok();
        for (refname, status) in &mut results {
            if matches!(status, UpdateStatus::RejectedLocally(_)) {
                continue;
            }
            match report.status_of(refname.as_bstr()) {
                Some(RefResult::Ok) => {}
                Some(RefResult::Rejected(reason)) => {
                    *status = UpdateStatus::RejectedByServer(reason.clone());
                }
                None => unreachable!("ensure_complete checked every accepted command"),
            }
        }
    }

    Ok(PushReport { unpack_ok, results })
}

/// Decide locally whether an update can be sent at all.
fn validate_update<H: History>(
    history: &H,
    server: &Capabilities,
    update: &RefUpdate,
    old: ObjectId,
) -> std::result::Result<CommandUpdate, String> {
    if update.new.is_null() {
        if old.is_null() {
            return Err("remote ref does not exist".into());
        }
        if !server.contains(name::DELETE_REFS) {
            return Err("remote does not support deleting refs".into());
        }
        return Ok(CommandUpdate::Delete {
            old,
            name: update.name.clone(),
        });
    }
    if old == update.new {
        return Err("remote ref is already up to date".into());
    }
    if !update.force && !old.is_null() && !is_ancestor(history, old, update.new) {
        return Err("non-fast-forward".into());
    }
    CommandUpdate::from_triple(old, update.new, update.name.clone())
        .map_err(|err| err.to_string())
}

fn select_capabilities(options: &PushOptions, server: &Capabilities) -> Capabilities {
    let mut caps = Capabilities::default();
    if server.contains(name::REPORT_STATUS) {
        caps.push(name::REPORT_STATUS);
    }
    if server.contains(name::DELETE_REFS) {
        caps.push(name::DELETE_REFS);
    }
    if server.contains(name::OFS_DELTA) {
        caps.push(name::OFS_DELTA);
    }
    if options.atomic && server.contains(name::ATOMIC) {
        caps.push(name::ATOMIC);
    }
    if server.side_band().is_large() {
        caps.push(name::SIDE_BAND_64K);
    }
    caps.push(format!("agent={}", options.agent));
    caps
}
