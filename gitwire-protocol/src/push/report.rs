//! The report-status exchange ending a push: `unpack <status>` then one
//! `ok`/`ng` line per command.

use crate::error::{Error, Result};
use bstr::{BStr, BString, ByteSlice};
use gitwire_pktline::{encode, StreamingPeekableIter};
use std::io;

/// The outcome of one ref update as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefResult {
    /// `ok <ref>`: the update was applied.
    Ok,
    /// `ng <ref> <reason>`: the update was refused.
    Rejected(BString),
}

/// The parsed status report of a push.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// The `unpack <status>` line's status; `"ok"` on success.
    pub unpack: BString,
    /// Per-ref outcomes, in report order.
    pub statuses: Vec<(BString, RefResult)>,
}

impl Report {
    /// `true` if the pack was indexed successfully.
    pub fn unpack_ok(&self) -> bool {
        self.unpack == "ok"
    }

    /// The outcome for `refname`, if reported.
    pub fn status_of(&self, refname: &BStr) -> Option<&RefResult> {
        self.statuses
            .iter()
            .find_map(|(name, result)| (name == refname).then_some(result))
    }

    /// Parse a flush-terminated report.
    pub fn parse<R: io::BufRead>(lines: &mut StreamingPeekableIter<R>) -> Result<Self> {
        let mut report = Report::default();
        let mut saw_unpack = false;
        while let Some(line) = lines.read_line() {
            let line = line??;
            let Some(data) = line.as_text() else { continue };
            if let Some(status) = data.strip_prefix(b"unpack ") {
                if saw_unpack {
                    return Err(Error::protocol("second unpack line", data));
                }
                saw_unpack = true;
                report.unpack = BString::from(status);
            } else if let Some(refname) = data.strip_prefix(b"ok ") {
                report.statuses.push((BString::from(refname), RefResult::Ok));
            } else if let Some(rest) = data.strip_prefix(b"ng ") {
                let (refname, reason) = match rest.find_byte(b' ') {
                    Some(space) => (&rest[..space], &rest[space + 1..]),
                    None => (rest, &b"rejected"[..]),
                };
                report.statuses.push((
                    BString::from(refname),
                    RefResult::Rejected(BString::from(reason)),
                ));
            } else {
                return Err(Error::protocol("unexpected report-status line", data));
            }
        }
        if !saw_unpack {
            return Err(Error::protocol("report without an unpack line", b""));
        }
        Ok(report)
    }

    /// Fail with [`Error::MissingReport`] if any of `expected` was left
    /// unreported.
    pub fn ensure_complete<'a>(&self, expected: impl Iterator<Item = &'a BStr>) -> Result<()> {
        for refname in expected {
            if self.status_of(refname).is_none() {
                return Err(Error::MissingReport {
                    refname: refname.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Write this report as pkt-lines followed by a flush.
    pub fn write_to(&self, out: &mut impl io::Write) -> Result<()> {
        let mut line = BString::from("unpack ");
        line.extend_from_slice(&self.unpack);
        line.push(b'\n');
        encode::data_to_write(&line, out)?;
        for (refname, result) in &self.statuses {
            let mut line = BString::default();
            match result {
                RefResult::Ok => {
                    line.extend_from_slice(b"ok ");
                    line.extend_from_slice(refname);
                }
                RefResult::Rejected(reason) => {
                    line.extend_from_slice(b"ng ");
                    line.extend_from_slice(refname);
                    line.push(b' ');
                    line.extend_from_slice(reason);
                }
            }
            line.push(b'\n');
            encode::data_to_write(&line, out)?;
        }
        encode::flush_to_write(out)?;
        Ok(())
    }
}
