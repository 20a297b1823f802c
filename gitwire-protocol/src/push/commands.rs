//! The push command list: `<old> <new> <refname>` records with capabilities
//! on the first line, as read by the receiving side.

use crate::capability::Capabilities;
use crate::error::{Error, Result};
use bstr::{BStr, BString, ByteSlice};
use gitwire_hash::ObjectId;
use gitwire_pktline::StreamingPeekableIter;
use std::io;

/// A single ref update command as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandUpdate {
    /// Create a new reference pointing at `new`.
    Create {
        /// The object the new ref points to.
        new: ObjectId,
        /// The full ref name.
        name: BString,
    },
    /// Move an existing reference from `old` to `new`.
    Update {
        /// The expected current value.
        old: ObjectId,
        /// The new value.
        new: ObjectId,
        /// The full ref name.
        name: BString,
    },
    /// Delete an existing reference currently at `old`.
    Delete {
        /// The expected current value.
        old: ObjectId,
        /// The full ref name.
        name: BString,
    },
}

impl CommandUpdate {
    /// The refname targeted by this command.
    pub fn name(&self) -> &BStr {
        match self {
            CommandUpdate::Create { name, .. }
            | CommandUpdate::Update { name, .. }
            | CommandUpdate::Delete { name, .. } => name.as_bstr(),
        }
    }

    /// The pre-image id, null for creates.
    pub fn old_id(&self) -> ObjectId {
        match self {
            CommandUpdate::Create { .. } => ObjectId::null(),
            CommandUpdate::Update { old, .. } | CommandUpdate::Delete { old, .. } => *old,
        }
    }

    /// The post-image id, null for deletes.
    pub fn new_id(&self) -> ObjectId {
        match self {
            CommandUpdate::Delete { .. } => ObjectId::null(),
            CommandUpdate::Update { new, .. } | CommandUpdate::Create { new, .. } => *new,
        }
    }

    /// `true` for deletions.
    pub fn is_delete(&self) -> bool {
        matches!(self, CommandUpdate::Delete { .. })
    }

    /// Classify an `(old, new, name)` triple, rejecting the all-zero pair.
    pub fn from_triple(old: ObjectId, new: ObjectId, name: BString) -> Result<Self> {
        match (old.is_null(), new.is_null()) {
            (true, true) => Err(Error::protocol("both old and new are the null id", &name)),
            (true, false) => Ok(CommandUpdate::Create { new, name }),
            (false, true) => Ok(CommandUpdate::Delete { old, name }),
            (false, false) => Ok(CommandUpdate::Update { old, new, name }),
        }
    }
}

/// The parsed command section of a push.
#[derive(Debug, Clone, Default)]
pub struct CommandList {
    /// The update commands in wire order.
    pub commands: Vec<CommandUpdate>,
    /// Capabilities from the first command line.
    pub capabilities: Capabilities,
    /// `shallow <oid>` lines interleaved with the commands.
    pub shallow: Vec<ObjectId>,
    /// `push-option=<value>` lines.
    pub push_options: Vec<BString>,
}

impl CommandList {
    /// `true` if no commands were sent (an empty push).
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// `true` if a pack must follow: at least one non-delete command.
    pub fn expects_pack(&self) -> bool {
        self.commands.iter().any(|c| !c.is_delete())
    }

    /// Parse the flush-terminated command section of a push.
    ///
    /// Capabilities ride the first command line after a NUL; `shallow` and
    /// `push-option=` lines are accepted where they occur.
    pub fn parse<R: io::BufRead>(lines: &mut StreamingPeekableIter<R>) -> Result<Self> {
        let mut list = CommandList::default();
        let mut first = true;
        while let Some(line) = lines.read_line() {
            let line = line??;
            let Some(data) = line.as_text() else { continue };
            if let Some(rest) = data.strip_prefix(b"shallow ") {
                let id = ObjectId::from_hex(rest)
                    .map_err(|_| Error::protocol("invalid shallow id", data))?;
                list.shallow.push(id);
                continue;
            }
            if let Some(value) = data.strip_prefix(b"push-option=") {
                list.push_options.push(BString::from(value));
                continue;
            }
            let (record, caps) = match data.find_byte(0) {
                Some(nul) => (&data[..nul], Some(&data[nul + 1..])),
                None => (data, None),
            };
            if first {
                if let Some(caps) = caps {
                    list.capabilities = Capabilities::from_bytes(caps);
                }
                first = false;
            }
            list.commands.push(parse_command(record, data)?);
        }
        Ok(list)
    }
}

fn parse_command(record: &[u8], line: &[u8]) -> Result<CommandUpdate> {
    let mut fields = record.splitn(3, |&b| b == b' ');
    let old = fields
        .next()
        .ok_or_else(|| Error::protocol("missing old id", line))?;
    let new = fields
        .next()
        .ok_or_else(|| Error::protocol("missing new id", line))?;
    let name = fields
        .next()
        .ok_or_else(|| Error::protocol("missing refname", line))?;
    if name.is_empty() || name.find_byte(b' ').is_some() {
        return Err(Error::protocol("malformed refname", line));
    }
    let old = ObjectId::from_hex(old).map_err(|_| Error::protocol("invalid old id", line))?;
    let new = ObjectId::from_hex(new).map_err(|_| Error::protocol("invalid new id", line))?;
    CommandUpdate::from_triple(old, new, BString::from(name))
}
