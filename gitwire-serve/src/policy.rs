//! Policy configuration and evaluation for ref update commands.

use gitwire_protocol::history::{is_ancestor, History};
use gitwire_protocol::push::CommandUpdate;

/// Why a command was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    /// Creation of new refs is disabled.
    DenyCreates,
    /// Deletion of refs is disabled.
    DenyDeletes,
    /// The update is not a fast-forward.
    NonFastForward,
    /// The pre-image does not match the current ref value.
    StaleInfo,
}

impl ReasonCode {
    /// The reason string reported to the client on an `ng` line.
    pub fn as_report(&self) -> &'static str {
        match self {
            ReasonCode::DenyCreates => "creation prohibited",
            ReasonCode::DenyDeletes => "deletion prohibited",
            ReasonCode::NonFastForward => "non-fast-forward",
            ReasonCode::StaleInfo => "stale info",
        }
    }
}

/// Policy switches evaluated per command, in precedence order: creates,
/// deletes, then fast-forward-ness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    deny_creates: bool,
    deny_deletes: bool,
    deny_non_fast_forwards: bool,
}

impl PolicySet {
    /// Permissive defaults: everything allowed.
    pub fn new() -> Self {
        Self {
            deny_creates: false,
            deny_deletes: false,
            deny_non_fast_forwards: false,
        }
    }

    /// Forbid creating new refs.
    pub fn with_deny_creates(mut self, deny: bool) -> Self {
        self.deny_creates = deny;
        self
    }

    /// Forbid deleting refs.
    pub fn with_deny_deletes(mut self, deny: bool) -> Self {
        self.deny_deletes = deny;
        self
    }

    /// Forbid non-fast-forward updates.
    pub fn with_deny_non_fast_forwards(mut self, deny: bool) -> Self {
        self.deny_non_fast_forwards = deny;
        self
    }

    /// `true` if deletions are denied.
    pub fn deny_deletes(&self) -> bool {
        self.deny_deletes
    }

    /// Evaluate one command against this policy and the local graph.
    ///
    /// `Ok(())` allows the command; `Err` carries the reason reported to
    /// the client.
    pub fn evaluate<H: History + ?Sized>(
        &self,
        command: &CommandUpdate,
        history: &H,
    ) -> Result<(), ReasonCode> {
        match command {
            CommandUpdate::Create { .. } if self.deny_creates => Err(ReasonCode::DenyCreates),
            CommandUpdate::Delete { .. } if self.deny_deletes => Err(ReasonCode::DenyDeletes),
            CommandUpdate::Update { old, new, .. } if self.deny_non_fast_forwards => {
                if is_ancestor(history, *old, *new) {
                    Ok(())
                } else {
                    Err(ReasonCode::NonFastForward)
                }
            }
            _ => Ok(()),
        }
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::new()
    }
}
