//! The client's negotiation walk: flagging commits, producing haves in
//! batches, and deciding when to give up.

use crate::history::History;
use gitwire_hash::ObjectId;
use std::collections::{HashMap, VecDeque};

/// Walk-scoped flag bits attached to commit-graph nodes.
///
/// The whole arena is discarded when the walk ends; flags are never reset
/// individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// Reachable from a local ref.
    pub const REACHABLE: Flags = Flags(1);
    /// Advertised by the remote.
    pub const ADVERTISED: Flags = Flags(1 << 1);
    /// Acknowledged by the remote as common.
    pub const COMMON: Flags = Flags(1 << 2);
    /// The remote told us it has this object.
    pub const PEER_HAS: Flags = Flags(1 << 3);
    /// We asked for this object.
    pub const WANT: Flags = Flags(1 << 4);
    /// Transitively satisfied by common ancestors.
    pub const SATISFIED: Flags = Flags(1 << 5);
    /// Already emitted as a have.
    pub const STATE: Flags = Flags(1 << 6);

    /// `true` if all bits of `other` are set.
    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

/// How many haves may go unacknowledged before negotiation is cut off.
pub const MAX_HAVES_WITHOUT_ACK: usize = 256;

/// Default absolute ceiling on haves per fetch.
pub const DEFAULT_MAX_HAVES: usize = 4096;

const INITIAL_BATCH: usize = 16;
const STATELESS_BATCH_CAP: usize = 1024;
const STATEFUL_INCREMENT: usize = 32;

/// Produces monotonically non-decreasing have batch sizes.
///
/// Stateless (HTTP) transports double each round to amortize round trips;
/// stateful transports grow by a fixed increment.
#[derive(Debug)]
pub struct HaveBatcher {
    stateless: bool,
    next: usize,
}

impl HaveBatcher {
    /// Create a batcher for the given transport style.
    pub fn new(stateless: bool) -> Self {
        Self {
            stateless,
            next: INITIAL_BATCH,
        }
    }

    /// The size of the next batch, growing the following one.
    pub fn next_size(&mut self) -> usize {
        let current = self.next;
        self.next = if self.stateless {
            (self.next * 2).min(STATELESS_BATCH_CAP)
        } else {
            self.next + STATEFUL_INCREMENT
        };
        current
    }
}

/// The walk over locally reachable commits that feeds the have lines.
///
/// Seeded from the local ref tips, traversed breadth-first so recent
/// commits are offered before deep history.
pub struct Negotiator<'a, H: History> {
    history: &'a H,
    flags: HashMap<ObjectId, Flags>,
    queue: VecDeque<ObjectId>,
    /// Haves sent since the last acknowledgement.
    unacked: usize,
    /// Total haves sent.
    pub sent: usize,
}

impl<'a, H: History> Negotiator<'a, H> {
    /// Seed the walk from local tips, flagging them `REACHABLE`.
    pub fn new(history: &'a H) -> Self {
        let mut negotiator = Self {
            history,
            flags: HashMap::new(),
            queue: VecDeque::new(),
            unacked: 0,
            sent: 0,
        };
        for tip in history.local_tips() {
            negotiator.flags_mut(tip).insert(Flags::REACHABLE);
            negotiator.queue.push_back(tip);
        }
        negotiator
    }

    fn flags_mut(&mut self, id: ObjectId) -> &mut Flags {
        self.flags.entry(id).or_default()
    }

    /// Flag a remote-advertised tip; advertised tips we already store are
    /// immediately common.
    pub fn mark_advertised(&mut self, id: ObjectId) {
        let local = self.history.contains(&id);
        let flags = self.flags_mut(id);
        flags.insert(Flags::ADVERTISED);
        if local {
            flags.insert(Flags::COMMON);
        }
    }

    /// Flag a wanted object.
    pub fn mark_want(&mut self, id: ObjectId) {
        self.flags_mut(id).insert(Flags::WANT);
    }

    /// Record an acknowledgement: the commit (and transitively its
    /// ancestry) is common.
    pub fn mark_common(&mut self, id: ObjectId) {
        self.flags_mut(id).insert(Flags::COMMON);
        self.unacked = 0;
    }

    /// Produce the next batch of haves, at most `size` ids.
    ///
    /// Commits already known common are skipped rather than offered.
    pub fn next_batch(&mut self, size: usize) -> Vec<ObjectId> {
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            let Some(id) = self.queue.pop_front() else { break };
            let flags = self.flags_mut(id);
            if flags.contains(Flags::STATE) {
                continue;
            }
            flags.insert(Flags::STATE);
            let is_common = flags.contains(Flags::COMMON);
            if let Some(parents) = self.history.parents(&id) {
                for parent in parents {
                    let parent_flags = self.flags_mut(parent);
                    if !parent_flags.contains(Flags::STATE) {
                        parent_flags.insert(Flags::REACHABLE);
                        self.queue.push_back(parent);
                    }
                }
            }
            if is_common {
                continue;
            }
            batch.push(id);
        }
        self.sent += batch.len();
        self.unacked += batch.len();
        batch
    }

    /// `true` once the walk has nothing further to offer.
    pub fn is_exhausted(&self) -> bool {
        self.queue.is_empty()
    }

    /// `true` once continuing to send haves cannot improve the result:
    /// the walk is exhausted, too many haves went unacknowledged, or the
    /// absolute ceiling was reached.
    pub fn ok_to_give_up(&self, max_haves: usize) -> bool {
        self.is_exhausted() || self.unacked >= MAX_HAVES_WITHOUT_ACK || self.sent >= max_haves
    }

    /// Read a commit's flags, if the walk touched it.
    pub fn flags_of(&self, id: &ObjectId) -> Option<Flags> {
        self.flags.get(id).copied()
    }
}
