//! Capability tokens and the negotiated modes they select.
//!
//! Tokens travel space-separated after the NUL on the first advertised ref
//! line (v0) or as one line each in the capability block (v2). Unknown
//! tokens are ignored for forward compatibility, never rejected.

use bstr::{BStr, BString, ByteSlice};

/// Capability token names, as they appear on the wire.
pub mod name {
    /// Basic multi-ack negotiation.
    pub const MULTI_ACK: &str = "multi_ack";
    /// Detailed multi-ack negotiation.
    pub const MULTI_ACK_DETAILED: &str = "multi_ack_detailed";
    /// Permit packs whose delta bases live on the receiver.
    pub const THIN_PACK: &str = "thin-pack";
    /// 1000-byte side-band packets.
    pub const SIDE_BAND: &str = "side-band";
    /// 64k side-band packets.
    pub const SIDE_BAND_64K: &str = "side-band-64k";
    /// Offset-addressed deltas allowed.
    pub const OFS_DELTA: &str = "ofs-delta";
    /// Shallow clones supported.
    pub const SHALLOW: &str = "shallow";
    /// `deepen-since` supported.
    pub const DEEPEN_SINCE: &str = "deepen-since";
    /// `deepen-not` supported.
    pub const DEEPEN_NOT: &str = "deepen-not";
    /// Relative deepening supported.
    pub const DEEPEN_RELATIVE: &str = "deepen-relative";
    /// Suppress progress messages.
    pub const NO_PROGRESS: &str = "no-progress";
    /// Include annotated tags pointing into the pack.
    pub const INCLUDE_TAG: &str = "include-tag";
    /// Object filtering supported.
    pub const FILTER: &str = "filter";
    /// The client may omit the final `done` under multi-ack-detailed.
    pub const NO_DONE: &str = "no-done";
    /// Identify the implementation, `agent=<value>`.
    pub const AGENT: &str = "agent";
    /// Report-status after a push.
    pub const REPORT_STATUS: &str = "report-status";
    /// All-or-nothing ref updates.
    pub const ATOMIC: &str = "atomic";
    /// Ref deletions permitted.
    pub const DELETE_REFS: &str = "delete-refs";
    /// Quiet mode for receive-pack.
    pub const QUIET: &str = "quiet";
    /// Push options forwarded to hooks.
    pub const PUSH_OPTIONS: &str = "push-options";
    /// Want a tip that is not advertised.
    pub const ALLOW_TIP_SHA1_IN_WANT: &str = "allow-tip-sha1-in-want";
    /// Want anything reachable from an advertised tip.
    pub const ALLOW_REACHABLE_SHA1_IN_WANT: &str = "allow-reachable-sha1-in-want";
    /// Want any object at all.
    pub const ALLOW_ANY_SHA1_IN_WANT: &str = "allow-any-sha1-in-want";
    /// Symbolic ref hints, `symref=<from>:<to>`.
    pub const SYMREF: &str = "symref";
}

/// Acknowledgment modes controlling how much the server reveals per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiAckMode {
    /// One final ACK or NAK only.
    #[default]
    Off,
    /// `ACK <id> continue` while more haves are useful.
    Continue,
    /// `ACK <id> common|ready` with a distinguishable ready signal.
    Detailed,
}

/// Side-band variants by maximum packet size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideBandMode {
    /// No multiplexing.
    #[default]
    None,
    /// `side-band`: packets up to 1000 bytes.
    Basic,
    /// `side-band-64k`: packets up to 65520 bytes.
    SideBand64k,
}

impl SideBandMode {
    /// `true` if any side-band variant is active.
    pub fn is_active(&self) -> bool {
        !matches!(self, SideBandMode::None)
    }

    /// `true` for the 64k variant.
    pub fn is_large(&self) -> bool {
        matches!(self, SideBandMode::SideBand64k)
    }
}

/// A parsed set of capability tokens, preserving unknown ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    tokens: Vec<BString>,
}

impl Capabilities {
    /// Parse a space-separated capability string.
    pub fn from_bytes(input: &[u8]) -> Self {
        Self {
            tokens: input
                .split(|&b| b == b' ')
                .filter(|t| !t.is_empty())
                .map(BString::from)
                .collect(),
        }
    }

    /// Iterate over all tokens.
    pub fn iter(&self) -> impl Iterator<Item = &BStr> {
        self.tokens.iter().map(|t| t.as_bstr())
    }

    /// `true` if the bare token is present.
    pub fn contains(&self, name: &str) -> bool {
        self.tokens.iter().any(|t| t == name.as_bytes())
    }

    /// The value of the first `<name>=<value>` token, if any.
    pub fn value_of(&self, name: &str) -> Option<&BStr> {
        self.tokens.iter().find_map(|t| {
            t.strip_prefix(name.as_bytes())
                .and_then(|rest| rest.strip_prefix(b"="))
                .map(ByteSlice::as_bstr)
        })
    }

    /// All `symref=<from>:<to>` hints.
    pub fn symrefs(&self) -> Vec<(BString, BString)> {
        self.tokens
            .iter()
            .filter_map(|t| {
                let rest = t.strip_prefix(b"symref=")?;
                let colon = rest.find_byte(b':')?;
                Some((
                    BString::from(&rest[..colon]),
                    BString::from(&rest[colon + 1..]),
                ))
            })
            .collect()
    }

    /// The negotiated multi-ack mode.
    pub fn multi_ack(&self) -> MultiAckMode {
        if self.contains(name::MULTI_ACK_DETAILED) {
            MultiAckMode::Detailed
        } else if self.contains(name::MULTI_ACK) {
            MultiAckMode::Continue
        } else {
            MultiAckMode::Off
        }
    }

    /// The negotiated side-band mode, preferring the large variant.
    pub fn side_band(&self) -> SideBandMode {
        if self.contains(name::SIDE_BAND_64K) {
            SideBandMode::SideBand64k
        } else if self.contains(name::SIDE_BAND) {
            SideBandMode::Basic
        } else {
            SideBandMode::None
        }
    }

    /// The peer's agent string, if announced.
    pub fn agent(&self) -> Option<&BStr> {
        self.value_of(name::AGENT)
    }

    /// Add a token; used when building the set to send.
    pub fn push(&mut self, token: impl Into<BString>) {
        self.tokens.push(token.into());
    }

    /// Render as the space-separated wire form.
    pub fn to_wire(&self) -> BString {
        let mut out = BString::from(Vec::new());
        for (index, token) in self.tokens.iter().enumerate() {
            if index > 0 {
                out.push(b' ');
            }
            out.extend_from_slice(token);
        }
        out
    }

    /// `true` if no tokens are present.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
