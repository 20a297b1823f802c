//! Server responses during fetch negotiation: acknowledgements and shallow
//! updates.

use crate::error::{Error, Result};
use gitwire_hash::ObjectId;

/// One acknowledgement line from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// `ACK <id>`: the final acknowledgement before the pack.
    Final(ObjectId),
    /// `ACK <id> common`: the object is common, keep negotiating.
    Common(ObjectId),
    /// `ACK <id> continue`: multi-ack wants more haves.
    Continue(ObjectId),
    /// `ACK <id> ready`: the server can produce a pack without further
    /// rounds.
    Ready(ObjectId),
    /// `NAK`: nothing acknowledged this round.
    Nak,
}

impl Acknowledgement {
    /// The acknowledged id, absent for NAK.
    pub fn id(&self) -> Option<ObjectId> {
        match self {
            Acknowledgement::Final(id)
            | Acknowledgement::Common(id)
            | Acknowledgement::Continue(id)
            | Acknowledgement::Ready(id) => Some(*id),
            Acknowledgement::Nak => None,
        }
    }

    /// `true` for the ready signal.
    pub fn is_ready(&self) -> bool {
        matches!(self, Acknowledgement::Ready(_))
    }

    /// Parse one `ACK`/`NAK` line (without trailing newline).
    pub fn parse(line: &[u8]) -> Result<Self> {
        if line == b"NAK" {
            return Ok(Acknowledgement::Nak);
        }
        let rest = line
            .strip_prefix(b"ACK ")
            .ok_or_else(|| Error::protocol("expected ACK or NAK", line))?;
        let (hex, status) = match rest.iter().position(|&b| b == b' ') {
            Some(space) => (&rest[..space], &rest[space + 1..]),
            None => (rest, &b""[..]),
        };
        let id =
            ObjectId::from_hex(hex).map_err(|_| Error::protocol("invalid id in ACK", line))?;
        match status {
            b"" => Ok(Acknowledgement::Final(id)),
            b"common" => Ok(Acknowledgement::Common(id)),
            b"continue" => Ok(Acknowledgement::Continue(id)),
            b"ready" => Ok(Acknowledgement::Ready(id)),
            _ => Err(Error::protocol("unrecognized ACK status", line)),
        }
    }

    /// Render as the wire line, newline included.
    pub fn to_line(&self) -> String {
        match self {
            Acknowledgement::Final(id) => format!("ACK {id}\n"),
            Acknowledgement::Common(id) => format!("ACK {id} common\n"),
            Acknowledgement::Continue(id) => format!("ACK {id} continue\n"),
            Acknowledgement::Ready(id) => format!("ACK {id} ready\n"),
            Acknowledgement::Nak => "NAK\n".into(),
        }
    }
}

/// A shallow boundary update sent alongside negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShallowUpdate {
    /// The commit became a shallow boundary.
    Shallow(ObjectId),
    /// The commit is no longer a boundary.
    Unshallow(ObjectId),
}

impl ShallowUpdate {
    /// Parse a `shallow <id>` or `unshallow <id>` line, or `None` if the
    /// line is something else.
    pub fn parse(line: &[u8]) -> Option<Result<Self>> {
        let (constructor, hex): (fn(ObjectId) -> Self, &[u8]) =
            if let Some(rest) = line.strip_prefix(b"shallow ") {
                (ShallowUpdate::Shallow, rest)
            } else if let Some(rest) = line.strip_prefix(b"unshallow ") {
                (ShallowUpdate::Unshallow, rest)
            } else {
                return None;
            };
        Some(
            ObjectId::from_hex(hex)
                .map(constructor)
                .map_err(|_| Error::protocol("invalid id in shallow line", line)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn oid(hex: &str) -> ObjectId {
        ObjectId::from_hex(hex.as_bytes()).unwrap()
    }

    #[test]
    fn ack_parse_round_trip() {
        let id = oid("1111111111111111111111111111111111111111");
        for ack in [
            Acknowledgement::Final(id),
            Acknowledgement::Common(id),
            Acknowledgement::Continue(id),
            Acknowledgement::Ready(id),
            Acknowledgement::Nak,
        ] {
            let line = ack.to_line();
            let parsed = Acknowledgement::parse(line.trim_end().as_bytes()).unwrap();
            assert_eq!(parsed, ack);
        }
    }

    #[test]
    fn unknown_status_names_the_line() {
        let err = Acknowledgement::parse(
            b"ACK 1111111111111111111111111111111111111111 wat",
        )
        .unwrap_err();
        assert!(err.to_string().contains("wat"));
    }

    #[test]
    fn shallow_lines() {
        let update = ShallowUpdate::parse(b"shallow 1111111111111111111111111111111111111111")
            .unwrap()
            .unwrap();
        assert_eq!(
            update,
            ShallowUpdate::Shallow(oid("1111111111111111111111111111111111111111"))
        );
        assert!(ShallowUpdate::parse(b"have whatever").is_none());
    }
}
