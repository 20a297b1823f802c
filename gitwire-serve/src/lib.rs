//! gitwire-serve: server-side session objects for the smart transport.
//!
//! [`upload::UploadSession`] and [`receive::ReceiveSession`] compose the
//! protocol state machines with server policy: ref visibility, update
//! policy, quota limits, hook callbacks and cancellation. Transports hand a
//! duplex byte stream per connection; everything here runs sequential and
//! blocking within that connection.

#![deny(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

use gitwire_protocol::Ref;

pub mod hooks;
pub mod interrupt;
pub mod policy;
pub mod receive;
pub mod upload;
pub mod visibility;

pub use interrupt::CancellationFlag;
pub use policy::PolicySet;
pub use visibility::{visible_refs, HiddenRefPredicate, RefRecord};

/// The kind of server-side service to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Upload-pack: fetch/clone.
    UploadPack,
    /// Receive-pack: push.
    ReceivePack,
}

/// A server request envelope: the context a transport hands over per
/// accepted connection, streams included.
pub struct ServerRequest<R, W> {
    /// Which service to invoke.
    pub kind: ServiceKind,
    /// Which protocol version was negotiated by the transport.
    pub version: gitwire_protocol::ProtocolVersion,
    /// Input stream.
    pub input: R,
    /// Output stream.
    pub output: W,
    /// Whether the transport is stateless (HTTP) vs stateful (SSH, daemon).
    pub stateless: bool,
    /// Optional trace identifier for correlation.
    pub trace_id: Option<String>,
    /// Cancellation flag shared with the connection's controller.
    pub cancellation: std::sync::Arc<CancellationFlag>,
}

/// Read access to the refs a repository would advertise, before visibility
/// filtering.
pub trait RefSource {
    /// All refs as they currently stand, in advertisement order.
    fn advertised_refs(&self) -> Vec<Ref>;

    /// The stored size of an object, for `object-info` queries.
    fn object_size(&self, id: &gitwire_hash::ObjectId) -> Option<u64> {
        let _ = id;
        None
    }
}

/// Stable high-level error classification for session failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Transport I/O failed; always fatal to the connection.
    Io,
    /// The peer violated the protocol.
    Protocol,
    /// The pack or an object in it is corrupt.
    Corruption,
    /// A configured resource ceiling was exceeded.
    Resource,
    /// A policy or hook refused the operation.
    Refused,
    /// The operation was cancelled.
    Cancelled,
    /// Anything else.
    Other,
}

/// The error type for server sessions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A protocol-layer failure, including peer violations.
    #[error(transparent)]
    Protocol(#[from] gitwire_protocol::Error),

    /// A pack-layer failure, including corruption and resource ceilings.
    #[error(transparent)]
    Pack(#[from] gitwire_pack::Error),

    /// A quota configured for this session was exceeded.
    #[error("quota exceeded: {what}")]
    QuotaExceeded {
        /// Which quota tripped.
        what: String,
    },

    /// A hook refused the push.
    #[error("hook {name} declined: {message}")]
    HookDeclined {
        /// Which hook.
        name: String,
        /// Its message, relayed to the client.
        message: String,
    },

    /// The session was cancelled via its [`CancellationFlag`].
    #[error("session cancelled")]
    Cancelled,

    /// Packet line encoding failed while writing a response.
    #[error(transparent)]
    Encode(#[from] gitwire_pktline::encode::Error),

    /// Packet line framing from the peer was corrupt.
    #[error(transparent)]
    Framing(#[from] gitwire_pktline::decode::Error),

    /// The underlying stream failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify for callers that dispatch on category.
    pub fn kind(&self) -> Kind {
        match self {
            Error::Protocol(gitwire_protocol::Error::Io(_)) => Kind::Io,
            Error::Protocol(gitwire_protocol::Error::Cancelled) => Kind::Cancelled,
            Error::Protocol(_) => Kind::Protocol,
            Error::Pack(err) if err.is_corruption() => Kind::Corruption,
            Error::Pack(gitwire_pack::Error::ObjectTooLarge { .. })
            | Error::Pack(gitwire_pack::Error::PackTooLarge { .. }) => Kind::Resource,
            Error::Pack(gitwire_pack::Error::Cancelled) => Kind::Cancelled,
            Error::Pack(_) => Kind::Other,
            Error::QuotaExceeded { .. } => Kind::Resource,
            Error::HookDeclined { .. } => Kind::Refused,
            Error::Cancelled => Kind::Cancelled,
            Error::Encode(_) | Error::Io(_) => Kind::Io,
            Error::Framing(_) => Kind::Protocol,
        }
    }
}
