//! gitwire-pktline: the length-prefixed line framing used by all Git network
//! protocol messages, plus the side-band multiplexer layered on top of it.
//!
//! A packet line is `printf("%04x", len + 4)` followed by `len` payload
//! bytes. A length field of `0000` is the reserved *flush* (end-of-section)
//! marker, `0001` the *delimiter* marker and `0002` the *response-end*
//! marker; none of them carry payload.
#![deny(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

/// The largest amount of bytes a single packet line may occupy on the wire,
/// length prefix included.
pub const MAX_LINE_LEN: usize = 65520;

/// The largest payload a single (non-band) data line can carry.
pub const MAX_DATA_LEN: usize = MAX_LINE_LEN - U16_HEX_BYTES;

/// The size of the hexadecimal length prefix.
pub const U16_HEX_BYTES: usize = 4;

/// The packet ceiling before `side-band-64k` is negotiated.
pub const SMALL_PACKET_MAX: usize = 1000;

/// A single parsed packet line, borrowing its payload from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLineRef<'a> {
    /// A line carrying payload bytes.
    Data(&'a [u8]),
    /// The `0000` end-of-section marker.
    Flush,
    /// The `0001` marker separating sections of a single request.
    Delimiter,
    /// The `0002` marker ending a stateless-rpc response.
    ResponseEnd,
}

impl<'a> PacketLineRef<'a> {
    /// The payload if this is a data line, `None` for the special markers.
    pub fn as_slice(&self) -> Option<&'a [u8]> {
        match self {
            PacketLineRef::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Like [`Self::as_slice()`], but strips a single trailing newline.
    pub fn as_text(&self) -> Option<&'a [u8]> {
        self.as_slice()
            .map(|d| d.strip_suffix(b"\n").unwrap_or(d))
    }

    /// Interpret the payload as an `ERR <message>` line if it is one.
    pub fn check_error(&self) -> Option<&'a [u8]> {
        self.as_text().and_then(|d| d.strip_prefix(b"ERR "))
    }
}

/// The three side-band channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Pack data.
    Data = 1,
    /// Human-readable progress text.
    Progress = 2,
    /// Fatal error text; terminates the transfer.
    Error = 3,
}

impl Channel {
    /// Decode a channel from its on-wire tag byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Channel::Data),
            2 => Some(Channel::Progress),
            3 => Some(Channel::Error),
            _ => None,
        }
    }
}

pub mod decode;
pub mod encode;

mod read;
pub use read::StreamingPeekableIter;

mod write;
pub use write::Writer;

pub mod sideband;
pub use sideband::{BandWriter, ReadWithSidebands};
