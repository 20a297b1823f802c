//! Encode packet lines onto a `Write`.

use crate::{Channel, MAX_DATA_LEN, U16_HEX_BYTES};
use std::io;

/// The error returned when a payload cannot be framed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Payload larger than a single packet line can carry.
    #[error("data of {length} bytes exceeds the single-line limit of {MAX_DATA_LEN}")]
    DataLengthLimitExceeded {
        /// Size of the rejected payload.
        length: usize,
    },
    /// Zero-length payloads are reserved for the flush marker.
    #[error("empty lines are invalid")]
    DataIsEmpty,
    /// The underlying writer failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

const FLUSH_LINE: &[u8] = b"0000";
const DELIM_LINE: &[u8] = b"0001";
const RESPONSE_END_LINE: &[u8] = b"0002";

/// Write a flush (end-of-section) marker.
pub fn flush_to_write(out: &mut impl io::Write) -> io::Result<usize> {
    out.write_all(FLUSH_LINE).map(|()| U16_HEX_BYTES)
}

/// Write a delimiter marker.
pub fn delim_to_write(out: &mut impl io::Write) -> io::Result<usize> {
    out.write_all(DELIM_LINE).map(|()| U16_HEX_BYTES)
}

/// Write a response-end marker.
pub fn response_end_to_write(out: &mut impl io::Write) -> io::Result<usize> {
    out.write_all(RESPONSE_END_LINE).map(|()| U16_HEX_BYTES)
}

/// Write `data` as a single packet line.
pub fn data_to_write(data: &[u8], out: &mut impl io::Write) -> Result<usize, Error> {
    prefixed_data_to_write(None, data, out)
}

/// Write `text` as a packet line, appending a newline unless one is present.
pub fn text_to_write(text: &[u8], out: &mut impl io::Write) -> Result<usize, Error> {
    if text.ends_with(b"\n") {
        data_to_write(text, out)
    } else {
        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.extend_from_slice(text);
        buf.push(b'\n');
        data_to_write(&buf, out)
    }
}

/// Write an `ERR <message>` line, the protocol-level rejection a peer
/// surfaces verbatim.
pub fn error_to_write(message: &[u8], out: &mut impl io::Write) -> Result<usize, Error> {
    let mut buf = Vec::with_capacity(4 + message.len());
    buf.extend_from_slice(b"ERR ");
    buf.extend_from_slice(message);
    data_to_write(&buf, out)
}

/// Write `data` as a single packet line tagged with a side-band channel.
///
/// The channel byte counts towards the encoded length.
pub fn band_to_write(channel: Channel, data: &[u8], out: &mut impl io::Write) -> Result<usize, Error> {
    prefixed_data_to_write(Some(channel), data, out)
}

fn prefixed_data_to_write(
    channel: Option<Channel>,
    data: &[u8],
    out: &mut impl io::Write,
) -> Result<usize, Error> {
    if data.is_empty() {
        return Err(Error::DataIsEmpty);
    }
    let band_len = usize::from(channel.is_some());
    if data.len() + band_len > MAX_DATA_LEN {
        return Err(Error::DataLengthLimitExceeded {
            length: data.len() + band_len,
        });
    }
    let line_len = data.len() + band_len + U16_HEX_BYTES;
    let mut hex = [0u8; U16_HEX_BYTES];
    u16_to_hex(line_len as u16, &mut hex);
    out.write_all(&hex)?;
    if let Some(channel) = channel {
        out.write_all(&[channel as u8])?;
    }
    out.write_all(data)?;
    Ok(line_len)
}

pub(crate) fn u16_to_hex(value: u16, buf: &mut [u8; U16_HEX_BYTES]) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    buf[0] = HEX[usize::from(value >> 12) & 0xf];
    buf[1] = HEX[usize::from(value >> 8) & 0xf];
    buf[2] = HEX[usize::from(value >> 4) & 0xf];
    buf[3] = HEX[usize::from(value) & 0xf];
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn data_is_length_prefixed() {
        let mut out = Vec::new();
        let written = data_to_write(b"hello\n", &mut out).unwrap();
        assert_eq!(written, 10);
        assert_eq!(out, b"000ahello\n");
    }

    #[test]
    fn text_appends_missing_newline() {
        let mut out = Vec::new();
        text_to_write(b"hello", &mut out).unwrap();
        assert_eq!(out, b"000ahello\n");
    }

    #[test]
    fn special_markers() {
        let mut out = Vec::new();
        flush_to_write(&mut out).unwrap();
        delim_to_write(&mut out).unwrap();
        response_end_to_write(&mut out).unwrap();
        assert_eq!(out, b"000000010002");
    }

    #[test]
    fn band_tag_counts_towards_length() {
        let mut out = Vec::new();
        band_to_write(Channel::Progress, b"50%", &mut out).unwrap();
        assert_eq!(out, b"0008\x0250%");
    }

    #[test]
    fn empty_data_is_rejected() {
        let mut out = Vec::new();
        assert!(matches!(
            data_to_write(b"", &mut out).unwrap_err(),
            Error::DataIsEmpty
        ));
    }

    #[test]
    fn oversized_data_is_rejected() {
        let mut out = Vec::new();
        let big = vec![0u8; MAX_DATA_LEN + 1];
        assert!(matches!(
            data_to_write(&big, &mut out).unwrap_err(),
            Error::DataLengthLimitExceeded { .. }
        ));
    }
}
