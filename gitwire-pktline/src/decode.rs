//! Decode packet lines from a byte buffer.

use crate::{PacketLineRef, MAX_LINE_LEN, U16_HEX_BYTES};

/// The error returned when a packet line cannot be decoded.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The four length characters were not hexadecimal.
    #[error("invalid hex length prefix {prefix:?}")]
    HexDecode {
        /// The offending prefix characters.
        prefix: String,
    },
    /// The declared length was in the reserved corrupt range `(0, 4)`.
    ///
    /// `0001` and `0002` are markers; `0003` can never frame a payload.
    #[error("corrupt packet length {length}")]
    Corrupt {
        /// The declared length.
        length: usize,
    },
    /// The declared length exceeds what the protocol allows on one line.
    #[error("packet length {length} exceeds the line limit of {MAX_LINE_LEN}")]
    DataLengthLimitExceeded {
        /// The declared length.
        length: usize,
    },
    /// A section byte ceiling was configured and this line would cross it.
    ///
    /// Distinct from truncation so callers can report "command list too
    /// long" rather than a generic framing failure.
    #[error("packet line would exceed the remaining section budget of {budget} bytes")]
    ExceededSectionBudget {
        /// Bytes the section had left.
        budget: usize,
    },
}

/// Outcome of an incremental decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Stream<'a> {
    /// A complete line was decoded.
    Complete {
        /// The decoded line.
        line: PacketLineRef<'a>,
        /// The number of input bytes consumed.
        bytes_consumed: usize,
    },
    /// More input is needed.
    Incomplete {
        /// Lower bound of additional bytes required.
        bytes_needed: usize,
    },
}

/// Decode the hexadecimal length prefix.
pub fn hex_prefix(four_bytes: &[u8]) -> Result<usize, Error> {
    debug_assert_eq!(four_bytes.len(), U16_HEX_BYTES);
    let mut value = 0usize;
    for &byte in four_bytes {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => {
                return Err(Error::HexDecode {
                    prefix: String::from_utf8_lossy(four_bytes).into_owned(),
                })
            }
        };
        value = (value << 4) | usize::from(digit);
    }
    Ok(value)
}

/// Decode one packet line from the start of `data`.
pub fn streaming(data: &[u8]) -> Result<Stream<'_>, Error> {
    let data_len = data.len();
    if data_len < U16_HEX_BYTES {
        return Ok(Stream::Incomplete {
            bytes_needed: U16_HEX_BYTES - data_len,
        });
    }
    let wanted = hex_prefix(&data[..U16_HEX_BYTES])?;
    match wanted {
        0 => {
            return Ok(Stream::Complete {
                line: PacketLineRef::Flush,
                bytes_consumed: U16_HEX_BYTES,
            })
        }
        1 => {
            return Ok(Stream::Complete {
                line: PacketLineRef::Delimiter,
                bytes_consumed: U16_HEX_BYTES,
            })
        }
        2 => {
            return Ok(Stream::Complete {
                line: PacketLineRef::ResponseEnd,
                bytes_consumed: U16_HEX_BYTES,
            })
        }
        3 => return Err(Error::Corrupt { length: wanted }),
        _ => {}
    }
    if wanted > MAX_LINE_LEN {
        return Err(Error::DataLengthLimitExceeded { length: wanted });
    }
    if data_len < wanted {
        return Ok(Stream::Incomplete {
            bytes_needed: wanted - data_len,
        });
    }
    Ok(Stream::Complete {
        line: PacketLineRef::Data(&data[U16_HEX_BYTES..wanted]),
        bytes_consumed: wanted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip_with_encode() {
        let mut encoded = Vec::new();
        crate::encode::data_to_write(b"hello\n", &mut encoded).unwrap();
        match streaming(&encoded).unwrap() {
            Stream::Complete { line, bytes_consumed } => {
                assert_eq!(line.as_slice(), Some(&b"hello\n"[..]));
                assert_eq!(bytes_consumed, encoded.len());
            }
            Stream::Incomplete { .. } => panic!("fully buffered"),
        }
    }

    #[test]
    fn flush_is_the_only_end_of_stream_sentinel() {
        assert_eq!(
            streaming(b"0000").unwrap(),
            Stream::Complete {
                line: PacketLineRef::Flush,
                bytes_consumed: 4
            }
        );
        assert_eq!(
            streaming(b"0001").unwrap(),
            Stream::Complete {
                line: PacketLineRef::Delimiter,
                bytes_consumed: 4
            }
        );
        assert_eq!(
            streaming(b"0002").unwrap(),
            Stream::Complete {
                line: PacketLineRef::ResponseEnd,
                bytes_consumed: 4
            }
        );
    }

    #[test]
    fn reserved_length_three_is_corrupt() {
        assert_eq!(streaming(b"0003").unwrap_err(), Error::Corrupt { length: 3 });
    }

    #[test]
    fn non_hex_prefix_is_rejected() {
        assert!(matches!(
            streaming(b"zzzzargh").unwrap_err(),
            Error::HexDecode { .. }
        ));
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        assert!(matches!(
            streaming(b"ffff").unwrap_err(),
            Error::DataLengthLimitExceeded { length: 65535 }
        ));
    }

    #[test]
    fn short_input_asks_for_more() {
        assert_eq!(streaming(b"00").unwrap(), Stream::Incomplete { bytes_needed: 2 });
        assert_eq!(
            streaming(b"000ahel").unwrap(),
            Stream::Incomplete { bytes_needed: 3 }
        );
    }
}
