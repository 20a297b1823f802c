//! A lazy, peekable packet line reader.

use crate::{decode, PacketLineRef, U16_HEX_BYTES};
use std::io;

/// Read packet lines from a `BufRead`, one at a time, stopping at a
/// configured set of delimiter lines.
///
/// Iteration is lazy: a line is read only when asked for, and once a
/// delimiter (by default the flush marker) is reached, `read_line()` keeps
/// returning `None` until [`reset()`](Self::reset) explicitly re-arms the
/// reader for the next section. Peeking never consumes.
pub struct StreamingPeekableIter<R> {
    read: R,
    buf: Vec<u8>,
    peeked: Option<LineKind>,
    delimiters: &'static [PacketLineRef<'static>],
    fail_on_err_lines: bool,
    is_done: bool,
    stopped_at: Option<PacketLineRef<'static>>,
    section_budget: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
enum LineKind {
    Data(usize),
    Flush,
    Delimiter,
    ResponseEnd,
}

impl<R: io::BufRead> StreamingPeekableIter<R> {
    /// Create a reader stopping at any line in `delimiters`.
    pub fn new(read: R, delimiters: &'static [PacketLineRef<'static>]) -> Self {
        Self {
            read,
            buf: Vec::with_capacity(crate::MAX_LINE_LEN),
            peeked: None,
            delimiters,
            fail_on_err_lines: false,
            is_done: false,
            stopped_at: None,
            section_budget: None,
        }
    }

    /// Convert `ERR <message>` lines into I/O errors instead of data lines.
    pub fn fail_on_err_lines(&mut self, enabled: bool) {
        self.fail_on_err_lines = enabled;
    }

    /// Bound the bytes (prefix included) this section may occupy.
    ///
    /// Exceeding the ceiling fails with
    /// [`decode::Error::ExceededSectionBudget`] rather than a generic
    /// truncation, so callers can distinguish an oversized command list from
    /// a cut connection.
    pub fn set_section_budget(&mut self, budget: Option<usize>) {
        self.section_budget = budget;
    }

    /// The delimiter that stopped iteration, if any.
    pub fn stopped_at(&self) -> Option<PacketLineRef<'static>> {
        self.stopped_at
    }

    /// Re-arm after a delimiter stopped iteration, keeping the delimiter set.
    pub fn reset(&mut self) {
        self.is_done = false;
        self.stopped_at = None;
    }

    /// Re-arm with a different delimiter set.
    pub fn reset_with(&mut self, delimiters: &'static [PacketLineRef<'static>]) {
        self.delimiters = delimiters;
        self.reset();
    }

    /// The underlying reader, for handing the remaining bytes to another
    /// consumer (e.g. a pack parser).
    pub fn into_inner(self) -> R {
        self.read
    }

    /// Mutable access to the underlying reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.read
    }

    /// Read the next line, or `None` on a delimiter or clean end of stream.
    #[allow(clippy::type_complexity)]
    pub fn read_line(&mut self) -> Option<io::Result<Result<PacketLineRef<'_>, decode::Error>>> {
        if self.is_done {
            return None;
        }
        if let Some(kind) = self.peeked.take() {
            return Some(Ok(Ok(self.line_from_kind(kind))));
        }
        match self.next_kind() {
            Ok(None) => None,
            Ok(Some(kind)) => {
                if self.stop_at_delimiter(kind) {
                    return None;
                }
                if let Err(err) = self.check_err_line(kind) {
                    return Some(Err(err));
                }
                Some(Ok(Ok(self.line_from_kind(kind))))
            }
            Err(ReadError::Io(err)) => Some(Err(err)),
            Err(ReadError::Decode(err)) => Some(Ok(Err(err))),
        }
    }

    /// Look at the next line without consuming it.
    ///
    /// A subsequent [`read_line()`](Self::read_line) returns the same line.
    #[allow(clippy::type_complexity)]
    pub fn peek_line(&mut self) -> Option<io::Result<Result<PacketLineRef<'_>, decode::Error>>> {
        if self.is_done {
            return None;
        }
        if self.peeked.is_none() {
            match self.next_kind() {
                Ok(None) => return None,
                Ok(Some(kind)) => {
                    if self.stop_at_delimiter(kind) {
                        return None;
                    }
                    if let Err(err) = self.check_err_line(kind) {
                        return Some(Err(err));
                    }
                    self.peeked = Some(kind);
                }
                Err(ReadError::Io(err)) => return Some(Err(err)),
                Err(ReadError::Decode(err)) => return Some(Ok(Err(err))),
            }
        }
        let kind = self.peeked.expect("just set");
        Some(Ok(Ok(self.line_from_kind(kind))))
    }

    fn line_from_kind(&self, kind: LineKind) -> PacketLineRef<'_> {
        match kind {
            LineKind::Data(len) => PacketLineRef::Data(&self.buf[..len]),
            LineKind::Flush => PacketLineRef::Flush,
            LineKind::Delimiter => PacketLineRef::Delimiter,
            LineKind::ResponseEnd => PacketLineRef::ResponseEnd,
        }
    }

    fn stop_at_delimiter(&mut self, kind: LineKind) -> bool {
        let as_static = match kind {
            LineKind::Flush => PacketLineRef::Flush,
            LineKind::Delimiter => PacketLineRef::Delimiter,
            LineKind::ResponseEnd => PacketLineRef::ResponseEnd,
            LineKind::Data(_) => return false,
        };
        if self.delimiters.contains(&as_static) {
            self.is_done = true;
            self.stopped_at = Some(as_static);
            true
        } else {
            false
        }
    }

    fn check_err_line(&self, kind: LineKind) -> io::Result<()> {
        if !self.fail_on_err_lines {
            return Ok(());
        }
        if let LineKind::Data(len) = kind {
            if let Some(message) = PacketLineRef::Data(&self.buf[..len]).check_error() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    String::from_utf8_lossy(message).into_owned(),
                ));
            }
        }
        Ok(())
    }

    fn next_kind(&mut self) -> Result<Option<LineKind>, ReadError> {
        let mut prefix = [0u8; U16_HEX_BYTES];
        if !read_exact_or_eof(&mut self.read, &mut prefix)? {
            return Ok(None);
        }
        let wanted = decode::hex_prefix(&prefix)?;
        let kind = match wanted {
            0 => LineKind::Flush,
            1 => LineKind::Delimiter,
            2 => LineKind::ResponseEnd,
            3 => return Err(decode::Error::Corrupt { length: wanted }.into()),
            _ if wanted > crate::MAX_LINE_LEN => {
                return Err(decode::Error::DataLengthLimitExceeded { length: wanted }.into())
            }
            _ => {
                self.charge_budget(wanted)?;
                let payload_len = wanted - U16_HEX_BYTES;
                self.buf.resize(payload_len, 0);
                self.read
                    .read_exact(&mut self.buf[..payload_len])
                    .map_err(ReadError::Io)?;
                return Ok(Some(LineKind::Data(payload_len)));
            }
        };
        self.charge_budget(U16_HEX_BYTES)?;
        Ok(Some(kind))
    }

    fn charge_budget(&mut self, line_len: usize) -> Result<(), ReadError> {
        if let Some(budget) = self.section_budget.as_mut() {
            if line_len > *budget {
                return Err(decode::Error::ExceededSectionBudget { budget: *budget }.into());
            }
            *budget -= line_len;
        }
        Ok(())
    }
}

enum ReadError {
    Io(io::Error),
    Decode(decode::Error),
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        ReadError::Io(err)
    }
}

impl From<decode::Error> for ReadError {
    fn from(err: decode::Error) -> Self {
        ReadError::Decode(err)
    }
}

/// `false` on a clean end of stream before the first byte, an error if the
/// stream ends mid-header.
fn read_exact_or_eof(read: &mut impl io::Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match read.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a packet line header",
                ));
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(input: &[u8]) -> StreamingPeekableIter<&[u8]> {
        StreamingPeekableIter::new(input, &[PacketLineRef::Flush])
    }

    #[test]
    fn stops_exactly_at_flush_and_is_not_restartable() {
        let mut iter = lines(b"0009want\n0000000aafter\n");
        let line = iter.read_line().unwrap().unwrap().unwrap();
        assert_eq!(line.as_slice(), Some(&b"want\n"[..]));
        assert!(iter.read_line().is_none());
        assert_eq!(iter.stopped_at(), Some(PacketLineRef::Flush));
        // still stopped without an explicit reset
        assert!(iter.read_line().is_none());

        iter.reset();
        let line = iter.read_line().unwrap().unwrap().unwrap();
        assert_eq!(line.as_slice(), Some(&b"after\n"[..]));
    }

    #[test]
    fn peek_does_not_consume() {
        let mut iter = lines(b"0009want\n0000");
        let peeked = iter.peek_line().unwrap().unwrap().unwrap();
        assert_eq!(peeked.as_slice(), Some(&b"want\n"[..]));
        let line = iter.read_line().unwrap().unwrap().unwrap();
        assert_eq!(line.as_slice(), Some(&b"want\n"[..]));
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut iter = lines(b"");
        assert!(iter.read_line().is_none());
    }

    #[test]
    fn truncated_header_is_io_error() {
        let mut iter = lines(b"00");
        let err = iter.read_line().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn corrupt_length_is_decode_error() {
        let mut iter = lines(b"0003");
        let err = iter.read_line().unwrap().unwrap().unwrap_err();
        assert_eq!(err, decode::Error::Corrupt { length: 3 });
    }

    #[test]
    fn section_budget_is_distinct_from_truncation() {
        let mut iter = lines(b"0009want\n0009want\n0000");
        iter.set_section_budget(Some(12));
        assert!(iter.read_line().unwrap().unwrap().is_ok());
        let err = iter.read_line().unwrap().unwrap().unwrap_err();
        assert_eq!(err, decode::Error::ExceededSectionBudget { budget: 3 });
    }

    #[test]
    fn err_lines_become_errors_when_enabled() {
        let mut iter = lines(b"0015ERR access denied0000");
        iter.fail_on_err_lines(true);
        let err = iter.read_line().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "access denied");
    }

    #[test]
    fn delimiter_set_controls_stopping() {
        let mut iter = StreamingPeekableIter::new(&b"00010009want\n"[..], &[PacketLineRef::Delimiter]);
        assert!(iter.read_line().is_none());
        assert_eq!(iter.stopped_at(), Some(PacketLineRef::Delimiter));
        iter.reset_with(&[PacketLineRef::Flush]);
        let line = iter.read_line().unwrap().unwrap().unwrap();
        assert_eq!(line.as_slice(), Some(&b"want\n"[..]));
    }
}
