//! A `Write` implementation framing everything it is given as packet lines.

use crate::{encode, MAX_DATA_LEN};
use std::io;

/// A writer that frames each `write()` call as one or more packet lines.
///
/// In text mode a trailing newline is added to each line if missing; in
/// binary mode bytes pass through unchanged. Payloads larger than a single
/// line are split.
pub struct Writer<W> {
    inner: W,
    binary: bool,
}

impl<W: io::Write> Writer<W> {
    /// Create a writer in binary mode.
    pub fn new(inner: W) -> Self {
        Self { inner, binary: true }
    }

    /// Turn on text mode, appending a newline to each line if missing.
    pub fn enable_text_mode(&mut self) {
        self.binary = false;
    }

    /// Turn on binary mode, passing payload bytes through unchanged.
    pub fn enable_binary_mode(&mut self) {
        self.binary = true;
    }

    /// Access the underlying writer, bypassing the framing.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Return the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write a flush marker to the underlying stream.
    pub fn write_flush(&mut self) -> io::Result<()> {
        encode::flush_to_write(&mut self.inner).map(|_| ())
    }

    /// Write a delimiter marker to the underlying stream.
    pub fn write_delim(&mut self) -> io::Result<()> {
        encode::delim_to_write(&mut self.inner).map(|_| ())
    }

    /// Write a response-end marker to the underlying stream.
    pub fn write_response_end(&mut self) -> io::Result<()> {
        encode::response_end_to_write(&mut self.inner).map(|_| ())
    }
}

impl<W: io::Write> io::Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "empty packet lines are not permitted as '0004' is invalid",
            ));
        }
        for chunk in buf.chunks(MAX_DATA_LEN) {
            let result = if self.binary {
                encode::data_to_write(chunk, &mut self.inner)
            } else {
                encode::text_to_write(chunk, &mut self.inner)
            };
            result.map_err(|err| match err {
                encode::Error::Io(err) => err,
                other => io::Error::new(io::ErrorKind::Other, other.to_string()),
            })?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    #[test]
    fn binary_mode_frames_verbatim() {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out);
        writer.write_all(b"hello").unwrap();
        writer.write_flush().unwrap();
        assert_eq!(out, b"0009hello0000");
    }

    #[test]
    fn text_mode_terminates_lines() {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out);
        writer.enable_text_mode();
        writer.write_all(b"hello").unwrap();
        assert_eq!(out, b"000ahello\n");
    }

    #[test]
    fn long_payloads_are_split() {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out);
        let payload = vec![b'x'; MAX_DATA_LEN + 1];
        writer.write_all(&payload).unwrap();
        // one full line plus one line carrying the single remaining byte
        assert_eq!(out.len(), 4 + MAX_DATA_LEN + 4 + 1);
    }
}
