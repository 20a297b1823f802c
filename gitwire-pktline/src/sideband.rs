//! Side-band multiplexing: interleave pack data, progress text and fatal
//! errors on one packet line stream.

use crate::{encode, Channel, PacketLineRef, StreamingPeekableIter, MAX_LINE_LEN, SMALL_PACKET_MAX};
use std::io;

/// The band tag byte plus the hex length prefix.
const BAND_OVERHEAD: usize = crate::U16_HEX_BYTES + 1;

/// A writer sending everything on one side-band channel.
///
/// Bytes are buffered up to the negotiated packet ceiling and flushed as
/// single tagged packets once full; call [`flush`](io::Write::flush) to force
/// out a partial buffer.
pub struct BandWriter<W> {
    inner: W,
    channel: Channel,
    buf: Vec<u8>,
    max_data: usize,
}

impl<W: io::Write> BandWriter<W> {
    /// Create a writer for `channel`, using the 64k packet ceiling if
    /// `large_packets` was negotiated (`side-band-64k`) and the 1000-byte
    /// ceiling otherwise (`side-band`).
    pub fn new(inner: W, channel: Channel, large_packets: bool) -> Self {
        let max_line = if large_packets { MAX_LINE_LEN } else { SMALL_PACKET_MAX };
        Self {
            inner,
            channel,
            buf: Vec::with_capacity(max_line - BAND_OVERHEAD),
            max_data: max_line - BAND_OVERHEAD,
        }
    }

    /// The channel this writer is bound to.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Access the underlying writer, e.g. to write a trailing flush.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    fn emit(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        encode::band_to_write(self.channel, &self.buf, &mut self.inner).map_err(into_io)?;
        self.buf.clear();
        Ok(())
    }
}

impl<W: io::Write> io::Write for BandWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let take = (self.max_data - self.buf.len()).min(remaining.len());
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buf.len() == self.max_data {
                self.emit()?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()?;
        self.inner.flush()
    }
}

fn into_io(err: encode::Error) -> io::Error {
    match err {
        encode::Error::Io(err) => err,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// A demultiplexing reader exposing only channel-1 (pack data) bytes.
///
/// Progress text (channel 2) is routed to the supplied sink; error text
/// (channel 3) terminates reading with a hard failure carrying the remote
/// message. Reading ends at the flush marker terminating the band stream.
pub struct ReadWithSidebands<'a, R, F> {
    inner: &'a mut StreamingPeekableIter<R>,
    progress: F,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a, R, F> ReadWithSidebands<'a, R, F>
where
    R: io::BufRead,
    F: FnMut(&[u8]),
{
    /// Create a demultiplexer over `inner`, sending progress lines to
    /// `progress`.
    pub fn new(inner: &'a mut StreamingPeekableIter<R>, progress: F) -> Self {
        Self {
            inner,
            progress,
            buf: Vec::new(),
            pos: 0,
        }
    }
}

impl<R, F> io::Read for ReadWithSidebands<'_, R, F>
where
    R: io::BufRead,
    F: FnMut(&[u8]),
{
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.buf.len() {
                let n = (self.buf.len() - self.pos).min(out.len());
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            let line = match self.inner.read_line() {
                None => return Ok(0),
                Some(line) => line?.map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?,
            };
            let data = match line {
                PacketLineRef::Data(data) => data,
                // markers inside a band stream are tolerated as no-ops
                _ => continue,
            };
            let Some((&tag, rest)) = data.split_first() else {
                continue;
            };
            match Channel::from_byte(tag) {
                Some(Channel::Data) => {
                    self.buf.clear();
                    self.buf.extend_from_slice(rest);
                    self.pos = 0;
                }
                Some(Channel::Progress) => (self.progress)(rest),
                Some(Channel::Error) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        String::from_utf8_lossy(rest).trim_end().to_owned(),
                    ))
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid side-band channel {tag}"),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{Read as _, Write as _};

    #[test]
    fn writer_buffers_until_the_packet_ceiling() {
        let mut out = Vec::new();
        let mut writer = BandWriter::new(&mut out, Channel::Data, false);
        writer.write_all(&[b'a'; 100]).unwrap();
        assert!(writer.inner_mut().is_empty(), "nothing emitted before the ceiling");
        drop(writer);

        let mut out = Vec::new();
        let mut writer = BandWriter::new(&mut out, Channel::Data, false);
        writer.write_all(&[b'a'; 995]).unwrap();
        writer.flush().unwrap();
        // exactly one full small packet: 4 length + 1 band + 995 payload
        assert_eq!(writer.inner_mut().len(), 1000);
    }

    #[test]
    fn writer_flushes_partial_buffers_on_demand() {
        let mut out = Vec::new();
        let mut writer = BandWriter::new(&mut out, Channel::Progress, true);
        writer.write_all(b"half done").unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.inner_mut().as_slice(), b"000e\x02half done");
    }

    #[test]
    fn demux_routes_progress_and_exposes_data() {
        let mut wire = Vec::new();
        encode::band_to_write(Channel::Data, b"PACKDATA", &mut wire).unwrap();
        encode::band_to_write(Channel::Progress, b"counting objects\n", &mut wire).unwrap();
        encode::band_to_write(Channel::Data, b"MORE", &mut wire).unwrap();
        encode::flush_to_write(&mut wire).unwrap();

        let mut iter = StreamingPeekableIter::new(wire.as_slice(), &[PacketLineRef::Flush]);
        let mut progress = Vec::new();
        let mut reader = ReadWithSidebands::new(&mut iter, |text| progress.push(text.to_vec()));
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"PACKDATAMORE");
        assert_eq!(progress, vec![b"counting objects\n".to_vec()]);
    }

    #[test]
    fn error_channel_is_a_hard_failure() {
        let mut wire = Vec::new();
        encode::band_to_write(Channel::Data, b"partial", &mut wire).unwrap();
        encode::band_to_write(Channel::Error, b"out of quota\n", &mut wire).unwrap();
        encode::flush_to_write(&mut wire).unwrap();

        let mut iter = StreamingPeekableIter::new(wire.as_slice(), &[PacketLineRef::Flush]);
        let mut reader = ReadWithSidebands::new(&mut iter, |_| {});
        let mut data = Vec::new();
        let err = reader.read_to_end(&mut data).unwrap_err();
        assert_eq!(err.to_string(), "out of quota");
        assert_eq!(data, b"partial");
    }
}
