use gitwire_pktline::{decode, encode, PacketLineRef, StreamingPeekableIter, Writer};
use std::io::Write as _;

#[test]
fn advertisement_trailer_bytes() {
    let mut out = Vec::new();
    let mut writer = Writer::new(&mut out);
    writer.write_delim().unwrap();
    writer.write_flush().unwrap();
    assert_eq!(&out, b"00010000");
}

#[test]
fn encode_decode_round_trip_preserves_bytes() {
    let payloads: [&[u8]; 4] = [b"a", b"want e2\n", &[0u8, 1, 2, 255], &[b'x'; 4096]];
    for payload in payloads {
        let mut wire = Vec::new();
        encode::data_to_write(payload, &mut wire).unwrap();
        match decode::streaming(&wire).unwrap() {
            decode::Stream::Complete { line, bytes_consumed } => {
                assert_eq!(line.as_slice(), Some(payload));
                assert_eq!(bytes_consumed, wire.len());
            }
            decode::Stream::Incomplete { .. } => panic!("fully buffered input"),
        }
    }
}

#[test]
fn writer_and_iter_cooperate_over_a_session_shaped_stream() {
    let mut wire = Vec::new();
    let mut writer = Writer::new(&mut wire);
    writer.enable_text_mode();
    writer.write_all(b"command=ls-refs").unwrap();
    writer.write_delim().unwrap();
    writer.write_all(b"peel").unwrap();
    writer.write_all(b"ref-prefix refs/heads/").unwrap();
    writer.write_flush().unwrap();

    let mut iter = StreamingPeekableIter::new(wire.as_slice(), &[PacketLineRef::Delimiter]);
    let line = iter.read_line().unwrap().unwrap().unwrap();
    assert_eq!(line.as_text(), Some(&b"command=ls-refs"[..]));
    assert!(iter.read_line().is_none(), "stops at the delimiter");
    assert_eq!(iter.stopped_at(), Some(PacketLineRef::Delimiter));

    iter.reset_with(&[PacketLineRef::Flush]);
    let line = iter.read_line().unwrap().unwrap().unwrap();
    assert_eq!(line.as_text(), Some(&b"peel"[..]));
    let line = iter.read_line().unwrap().unwrap().unwrap();
    assert_eq!(line.as_text(), Some(&b"ref-prefix refs/heads/"[..]));
    assert!(iter.read_line().is_none());
}

#[test]
fn err_lines_are_detectable_without_fail_fast() {
    let mut wire = Vec::new();
    encode::error_to_write(b"repository not found", &mut wire).unwrap();
    let mut iter = StreamingPeekableIter::new(wire.as_slice(), &[PacketLineRef::Flush]);
    let line = iter.read_line().unwrap().unwrap().unwrap();
    assert_eq!(line.check_error(), Some(&b"repository not found"[..]));
}
