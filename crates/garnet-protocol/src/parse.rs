//! Incremental RESP2 parser.
//!
//! [`FrameParser`] owns an append-only byte buffer fed by the network
//! layer. `append` never fails and never blocks; `try_parse` returns the
//! next complete top-level frame and consumes its bytes, or `Ok(None)`
//! when the buffer holds only a partial frame. Arbitrary TCP
//! fragmentation is therefore invisible to callers: feeding one byte at
//! a time yields the same frames as a single-shot feed.
//!
//! The inner parse is a single pass over a `Cursor<&[u8]>` that builds
//! frames directly, bailing out with an `Incomplete` sentinel as soon as
//! the buffer runs short. On success the cursor position tells us how
//! many bytes the frame occupied, which both advances the buffer and
//! powers [`FrameParser::try_parse_with_raw`]: the exact wire bytes of a
//! frame are split off and handed back so the dispatcher can forward
//! commands to the AOF and to replicas without re-serializing.

use std::io::Cursor;

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::Frame;

/// Maximum nesting depth for arrays. Prevents stack overflow from
/// malicious or malformed deeply-nested frames.
const MAX_NESTING_DEPTH: usize = 64;

/// Maximum number of elements in an array. Prevents memory
/// amplification where tiny elements declare huge counts.
const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Maximum length of a bulk string in bytes (512 MB, matching Redis).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Cap for `Vec::with_capacity` in array parsing. A declared count of 1M
/// elements would otherwise cost a large allocation before any child
/// data is validated; the Vec still grows organically past this.
const PREALLOC_CAP: usize = 1024;

/// Incremental parser over an owned append-only buffer.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the wire. Cannot fail.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed by a parsed frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Parses the next complete frame, consuming its bytes.
    ///
    /// Returns `Ok(None)` when more data is needed. Any `Err` means the
    /// stream is no longer frame-aligned and the connection must be
    /// closed.
    pub fn try_parse(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Ok(self.parse_one()?.map(|(frame, _raw)| frame))
    }

    /// Like [`Self::try_parse`], but also returns the exact byte slice
    /// the frame was parsed from, enabling byte-identical forwarding.
    pub fn try_parse_with_raw(&mut self) -> Result<Option<(Frame, Bytes)>, ProtocolError> {
        self.parse_one()
    }

    fn parse_one(&mut self) -> Result<Option<(Frame, Bytes)>, ProtocolError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(self.buf.as_ref());
        match try_parse(&mut cursor, 0) {
            Ok(frame) => {
                let consumed = cursor.position() as usize;
                let raw = self.buf.split_to(consumed).freeze();
                Ok(Some((frame, raw)))
            }
            Err(ProtocolError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// single-pass parser: validates and builds Frame values in one traversal
// ---------------------------------------------------------------------------

fn try_parse(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, ProtocolError> {
    let prefix = read_byte(cursor)?;

    match prefix {
        b'+' => {
            let line = read_line(cursor)?;
            Ok(Frame::Simple(String::from_utf8_lossy(line).into_owned()))
        }
        b'-' => {
            let line = read_line(cursor)?;
            Ok(Frame::Error(String::from_utf8_lossy(line).into_owned()))
        }
        b':' => {
            let val = read_integer_line(cursor)?;
            Ok(Frame::Integer(val))
        }
        b'$' => {
            let len = read_integer_line(cursor)?;
            if len == -1 {
                return Ok(Frame::NullBulk);
            }
            if len < 0 {
                return Err(ProtocolError::InvalidFrameLength(len));
            }
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::BulkTooLarge(len as usize));
            }
            let len = len as usize;

            // need `len` bytes of payload + trailing \r\n
            if remaining(cursor) < len + 2 {
                return Err(ProtocolError::Incomplete);
            }

            let pos = cursor.position() as usize;
            {
                let buf = cursor.get_ref();
                if buf[pos + len] != b'\r' || buf[pos + len + 1] != b'\n' {
                    return Err(ProtocolError::InvalidFrameLength(len as i64));
                }
            }
            cursor.set_position((pos + len + 2) as u64);

            let data = Bytes::copy_from_slice(&cursor.get_ref()[pos..pos + len]);
            Ok(Frame::Bulk(data))
        }
        b'*' => {
            let next_depth = depth + 1;
            if next_depth > MAX_NESTING_DEPTH {
                return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
            }

            let count = read_integer_line(cursor)?;
            if count == -1 {
                return Ok(Frame::NullArray);
            }
            if count < 0 {
                return Err(ProtocolError::InvalidFrameLength(count));
            }
            if count as usize > MAX_ARRAY_ELEMENTS {
                return Err(ProtocolError::TooManyElements(count as usize));
            }

            let count = count as usize;
            let mut frames = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                frames.push(try_parse(cursor, next_depth)?);
            }
            Ok(Frame::Array(frames))
        }
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

// ---------------------------------------------------------------------------
// low-level cursor helpers
// ---------------------------------------------------------------------------

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    if pos >= cursor.get_ref().len() {
        return Err(ProtocolError::Incomplete);
    }
    cursor.set_position((pos + 1) as u64);
    Ok(cursor.get_ref()[pos])
}

/// Returns the slice up to (but not including) the next `\r\n` and
/// advances the cursor past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let start = cursor.position() as usize;
    let end = find_crlf(cursor)?;
    Ok(&cursor.get_ref()[start..end])
}

fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = read_line(cursor)?;
    parse_i64_bytes(line)
}

/// Finds the next `\r\n` starting at the cursor position. Returns the
/// index of the `\r` and advances the cursor past the `\n`.
fn find_crlf(cursor: &mut Cursor<&[u8]>) -> Result<usize, ProtocolError> {
    let buf = cursor.get_ref();
    let start = cursor.position() as usize;

    if start >= buf.len() {
        return Err(ProtocolError::Incomplete);
    }

    let mut pos = start;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(cr);
        }
        // bare \r without \n, keep scanning past it
        pos = cr + 1;
    }

    Err(ProtocolError::Incomplete)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    let len = cursor.get_ref().len();
    let pos = cursor.position() as usize;
    len.saturating_sub(pos)
}

/// Parses an i64 directly from a byte slice without allocating.
///
/// Negative numbers accumulate in the negative direction so that
/// `i64::MIN` is representable without overflow.
fn parse_i64_bytes(buf: &[u8]) -> Result<i64, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let (negative, digits) = if buf[0] == b'-' {
        (true, &buf[1..])
    } else {
        (false, buf)
    };

    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        let digit = (b - b'0') as i64;
        n = n
            .checked_mul(10)
            .and_then(|n| {
                if negative {
                    n.checked_sub(digit)
                } else {
                    n.checked_add(digit)
                }
            })
            .ok_or(ProtocolError::InvalidInteger)?;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_parse(input: &[u8]) -> Frame {
        let mut parser = FrameParser::new();
        parser.append(input);
        let frame = parser
            .try_parse()
            .expect("parse should not error")
            .expect("parse should return a frame");
        assert_eq!(parser.buffered(), 0, "should consume entire input");
        frame
    }

    #[test]
    fn simple_string() {
        assert_eq!(must_parse(b"+OK\r\n"), Frame::Simple("OK".into()));
        assert_eq!(
            must_parse(b"+hello world\r\n"),
            Frame::Simple("hello world".into())
        );
    }

    #[test]
    fn simple_error() {
        assert_eq!(
            must_parse(b"-ERR unknown command\r\n"),
            Frame::Error("ERR unknown command".into())
        );
    }

    #[test]
    fn integer() {
        assert_eq!(must_parse(b":42\r\n"), Frame::Integer(42));
        assert_eq!(must_parse(b":0\r\n"), Frame::Integer(0));
        assert_eq!(must_parse(b":-1\r\n"), Frame::Integer(-1));
        assert_eq!(
            must_parse(b":9223372036854775807\r\n"),
            Frame::Integer(i64::MAX)
        );
        assert_eq!(
            must_parse(b":-9223372036854775808\r\n"),
            Frame::Integer(i64::MIN)
        );
    }

    #[test]
    fn bulk_string() {
        assert_eq!(
            must_parse(b"$5\r\nhello\r\n"),
            Frame::Bulk(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn empty_bulk_string() {
        assert_eq!(must_parse(b"$0\r\n\r\n"), Frame::Bulk(Bytes::new()));
    }

    #[test]
    fn bulk_string_with_binary() {
        let input = b"$4\r\n\x00\x01\r\n\r\n";
        assert_eq!(
            must_parse(input),
            Frame::Bulk(Bytes::copy_from_slice(&[0, 1, b'\r', b'\n']))
        );
    }

    #[test]
    fn null_bulk() {
        assert_eq!(must_parse(b"$-1\r\n"), Frame::NullBulk);
    }

    #[test]
    fn null_array() {
        assert_eq!(must_parse(b"*-1\r\n"), Frame::NullArray);
    }

    #[test]
    fn array() {
        let input = b"*2\r\n+hello\r\n+world\r\n";
        assert_eq!(
            must_parse(input),
            Frame::Array(vec![
                Frame::Simple("hello".into()),
                Frame::Simple("world".into()),
            ])
        );
    }

    #[test]
    fn empty_array() {
        assert_eq!(must_parse(b"*0\r\n"), Frame::Array(vec![]));
    }

    #[test]
    fn nested_array() {
        let input = b"*2\r\n*2\r\n:1\r\n:2\r\n*1\r\n:3\r\n";
        assert_eq!(
            must_parse(input),
            Frame::Array(vec![
                Frame::Array(vec![Frame::Integer(1), Frame::Integer(2)]),
                Frame::Array(vec![Frame::Integer(3)]),
            ])
        );
    }

    #[test]
    fn incomplete_returns_none() {
        for partial in [
            &b""[..],
            b"+OK",
            b"+OK\r",
            b"$5\r\nhel",
            b"$5\r\nhello\r",
            b"*2\r\n+OK\r\n",
            b"*",
        ] {
            let mut parser = FrameParser::new();
            parser.append(partial);
            assert_eq!(parser.try_parse().unwrap(), None, "input {partial:?}");
        }
    }

    #[test]
    fn byte_at_a_time_equals_single_shot() {
        let input = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";

        let mut single = FrameParser::new();
        single.append(input);
        let expected = single.try_parse().unwrap().unwrap();

        let mut dribble = FrameParser::new();
        let mut got = None;
        for (i, b) in input.iter().enumerate() {
            dribble.append(std::slice::from_ref(b));
            match dribble.try_parse().unwrap() {
                Some(frame) => {
                    assert_eq!(i, input.len() - 1, "frame completed early");
                    got = Some(frame);
                }
                None => assert!(i < input.len() - 1),
            }
        }
        assert_eq!(got.unwrap(), expected);
    }

    #[test]
    fn pipelined_frames_parse_in_order() {
        let mut parser = FrameParser::new();
        parser.append(b"+first\r\n:2\r\n$5\r\nthird\r\n");
        assert_eq!(
            parser.try_parse().unwrap().unwrap(),
            Frame::Simple("first".into())
        );
        assert_eq!(parser.try_parse().unwrap().unwrap(), Frame::Integer(2));
        assert_eq!(
            parser.try_parse().unwrap().unwrap(),
            Frame::Bulk(Bytes::from_static(b"third"))
        );
        assert_eq!(parser.try_parse().unwrap(), None);
    }

    #[test]
    fn raw_bytes_match_wire_form() {
        let input = b"*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n";
        let mut parser = FrameParser::new();
        parser.append(input);
        parser.append(b"+trailing\r\n");

        let (frame, raw) = parser.try_parse_with_raw().unwrap().unwrap();
        assert_eq!(&raw[..], &input[..]);
        assert!(matches!(frame, Frame::Array(ref items) if items.len() == 2));

        // the trailing frame is still there, with its own raw slice
        let (frame, raw) = parser.try_parse_with_raw().unwrap().unwrap();
        assert_eq!(frame, Frame::Simple("trailing".into()));
        assert_eq!(&raw[..], b"+trailing\r\n");
    }

    #[test]
    fn invalid_prefix() {
        let mut parser = FrameParser::new();
        parser.append(b"~nope\r\n");
        assert_eq!(
            parser.try_parse().unwrap_err(),
            ProtocolError::InvalidPrefix(b'~')
        );
    }

    #[test]
    fn invalid_integer() {
        let mut parser = FrameParser::new();
        parser.append(b":abc\r\n");
        assert_eq!(parser.try_parse().unwrap_err(), ProtocolError::InvalidInteger);
    }

    #[test]
    fn negative_framing_rejected() {
        let mut parser = FrameParser::new();
        parser.append(b"$-2\r\n");
        assert!(matches!(
            parser.try_parse().unwrap_err(),
            ProtocolError::InvalidFrameLength(-2)
        ));

        let mut parser = FrameParser::new();
        parser.append(b"*-3\r\n");
        assert!(matches!(
            parser.try_parse().unwrap_err(),
            ProtocolError::InvalidFrameLength(-3)
        ));
    }

    #[test]
    fn oversize_bulk_rejected() {
        let mut parser = FrameParser::new();
        parser.append(b"$536870913\r\n");
        assert!(matches!(
            parser.try_parse().unwrap_err(),
            ProtocolError::BulkTooLarge(_)
        ));
    }

    #[test]
    fn deeply_nested_array_rejected() {
        let mut input = Vec::new();
        for _ in 0..65 {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");

        let mut parser = FrameParser::new();
        parser.append(&input);
        assert!(matches!(
            parser.try_parse().unwrap_err(),
            ProtocolError::NestingTooDeep(64)
        ));
    }

    #[test]
    fn parse_i64_bytes_valid() {
        assert_eq!(parse_i64_bytes(b"0").unwrap(), 0);
        assert_eq!(parse_i64_bytes(b"42").unwrap(), 42);
        assert_eq!(parse_i64_bytes(b"-1").unwrap(), -1);
        assert_eq!(parse_i64_bytes(b"9223372036854775807").unwrap(), i64::MAX);
        assert_eq!(parse_i64_bytes(b"-9223372036854775808").unwrap(), i64::MIN);
    }

    #[test]
    fn parse_i64_bytes_invalid() {
        assert!(parse_i64_bytes(b"").is_err());
        assert!(parse_i64_bytes(b"-").is_err());
        assert!(parse_i64_bytes(b"abc").is_err());
        assert!(parse_i64_bytes(b"12a").is_err());
    }
}
