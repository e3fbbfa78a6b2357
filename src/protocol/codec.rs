//! RESP encode/decode primitives.
//!
//! Small, allocation-averse read/write primitives plus a builder for the
//! outbound frame. RESP's array framing is count-prefixed rather than
//! byte-length-prefixed, so there is no length field to patch in after the
//! fact — the item count is known up front.

use std::io::{Read, Write};

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error::{Error, Result};

use super::reply::Reply;

const INLINE_CAP: usize = 4096;

/// Encodes a command as a RESP multi-bulk array: `*N\r\n` followed by
/// `$len\r\n<bytes>\r\n` for each argument.
pub fn encode_command(buf: &mut Vec<u8>, args: &[&[u8]]) {
    buf.push(b'*');
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for arg in args {
        buf.push(b'$');
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}

/// Buffered frame reader over a blocking `Read`.
///
/// Holds one fixed inline window and one pooled overflow buffer for fields
/// (status lines, length headers) that straddle the window boundary. Bulk
/// payload bytes are always copied into a freshly owned `Vec<u8>` since the
/// decoded `Reply` must own them regardless of where they came from.
pub struct FrameReader<R> {
    inner: R,
    buf: Box<[u8; INLINE_CAP]>,
    pos: usize,
    len: usize,
    overflow: PooledBuffer,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, pool: &std::sync::Arc<BufferPool>) -> Self {
        Self {
            inner,
            buf: Box::new([0_u8; INLINE_CAP]),
            pos: 0,
            len: 0,
            overflow: pool.lease(),
        }
    }

    fn refill(&mut self) -> Result<usize> {
        if self.pos < self.len {
            return Ok(self.len - self.pos);
        }
        self.pos = 0;
        self.len = self.inner.read(self.buf.as_mut_slice())?;
        Ok(self.len)
    }

    fn read_byte(&mut self) -> Result<u8> {
        if self.pos >= self.len && self.refill()? == 0 {
            return Err(Error::Protocol("unexpected end of stream".to_string()));
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Reads one CRLF-terminated line, not including the CRLF.
    ///
    /// `pending_cr` carries a CR consumed from the tail of one window across
    /// the `refill()` into the next: the byte is never folded into
    /// `overflow`, and the next window's first byte is checked directly
    /// against `\n` rather than re-scanned for a fresh `\r` (which would
    /// miss a terminator split exactly on the CR/LF boundary).
    fn read_line(&mut self) -> Result<Vec<u8>> {
        self.overflow.clear();
        let mut pending_cr = false;
        loop {
            if self.pos >= self.len && self.refill()? == 0 {
                return Err(Error::Protocol("unexpected end of stream in line".to_string()));
            }
            if pending_cr {
                if self.buf[self.pos] != b'\n' {
                    return Err(Error::Protocol("malformed line terminator".to_string()));
                }
                self.pos += 1;
                return Ok(self.overflow.clone());
            }
            let window = &self.buf[self.pos..self.len];
            if let Some(rel) = memchr::memchr(b'\r', window) {
                let cr = self.pos + rel;
                if cr + 1 < self.len {
                    if self.buf[cr + 1] != b'\n' {
                        return Err(Error::Protocol("malformed line terminator".to_string()));
                    }
                    let out = if self.overflow.is_empty() {
                        self.buf[self.pos..cr].to_vec()
                    } else {
                        self.overflow.extend_from_slice(&self.buf[self.pos..cr]);
                        self.overflow.clone()
                    };
                    self.pos = cr + 2;
                    return Ok(out);
                }
                // CR is the last byte currently buffered: stash everything
                // before it, consume the CR, and validate the LF against the
                // next refilled window instead of re-scanning for `\r`.
                self.overflow.extend_from_slice(&self.buf[self.pos..cr]);
                self.pos = self.len;
                pending_cr = true;
                continue;
            }
            self.overflow.extend_from_slice(window);
            self.pos = self.len;
        }
    }

    fn read_exact_owned(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.pos >= self.len && self.refill()? == 0 {
                return Err(Error::Protocol(
                    "unexpected end of stream in bulk payload".to_string(),
                ));
            }
            let take = (n - out.len()).min(self.len - self.pos);
            out.extend_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
        }
        Ok(out)
    }

    /// Reads one reply, or `None` if the peer closed the connection cleanly
    /// between frames.
    pub fn next_reply(&mut self) -> Result<Option<Reply>> {
        if self.pos >= self.len && self.refill()? == 0 {
            return Ok(None);
        }
        decode_reply(self).map(Some)
    }
}

fn decode_reply<R: Read>(r: &mut FrameReader<R>) -> Result<Reply> {
    let tag = r.read_byte()?;
    match tag {
        b'+' => Ok(Reply::Status(r.read_line()?)),
        b'-' => {
            let line = r.read_line()?;
            Ok(Reply::Error(String::from_utf8_lossy(&line).into_owned()))
        }
        b':' => Ok(Reply::Integer(parse_decimal(&r.read_line()?)?)),
        b'$' => {
            let n = parse_decimal(&r.read_line()?)?;
            if n < 0 {
                return Ok(Reply::Bulk(None));
            }
            let n = usize::try_from(n)
                .map_err(|_| Error::Protocol("bulk length does not fit usize".to_string()))?;
            let data = r.read_exact_owned(n)?;
            let crlf = r.read_exact_owned(2)?;
            if crlf != b"\r\n" {
                return Err(Error::Protocol(
                    "missing CRLF after bulk payload".to_string(),
                ));
            }
            Ok(Reply::Bulk(Some(data)))
        }
        b'*' => {
            let n = parse_decimal(&r.read_line()?)?;
            if n < 0 {
                return Ok(Reply::Array(None));
            }
            let n = usize::try_from(n)
                .map_err(|_| Error::Protocol("array length does not fit usize".to_string()))?;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(decode_reply(r)?);
            }
            Ok(Reply::Array(Some(items)))
        }
        other => Err(Error::Protocol(format!(
            "unrecognized reply prefix byte {other:#04x}"
        ))),
    }
}

fn parse_decimal(bytes: &[u8]) -> Result<i64> {
    let text = simdutf8::basic::from_utf8(bytes)
        .map_err(|_| Error::Protocol("non-utf8 integer field".to_string()))?;
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Protocol(format!("malformed integer field: {text:?}")));
    }
    let magnitude: i64 = digits
        .parse()
        .map_err(|_| Error::Protocol(format!("integer field out of range: {text:?}")))?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// A thin writer wrapper; `encode_command` already produces complete frames, so
/// this only exists to give callers a single `flush` choke point.
pub fn write_frame<W: Write>(w: &mut W, frame: &[u8]) -> Result<()> {
    w.write_all(frame)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn reader(bytes: &'static [u8]) -> FrameReader<&'static [u8]> {
        FrameReader::new(bytes, &BufferPool::new())
    }

    #[test]
    fn encodes_multi_bulk() {
        let mut buf = Vec::new();
        encode_command(&mut buf, &[b"SET", b"k", b"v"]);
        assert_eq!(buf, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn decodes_status() {
        let mut r = reader(b"+OK\r\n");
        assert_eq!(r.next_reply().unwrap(), Some(Reply::Status(b"OK".to_vec())));
    }

    #[test]
    fn decodes_error() {
        let mut r = reader(b"-ERR bad\r\n");
        assert_eq!(
            r.next_reply().unwrap(),
            Some(Reply::Error("ERR bad".to_string()))
        );
    }

    #[test]
    fn decodes_nil_bulk_and_array() {
        let mut r = reader(b"$-1\r\n*-1\r\n");
        assert_eq!(r.next_reply().unwrap(), Some(Reply::Bulk(None)));
        assert_eq!(r.next_reply().unwrap(), Some(Reply::Array(None)));
    }

    #[test]
    fn decodes_nested_array() {
        let mut r = reader(b"*2\r\n:1\r\n*1\r\n$3\r\nfoo\r\n");
        let reply = r.next_reply().unwrap().unwrap();
        assert_eq!(
            reply,
            Reply::Array(Some(vec![
                Reply::Integer(1),
                Reply::Array(Some(vec![Reply::Bulk(Some(b"foo".to_vec()))])),
            ]))
        );
    }

    #[test]
    fn reports_clean_eof_between_frames() {
        let mut r = reader(b"");
        assert_eq!(r.next_reply().unwrap(), None);
    }

    #[test]
    fn field_spanning_inline_window_uses_overflow() {
        let long_key = "a".repeat(INLINE_CAP + 64);
        let frame = format!("${}\r\n{}\r\n", long_key.len(), long_key);
        let frame: &'static [u8] = Box::leak(frame.into_bytes().into_boxed_slice());
        let mut r = reader(frame);
        match r.next_reply().unwrap() {
            Some(Reply::Bulk(Some(data))) => assert_eq!(data.len(), long_key.len()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    /// A `Read` that hands back one scripted chunk per call, regardless of
    /// the caller's buffer size, so a test can force a read to end exactly
    /// on a `\r` byte — something a `&[u8]` reader (which always fills to
    /// capacity in one call) can never produce.
    struct ScriptedReader {
        chunks: std::collections::VecDeque<&'static [u8]>,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    #[test]
    fn cr_split_exactly_at_window_boundary_is_handled() {
        let scripted = ScriptedReader {
            chunks: std::collections::VecDeque::from(vec![b"+PONG\r".as_slice(), b"\n".as_slice()]),
        };
        let mut r = FrameReader::new(scripted, &BufferPool::new());
        assert_eq!(r.next_reply().unwrap(), Some(Reply::Status(b"PONG".to_vec())));
    }

    #[test]
    fn cr_split_boundary_rejects_missing_lf() {
        let scripted = ScriptedReader {
            chunks: std::collections::VecDeque::from(vec![b"+PONG\r".as_slice(), b"X".as_slice()]),
        };
        let mut r = FrameReader::new(scripted, &BufferPool::new());
        assert!(r.next_reply().is_err());
    }
}
