//! # RESP Frame Codec
//!
//! Purpose: Encode requests and replies and parse them incrementally from a
//! `BytesMut` read buffer.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `parse_reply` returns `Ok(None)` until a whole
//!    frame is buffered and consumes exactly one frame when it succeeds.
//! 2. **Binary-Safe**: Bulk strings are raw bytes; only the framing is text.
//! 3. **Fail Fast**: Invalid framing returns a `FrameError` immediately.
//! 4. **One Tag Set**: RESP3 types fold onto the `Reply` tags on the way in.
//!
//! ## Wire Format
//!
//! ```text
//! request:  *<argc>\r\n ( $<len>\r\n <bytes>\r\n ){argc}
//! replies:  +simple  -error  :integer  $bulk  *array   (RESP2)
//!           _null  %map  ~set  #bool  ,double  (big  !blob-error  =verbatim  >push
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FrameError, FrameResult};
use crate::reply::Reply;

/// Largest bulk payload accepted from the wire (512 MiB, the server limit).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest element count accepted for an aggregate frame.
pub const MAX_AGGREGATE_LEN: i64 = 64 * 1024 * 1024;

/// Reply encoding negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RespVersion {
    #[default]
    Resp2,
    Resp3,
}

/// Encodes a single bulk string, including its length header.
pub fn write_bulk(data: &[u8], out: &mut BytesMut) {
    out.put_u8(b'$');
    put_decimal(out, data.len() as i64);
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Encodes a reply for the given protocol version.
///
/// Under RESP2 a `Map` is flattened into an array of alternating keys and
/// values and `Nil` becomes the null bulk string.
pub fn write_reply(reply: &Reply, version: RespVersion, out: &mut BytesMut) {
    match reply {
        Reply::Nil => match version {
            RespVersion::Resp2 => out.extend_from_slice(b"$-1\r\n"),
            RespVersion::Resp3 => out.extend_from_slice(b"_\r\n"),
        },
        Reply::Integer(value) => {
            out.put_u8(b':');
            put_decimal(out, *value);
        }
        Reply::BulkString(data) => write_bulk(data, out),
        Reply::SimpleString(text) => {
            out.put_u8(b'+');
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Error(message) => {
            out.put_u8(b'-');
            out.extend_from_slice(message.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Array(items) => {
            out.put_u8(b'*');
            put_decimal(out, items.len() as i64);
            for item in items {
                write_reply(item, version, out);
            }
        }
        Reply::Map(pairs) => {
            match version {
                RespVersion::Resp2 => {
                    out.put_u8(b'*');
                    put_decimal(out, (pairs.len() * 2) as i64);
                }
                RespVersion::Resp3 => {
                    out.put_u8(b'%');
                    put_decimal(out, pairs.len() as i64);
                }
            }
            for (key, value) in pairs {
                write_reply(key, version, out);
                write_reply(value, version, out);
            }
        }
    }
}

/// Parses one reply frame from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when the frame is not yet
/// complete.
pub fn parse_reply(buf: &mut BytesMut) -> FrameResult<Option<Reply>> {
    let mut pos = 0;
    match parse_at(&buf[..], &mut pos)? {
        Some(reply) => {
            buf.advance(pos);
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

/// Parses one request (array of bulk strings) from the front of `buf`.
pub fn parse_request(buf: &mut BytesMut) -> FrameResult<Option<Vec<Vec<u8>>>> {
    if let Some(&marker) = buf.first() {
        if marker != b'*' {
            return Err(FrameError::Malformed("request must be an array"));
        }
    }

    let mut pos = 0;
    let items = match parse_at(&buf[..], &mut pos)? {
        Some(Reply::Array(items)) => items,
        Some(_) => return Err(FrameError::Malformed("request must be an array")),
        None => return Ok(None),
    };

    let mut args = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Reply::BulkString(data) => args.push(data),
            _ => return Err(FrameError::Malformed("request arguments must be bulk strings")),
        }
    }
    buf.advance(pos);
    Ok(Some(args))
}

fn parse_at(data: &[u8], pos: &mut usize) -> FrameResult<Option<Reply>> {
    let line = match read_line(data, pos) {
        Some(line) => line,
        None => return Ok(None),
    };
    let (&marker, body) = line
        .split_first()
        .ok_or(FrameError::Malformed("empty line"))?;

    let reply = match marker {
        b'+' => Reply::SimpleString(String::from_utf8_lossy(body).into_owned()),
        b'-' => Reply::Error(String::from_utf8_lossy(body).into_owned()),
        b':' => Reply::Integer(parse_int(body)?),
        b'_' => Reply::Nil,
        b'#' => match body {
            b"t" => Reply::Integer(1),
            b"f" => Reply::Integer(0),
            _ => return Err(FrameError::Malformed("invalid boolean")),
        },
        b',' | b'(' => Reply::BulkString(body.to_vec()),
        b'$' | b'!' | b'=' => {
            let len = parse_int(body)?;
            if len < 0 {
                return Ok(Some(Reply::Nil));
            }
            if len > MAX_BULK_LEN {
                return Err(FrameError::TooLarge(len));
            }
            let blob = match read_blob(data, pos, len as usize)? {
                Some(blob) => blob,
                None => return Ok(None),
            };
            match marker {
                b'!' => Reply::Error(String::from_utf8_lossy(blob).into_owned()),
                // Verbatim strings carry a three byte format prefix, e.g. "txt:".
                b'=' if blob.len() >= 4 && blob[3] == b':' => Reply::BulkString(blob[4..].to_vec()),
                _ => Reply::BulkString(blob.to_vec()),
            }
        }
        b'*' | b'~' | b'>' => {
            let len = parse_int(body)?;
            if len < 0 {
                return Ok(Some(Reply::Nil));
            }
            if len > MAX_AGGREGATE_LEN {
                return Err(FrameError::TooLarge(len));
            }
            let mut items = Vec::with_capacity((len as usize).min(1024));
            for _ in 0..len {
                match parse_at(data, pos)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            Reply::Array(items)
        }
        b'%' => {
            let len = parse_int(body)?;
            if len < 0 {
                return Err(FrameError::Malformed("negative map length"));
            }
            if len > MAX_AGGREGATE_LEN {
                return Err(FrameError::TooLarge(len));
            }
            let mut pairs = Vec::with_capacity((len as usize).min(1024));
            for _ in 0..len {
                let key = match parse_at(data, pos)? {
                    Some(key) => key,
                    None => return Ok(None),
                };
                let value = match parse_at(data, pos)? {
                    Some(value) => value,
                    None => return Ok(None),
                };
                pairs.push((key, value));
            }
            Reply::Map(pairs)
        }
        other => return Err(FrameError::InvalidMarker(other)),
    };
    Ok(Some(reply))
}

fn read_line<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let rest = data.get(*pos..)?;
    let end = rest.windows(2).position(|window| window == b"\r\n")?;
    *pos += end + 2;
    Some(&rest[..end])
}

fn read_blob<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> FrameResult<Option<&'a [u8]>> {
    let start = *pos;
    if data.len() < start + len + 2 {
        return Ok(None);
    }
    if &data[start + len..start + len + 2] != b"\r\n" {
        return Err(FrameError::MissingTerminator);
    }
    *pos = start + len + 2;
    Ok(Some(&data[start..start + len]))
}

fn parse_int(body: &[u8]) -> FrameResult<i64> {
    std::str::from_utf8(body)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| FrameError::InvalidInteger(String::from_utf8_lossy(body).into_owned()))
}

fn put_decimal(out: &mut BytesMut, value: i64) {
    out.extend_from_slice(value.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}
