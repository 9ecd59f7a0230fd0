//! # Reply Decoder
//!
//! Purpose: Read reply frames off a byte stream one at a time and convert
//! decoded `Reply` values into the Rust types the client API returns.
//!
//! ## Design Principles
//! 1. **Lazy Reads**: The socket is only read when the buffer does not
//!    already hold a complete frame, so pipelined replies are served from
//!    one read where possible.
//! 2. **Buffer Reuse**: One `BytesMut` per connection, kept across calls.
//! 3. **Nil Is Not Empty**: Converters return `Option` wherever the server
//!    may answer Nil, so callers branch on the tag instead of on length.

use std::io::{self, Read};

use bytes::BytesMut;
use kvlink_common::{parse_reply, Reply};

use crate::encoder::parse_score;
use crate::error::{ClientError, ClientResult, CommandError};

const READ_CHUNK: usize = 8 * 1024;

/// Incremental reply reader with an owned read buffer.
#[derive(Debug)]
pub struct ReplyDecoder {
    buf: BytesMut,
}

impl Default for ReplyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyDecoder {
    pub fn new() -> Self {
        ReplyDecoder {
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Returns the next reply, reading from `reader` only as needed.
    pub fn read_reply<R: Read>(&mut self, reader: &mut R) -> ClientResult<Reply> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(reply) = parse_reply(&mut self.buf)? {
                return Ok(reply);
            }

            let read = match reader.read(&mut chunk) {
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )
                .into());
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Turns an error reply into `ClientError::Command`, passing others through.
pub fn check(reply: Reply) -> ClientResult<Reply> {
    match reply {
        Reply::Error(message) => Err(CommandError::parse(&message).into()),
        other => Ok(other),
    }
}

pub fn expect_ok(reply: Reply) -> ClientResult<()> {
    match check(reply)? {
        Reply::SimpleString(_) => Ok(()),
        other => Err(unexpected("status reply", &other)),
    }
}

pub fn expect_int(reply: Reply) -> ClientResult<i64> {
    match check(reply)? {
        Reply::Integer(value) => Ok(value),
        other => Err(unexpected("integer", &other)),
    }
}

/// Integer reply that may be Nil, e.g. `ZRANK` of a missing member.
pub fn expect_opt_int(reply: Reply) -> ClientResult<Option<i64>> {
    match check(reply)? {
        Reply::Nil => Ok(None),
        Reply::Integer(value) => Ok(Some(value)),
        other => Err(unexpected("integer or nil", &other)),
    }
}

pub fn expect_bool(reply: Reply) -> ClientResult<bool> {
    match check(reply)? {
        Reply::Integer(0) => Ok(false),
        Reply::Integer(1) => Ok(true),
        other => Err(unexpected("integer 0 or 1", &other)),
    }
}

/// String reply that may be Nil.
pub fn expect_bulk(reply: Reply) -> ClientResult<Option<Vec<u8>>> {
    match check(reply)? {
        Reply::Nil => Ok(None),
        Reply::BulkString(data) => Ok(Some(data)),
        Reply::SimpleString(text) => Ok(Some(text.into_bytes())),
        other => Err(unexpected("bulk string or nil", &other)),
    }
}

/// String reply that must be present.
pub fn expect_bytes(reply: Reply) -> ClientResult<Vec<u8>> {
    match expect_bulk(reply)? {
        Some(data) => Ok(data),
        None => Err(ClientError::UnexpectedReply("expected bulk string, got nil".to_string())),
    }
}

/// Array of possibly-Nil strings, positionally preserved (`MGET`, `HMGET`).
pub fn expect_bulk_list(reply: Reply) -> ClientResult<Vec<Option<Vec<u8>>>> {
    match check(reply)? {
        Reply::Array(items) => items.into_iter().map(expect_bulk).collect(),
        other => Err(unexpected("array", &other)),
    }
}

/// Array of strings (`LRANGE`, `SMEMBERS`, `KEYS`).
pub fn expect_bytes_list(reply: Reply) -> ClientResult<Vec<Vec<u8>>> {
    match check(reply)? {
        Reply::Array(items) => items.into_iter().map(expect_bytes).collect(),
        other => Err(unexpected("array", &other)),
    }
}

/// Field/value pairs from either a RESP3 map or a flat RESP2 array.
pub fn expect_pairs(reply: Reply) -> ClientResult<Vec<(Vec<u8>, Vec<u8>)>> {
    match check(reply)? {
        Reply::Map(pairs) => pairs
            .into_iter()
            .map(|(key, value)| Ok((expect_bytes(key)?, expect_bytes(value)?)))
            .collect(),
        Reply::Array(items) => {
            if items.len() % 2 != 0 {
                return Err(ClientError::UnexpectedReply(format!(
                    "expected an even number of elements, got {}",
                    items.len()
                )));
            }
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                pairs.push((expect_bytes(key)?, expect_bytes(value)?));
            }
            Ok(pairs)
        }
        other => Err(unexpected("map or array", &other)),
    }
}

/// Score reply that may be Nil (`ZSCORE`).
pub fn expect_score(reply: Reply) -> ClientResult<Option<f64>> {
    match expect_bulk(reply)? {
        None => Ok(None),
        Some(text) => parse_score(&text).map(Some).ok_or_else(|| {
            ClientError::UnexpectedReply(format!(
                "invalid score {:?}",
                String::from_utf8_lossy(&text)
            ))
        }),
    }
}

/// `ZRANGE ... WITHSCORES`: flat `[m, s, ...]` (RESP2) or `[[m, s], ...]` (RESP3).
pub fn expect_scored_members(reply: Reply) -> ClientResult<Vec<(Vec<u8>, f64)>> {
    let items = match check(reply)? {
        Reply::Array(items) => items,
        other => return Err(unexpected("array", &other)),
    };

    let nested = items.iter().all(|item| matches!(item, Reply::Array(_)));
    let flat: Vec<Reply> = if nested && !items.is_empty() {
        items
            .into_iter()
            .flat_map(|item| match item {
                Reply::Array(inner) => inner,
                other => vec![other],
            })
            .collect()
    } else {
        items
    };

    expect_pairs(Reply::Array(flat))?
        .into_iter()
        .map(|(member, score)| {
            let score = parse_score(&score).ok_or_else(|| {
                ClientError::UnexpectedReply(format!(
                    "invalid score {:?}",
                    String::from_utf8_lossy(&score)
                ))
            })?;
            Ok((member, score))
        })
        .collect()
}

fn unexpected(expected: &str, reply: &Reply) -> ClientError {
    ClientError::UnexpectedReply(format!("expected {}, got {}", expected, reply.tag()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Cursor;

    /// Reader that hands out one byte per call.
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(1);
            self.0.read(&mut buf[..len])
        }
    }

    #[test]
    fn decodes_pipelined_replies_in_order() {
        let mut reader = Cursor::new(b"+OK\r\n$5\r\nhello\r\n:3\r\n".to_vec());
        let mut decoder = ReplyDecoder::new();
        assert_eq!(decoder.read_reply(&mut reader).unwrap(), Reply::ok());
        assert_eq!(decoder.read_reply(&mut reader).unwrap(), Reply::bulk("hello"));
        assert_eq!(decoder.buffered(), 4);
        assert_eq!(decoder.read_reply(&mut reader).unwrap(), Reply::Integer(3));
    }

    #[test]
    fn decodes_frames_split_across_reads() {
        let mut reader = Trickle(Cursor::new(b"*2\r\n$2\r\nv1\r\n$-1\r\n".to_vec()));
        let mut decoder = ReplyDecoder::new();
        assert_eq!(
            decoder.read_reply(&mut reader).unwrap(),
            Reply::Array(vec![Reply::bulk("v1"), Reply::Nil])
        );
    }

    #[test]
    fn eof_is_connection_error() {
        let mut reader = Cursor::new(b"$5\r\nhel".to_vec());
        let mut decoder = ReplyDecoder::new();
        let err = decoder.read_reply(&mut reader).unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
    }

    #[test]
    fn error_reply_becomes_command_error() {
        let err = expect_int(Reply::Error("WRONGTYPE bad".into())).unwrap_err();
        assert_eq!(err.command_kind(), Some(ErrorKind::WrongType));
    }

    #[test]
    fn nil_and_empty_are_distinct() {
        assert_eq!(expect_bulk(Reply::Nil).unwrap(), None);
        assert_eq!(expect_bulk(Reply::BulkString(Vec::new())).unwrap(), Some(Vec::new()));
        assert!(expect_bytes(Reply::Nil).is_err());
    }

    #[test]
    fn pairs_from_map_or_flat_array() {
        let flat = Reply::Array(vec![Reply::bulk("name"), Reply::bulk("John")]);
        let map = Reply::Map(vec![(Reply::bulk("name"), Reply::bulk("John"))]);
        let expected = vec![(b"name".to_vec(), b"John".to_vec())];
        assert_eq!(expect_pairs(flat).unwrap(), expected);
        assert_eq!(expect_pairs(map).unwrap(), expected);
        assert!(expect_pairs(Reply::Array(vec![Reply::bulk("odd")])).is_err());
    }

    #[test]
    fn scored_members_from_both_shapes() {
        let flat = Reply::Array(vec![Reply::bulk("one"), Reply::bulk("1")]);
        let nested = Reply::Array(vec![Reply::Array(vec![Reply::bulk("one"), Reply::bulk("1")])]);
        let expected = vec![(b"one".to_vec(), 1.0)];
        assert_eq!(expect_scored_members(flat).unwrap(), expected);
        assert_eq!(expect_scored_members(nested).unwrap(), expected);
        assert_eq!(expect_scored_members(Reply::Array(Vec::new())).unwrap(), Vec::new());
    }

    #[test]
    fn shape_mismatch_is_unexpected_reply() {
        assert!(matches!(
            expect_ok(Reply::Integer(1)),
            Err(ClientError::UnexpectedReply(_))
        ));
        assert!(matches!(
            expect_bool(Reply::Integer(2)),
            Err(ClientError::UnexpectedReply(_))
        ));
    }
}
