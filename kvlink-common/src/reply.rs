//! # Reply Model
//!
//! A decoded server reply. The tag set mirrors the RESP reply types one to
//! one; RESP3-only types fold onto the closest tag during parsing.
//!
//! ## Design Principles
//!
//! 1. **Explicit Nil**: a missing value is `Reply::Nil`, never an empty
//!    `BulkString`, so "key missing" and "empty value" stay distinct.
//! 2. **Errors Are Data**: an error reply is a value here; the client decides
//!    when it becomes a Rust `Err`.
//! 3. **Ordered Maps**: `Map` keeps wire order as a list of pairs.

use std::fmt;

/// One decoded reply frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `$-1`, `*-1` or RESP3 `_`.
    Nil,
    /// `:123`
    Integer(i64),
    /// `$5\r\nhello`
    BulkString(Vec<u8>),
    /// `+OK`
    SimpleString(String),
    /// `*2 ...`
    Array(Vec<Reply>),
    /// RESP3 `%2 ...`
    Map(Vec<(Reply, Reply)>),
    /// `-ERR message`
    Error(String),
}

impl Reply {
    /// The `+OK` status reply.
    pub fn ok() -> Self {
        Reply::SimpleString("OK".to_string())
    }

    /// Builds an error reply. The message should start with an error code.
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Reply::BulkString(data.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Short tag name, used in diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            Reply::Nil => "nil",
            Reply::Integer(_) => "integer",
            Reply::BulkString(_) => "bulk-string",
            Reply::SimpleString(_) => "simple-string",
            Reply::Array(_) => "array",
            Reply::Map(_) => "map",
            Reply::Error(_) => "error",
        }
    }

    /// Borrows the payload of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::BulkString(data) => Some(data),
            Reply::SimpleString(text) => Some(text.as_bytes()),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nil => write!(f, "(nil)"),
            Reply::Integer(value) => write!(f, "(integer) {}", value),
            Reply::BulkString(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Reply::SimpleString(text) => write!(f, "{}", text),
            Reply::Error(message) => write!(f, "(error) {}", message),
            Reply::Array(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Reply::Map(pairs) => {
                write!(f, "{{")?;
                for (idx, (key, value)) in pairs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<i64> for Reply {
    fn from(value: i64) -> Self {
        Reply::Integer(value)
    }
}

impl From<bool> for Reply {
    fn from(value: bool) -> Self {
        Reply::Integer(i64::from(value))
    }
}

impl From<Vec<u8>> for Reply {
    fn from(data: Vec<u8>) -> Self {
        Reply::BulkString(data)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::BulkString(text.as_bytes().to_vec())
    }
}

impl From<Option<Vec<u8>>> for Reply {
    fn from(data: Option<Vec<u8>>) -> Self {
        match data {
            Some(data) => Reply::BulkString(data),
            None => Reply::Nil,
        }
    }
}

impl From<Vec<Reply>> for Reply {
    fn from(items: Vec<Reply>) -> Self {
        Reply::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_not_empty_bulk() {
        assert_ne!(Reply::Nil, Reply::BulkString(Vec::new()));
        assert!(Reply::from(None::<Vec<u8>>).is_nil());
        assert_eq!(Reply::from(Some(Vec::new())), Reply::BulkString(Vec::new()));
    }

    #[test]
    fn displays_nested_values() {
        let reply = Reply::Array(vec![Reply::bulk("a"), Reply::Nil, Reply::Integer(3)]);
        assert_eq!(reply.to_string(), "[\"a\", (nil), (integer) 3]");
    }
}
