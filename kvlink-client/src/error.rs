//! # Client Errors
//!
//! Every public operation returns either a typed value or one of these
//! errors. The split matters for retry decisions: only `Connection` errors
//! are ever retried, and only under an explicit `RetryPolicy`.

use std::fmt;
use std::io;

use kvlink_common::FrameError;
use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A caller-supplied argument cannot be represented on the wire.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// Transport unavailable, reset, timed out or desynchronized.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Command(#[from] CommandError),
    /// An atomic batch was discarded by the server before execution.
    #[error("batch rejected: {0}")]
    BatchRejected(String),
    /// The reply shape does not match what the operation returns.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns true for errors an explicit retry policy may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }

    /// Server error classification, when this is a command error.
    pub fn command_kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Command(err) => Some(err.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Connection(err.into())
    }
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        ClientError::Connection(ConnectionError::Protocol(err))
    }
}

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(io::Error),
    /// Read or write deadline elapsed.
    #[error("operation timed out")]
    Timeout,
    /// The connection failed earlier and has not been reconnected.
    #[error("connection is disconnected")]
    Disconnected,
    /// Pool is at capacity and no idle connection became available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Address could not be resolved into a socket address.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    /// RESP framing error; the stream can no longer be trusted.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ConnectionError::Timeout,
            _ => ConnectionError::Io(err),
        }
    }
}

/// Server error codes the client treats specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation against a key holding the wrong kind of value.
    WrongType,
    /// EVALSHA digest unknown to the server.
    NoScript,
    /// EXEC discarded because of queue-time errors.
    ExecAbort,
    /// Authentication required.
    NoAuth,
    /// Authentication rejected.
    WrongPass,
    /// Any other code, including the generic `ERR`.
    Other,
}

/// An error reply split into its code and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// Leading upper-case word of the reply, e.g. `WRONGTYPE`. Empty when
    /// the server sent a bare message.
    pub code: String,
    /// Remainder of the reply text.
    pub message: String,
}

impl CommandError {
    /// Splits raw error reply text into code and message.
    pub fn parse(raw: &str) -> Self {
        let (head, tail) = match raw.split_once(' ') {
            Some((head, tail)) => (head, tail),
            None => (raw, ""),
        };
        let is_code = !head.is_empty()
            && head
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');
        if is_code {
            CommandError {
                code: head.to_string(),
                message: tail.to_string(),
            }
        } else {
            CommandError {
                code: String::new(),
                message: raw.to_string(),
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code.as_str() {
            "WRONGTYPE" => ErrorKind::WrongType,
            "NOSCRIPT" => ErrorKind::NoScript,
            "EXECABORT" => ErrorKind::ExecAbort,
            "NOAUTH" => ErrorKind::NoAuth,
            "WRONGPASS" => ErrorKind::WrongPass,
            _ => ErrorKind::Other,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{}", self.message)
        } else if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.message)
        }
    }
}

impl std::error::Error for CommandError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_error_code() {
        let err = CommandError::parse("WRONGTYPE Operation against a key holding the wrong kind of value");
        assert_eq!(err.code, "WRONGTYPE");
        assert_eq!(err.kind(), ErrorKind::WrongType);
        assert!(err.message.starts_with("Operation"));
        assert_eq!(
            err.to_string(),
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        );
    }

    #[test]
    fn bare_message_has_no_code() {
        let err = CommandError::parse("something went wrong");
        assert_eq!(err.code, "");
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(err.to_string(), "something went wrong");
    }

    #[test]
    fn noscript_is_recognized() {
        let err = CommandError::parse("NOSCRIPT No matching script. Please use EVAL.");
        assert_eq!(err.kind(), ErrorKind::NoScript);
    }

    #[test]
    fn io_timeouts_map_to_timeout() {
        let err: ConnectionError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(err, ConnectionError::Timeout));
        let err: ClientError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(err.is_retryable());
    }
}
