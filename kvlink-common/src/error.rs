//! # Frame Errors
//!
//! Errors raised while parsing RESP frames. A frame error means the byte
//! stream can no longer be trusted, so callers drop the connection.

use thiserror::Error;

/// Result alias for frame parsing.
pub type FrameResult<T> = Result<T, FrameError>;

/// Malformed or oversized RESP input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// First byte of a frame is not a known type marker.
    #[error("invalid type marker 0x{0:02x}")]
    InvalidMarker(u8),
    /// A length or integer field did not parse.
    #[error("invalid integer field {0:?}")]
    InvalidInteger(String),
    /// Bulk payload was not followed by CRLF.
    #[error("missing CRLF terminator")]
    MissingTerminator,
    /// Declared length exceeds the configured maximum.
    #[error("frame length {0} exceeds limit")]
    TooLarge(i64),
    /// Structurally valid bytes that do not form the expected frame.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
