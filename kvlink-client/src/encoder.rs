//! # Command Encoder
//!
//! Purpose: Build typed commands and turn them into RESP request frames.
//!
//! ## Design Principles
//! 1. **Immutable Commands**: `Command` is assembled with a consuming builder
//!    and only read afterwards.
//! 2. **Conversion at the Edge**: `ToArg` turns Rust values into `Arg`s; the
//!    wire text for numbers is produced once, at encode time.
//! 3. **Fail Fast**: Values with no wire form (NaN scores, empty verbs) are
//!    rejected with `ClientError::Encoding` before anything is written.

use bytes::BytesMut;
use kvlink_common::frame::write_bulk;

use crate::error::{ClientError, ClientResult};

/// One command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bytes(Vec<u8>),
    Int(i64),
    /// Sorted-set score; encoded with round-trip decimal formatting.
    Float(f64),
}

impl Arg {
    /// Produces the wire bytes of this argument.
    pub fn to_wire(&self) -> ClientResult<Vec<u8>> {
        match self {
            Arg::Bytes(data) => Ok(data.clone()),
            Arg::Int(value) => Ok(value.to_string().into_bytes()),
            Arg::Float(value) => format_score(*value).map(String::into_bytes),
        }
    }
}

/// Wrapper marking an `f64` as a sorted-set score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score(pub f64);

/// Conversion into a command argument.
pub trait ToArg {
    fn to_arg(&self) -> Arg;
}

impl ToArg for str {
    fn to_arg(&self) -> Arg {
        Arg::Bytes(self.as_bytes().to_vec())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Arg {
        Arg::Bytes(self.as_bytes().to_vec())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Arg {
        Arg::Bytes(self.to_vec())
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn to_arg(&self) -> Arg {
        Arg::Bytes(self.to_vec())
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Arg {
        Arg::Bytes(self.clone())
    }
}

impl ToArg for i64 {
    fn to_arg(&self) -> Arg {
        Arg::Int(*self)
    }
}

impl ToArg for i32 {
    fn to_arg(&self) -> Arg {
        Arg::Int(i64::from(*self))
    }
}

impl ToArg for u32 {
    fn to_arg(&self) -> Arg {
        Arg::Int(i64::from(*self))
    }
}

impl ToArg for u64 {
    fn to_arg(&self) -> Arg {
        // Values past i64::MAX keep their exact decimal text.
        match i64::try_from(*self) {
            Ok(value) => Arg::Int(value),
            Err(_) => Arg::Bytes(self.to_string().into_bytes()),
        }
    }
}

impl ToArg for usize {
    fn to_arg(&self) -> Arg {
        (*self as u64).to_arg()
    }
}

impl ToArg for f64 {
    fn to_arg(&self) -> Arg {
        Arg::Float(*self)
    }
}

impl ToArg for Score {
    fn to_arg(&self) -> Arg {
        Arg::Float(self.0)
    }
}

impl ToArg for Arg {
    fn to_arg(&self) -> Arg {
        self.clone()
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Arg {
        (**self).to_arg()
    }
}

/// A verb and its ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<Arg>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Command {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Builds a command from a full argument vector, verb first.
    ///
    /// Used by the custom-command escape hatch.
    pub fn from_parts<T: ToArg>(parts: &[T]) -> ClientResult<Self> {
        let (head, rest) = parts
            .split_first()
            .ok_or_else(|| ClientError::Encoding("command has no verb".to_string()))?;
        let name = match head.to_arg() {
            Arg::Bytes(data) => String::from_utf8(data)
                .map_err(|_| ClientError::Encoding("command verb is not UTF-8".to_string()))?,
            other => {
                return Err(ClientError::Encoding(format!(
                    "command verb must be text, got {:?}",
                    other
                )))
            }
        };
        Ok(Command::new(name).args(rest))
    }

    pub fn arg<T: ToArg + ?Sized>(mut self, arg: &T) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.args.extend(args.into_iter().map(|arg| arg.to_arg()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    /// Appends the request frame for this command to `out`.
    ///
    /// On error nothing is written.
    pub fn encode(&self, out: &mut BytesMut) -> ClientResult<()> {
        if self.name.trim().is_empty() {
            return Err(ClientError::Encoding("command verb is empty".to_string()));
        }
        let mut encoded = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            encoded.push(arg.to_wire()?);
        }

        out.extend_from_slice(b"*");
        out.extend_from_slice((encoded.len() + 1).to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        write_bulk(self.name.as_bytes(), out);
        for data in &encoded {
            write_bulk(data, out);
        }
        Ok(())
    }
}

/// Formats a score so that parsing the text yields the same `f64`.
///
/// `Display` for `f64` prints the shortest round-tripping decimal without an
/// exponent; infinities use the server's `+inf` / `-inf` tokens.
pub fn format_score(value: f64) -> ClientResult<String> {
    if value.is_nan() {
        return Err(ClientError::Encoding("score must not be NaN".to_string()));
    }
    if value.is_infinite() {
        return Ok(if value > 0.0 { "+inf" } else { "-inf" }.to_string());
    }
    Ok(value.to_string())
}

/// Parses a score as the server prints it.
pub fn parse_score(text: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(text).ok()?;
    match text.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse::<f64>().ok().filter(|value| !value.is_nan()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(cmd: &Command) -> Vec<u8> {
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn encodes_length_prefixed_arguments() {
        let cmd = Command::new("SET").arg("k").arg("hello world");
        assert_eq!(
            encoded(&cmd),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$11\r\nhello world\r\n".to_vec()
        );
    }

    #[test]
    fn encodes_mixed_argument_types() {
        let cmd = Command::new("ZADD")
            .arg("z")
            .arg(&Score(1.5))
            .arg("m")
            .arg(&-7i64)
            .arg(&b"\x00\xff"[..]);
        assert_eq!(
            encoded(&cmd),
            b"*6\r\n$4\r\nZADD\r\n$1\r\nz\r\n$3\r\n1.5\r\n$1\r\nm\r\n$2\r\n-7\r\n$2\r\n\x00\xff\r\n"
                .to_vec()
        );
    }

    #[test]
    fn scores_round_trip() {
        for value in [0.1, 1.0, -2.5, 1e21, 5e-324, f64::MAX, 0.30000000000000004] {
            let text = format_score(value).unwrap();
            assert_eq!(parse_score(text.as_bytes()), Some(value), "{}", text);
        }
        assert_eq!(format_score(3.0).unwrap(), "3");
        assert_eq!(format_score(f64::INFINITY).unwrap(), "+inf");
        assert_eq!(format_score(f64::NEG_INFINITY).unwrap(), "-inf");
    }

    #[test]
    fn rejects_unrepresentable_arguments() {
        let mut buf = BytesMut::new();
        let cmd = Command::new("ZADD").arg("z").arg(&f64::NAN).arg("m");
        assert!(matches!(cmd.encode(&mut buf), Err(ClientError::Encoding(_))));
        assert!(buf.is_empty());

        let cmd = Command::new("  ");
        assert!(matches!(cmd.encode(&mut buf), Err(ClientError::Encoding(_))));
    }

    #[test]
    fn builds_from_parts() {
        let cmd = Command::from_parts(&["GET", "key"]).unwrap();
        assert_eq!(cmd.name(), "GET");
        assert_eq!(cmd.arguments(), &[Arg::Bytes(b"key".to_vec())]);
        assert!(Command::from_parts::<&str>(&[]).is_err());
    }

    #[test]
    fn large_unsigned_keeps_exact_text() {
        assert_eq!(u64::MAX.to_arg().to_wire().unwrap(), b"18446744073709551615".to_vec());
    }
}
