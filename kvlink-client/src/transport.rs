//! # Transport Connection
//!
//! Purpose: Own one TCP connection and its strictly ordered request/reply
//! stream.
//!
//! ## Design Principles
//! 1. **One Stream, One Order**: Replies are read in the order requests were
//!    written; nothing here reorders or multiplexes.
//! 2. **Poison on Failure**: Any IO, timeout or framing failure drops the
//!    socket and moves the connection to `Disconnected`. A half-read reply
//!    cannot be resynchronized, so the stream is never reused after one.
//! 3. **No Replay**: `reconnect` builds a fresh channel; commands that were in
//!    flight are the caller's to resend.
//! 4. **Buffer Reuse**: Write and read buffers live on the connection.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::BytesMut;
use kvlink_common::Reply;
use tracing::{debug, warn};

use crate::config::Protocol;
use crate::decoder::{self, ReplyDecoder};
use crate::encoder::Command;
use crate::error::{ClientError, ClientResult, ConnectionError};

/// Per-connection settings, derived from `ClientConfig`.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Addresses tried in order; the first that accepts wins.
    pub addrs: Vec<String>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub protocol: Protocol,
    pub password: Option<String>,
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Single TCP connection with reusable buffers.
pub struct Connection {
    config: ConnectionConfig,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    decoder: ReplyDecoder,
    write_buf: BytesMut,
    // Requests written whose replies have not been read yet.
    pending: usize,
}

impl Connection {
    /// Opens a connection and runs the handshake (AUTH / HELLO).
    pub fn connect(config: ConnectionConfig) -> ClientResult<Self> {
        let mut conn = Connection {
            config,
            stream: None,
            peer: None,
            decoder: ReplyDecoder::new(),
            write_buf: BytesMut::with_capacity(256),
            pending: 0,
        };
        conn.reconnect()?;
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        if self.stream.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Address of the server this connection is attached to.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Requests sent whose replies are still unread.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// True when the connection can be handed to another caller.
    pub fn is_reusable(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self.pending == 0
            && self.decoder.buffered() == 0
    }

    /// Writes one request frame.
    pub fn send(&mut self, command: &Command) -> ClientResult<()> {
        self.send_many(std::slice::from_ref(command))
    }

    /// Writes several request frames with a single write.
    ///
    /// Encoding happens before anything touches the socket, so an encoding
    /// error leaves the connection usable.
    pub fn send_many(&mut self, commands: &[Command]) -> ClientResult<()> {
        if self.stream.is_none() {
            return Err(ConnectionError::Disconnected.into());
        }

        self.write_buf.clear();
        for command in commands {
            command.encode(&mut self.write_buf)?;
        }

        let result = match self.stream.as_mut() {
            Some(stream) => stream
                .write_all(&self.write_buf)
                .and_then(|_| stream.flush()),
            None => return Err(ConnectionError::Disconnected.into()),
        };
        if let Err(err) = result {
            self.fail("write");
            return Err(err.into());
        }

        self.pending += commands.len();
        debug!(count = commands.len(), bytes = self.write_buf.len(), "sent request frames");
        Ok(())
    }

    /// Blocks until the next reply arrives.
    pub fn receive(&mut self) -> ClientResult<Reply> {
        let result = match self.stream.as_mut() {
            Some(stream) => self.decoder.read_reply(stream),
            None => return Err(ConnectionError::Disconnected.into()),
        };
        match result {
            Ok(reply) => {
                self.pending = self.pending.saturating_sub(1);
                Ok(reply)
            }
            Err(err) => {
                self.fail("read");
                Err(err)
            }
        }
    }

    /// Sends one command and reads its reply.
    pub fn round_trip(&mut self, command: &Command) -> ClientResult<Reply> {
        self.send(command)?;
        self.receive()
    }

    /// Shuts the socket down. Unread replies are discarded.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.peer = None;
        self.decoder.clear();
        self.pending = 0;
    }

    /// Drops the current socket (if any) and opens a fresh one.
    pub fn reconnect(&mut self) -> ClientResult<()> {
        self.close();
        let (stream, peer) = connect_stream(&self.config)?;
        if let Some(timeout) = self.config.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = self.config.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.peer = Some(peer);

        if let Err(err) = self.handshake() {
            self.close();
            return Err(err);
        }
        debug!(%peer, "connected");
        Ok(())
    }

    fn handshake(&mut self) -> ClientResult<()> {
        match self.config.protocol {
            Protocol::Resp3 => {
                let mut hello = Command::new("HELLO").arg("3");
                if let Some(password) = &self.config.password {
                    hello = hello.arg("AUTH").arg("default").arg(password.as_str());
                }
                decoder::check(self.round_trip(&hello)?)?;
            }
            Protocol::Resp2 => {
                if let Some(password) = self.config.password.clone() {
                    let auth = Command::new("AUTH").arg(password.as_str());
                    decoder::expect_ok(self.round_trip(&auth)?)?;
                }
            }
        }
        Ok(())
    }

    fn fail(&mut self, during: &str) {
        warn!(peer = ?self.peer, pending = self.pending, "connection failed during {}; disconnecting", during);
        self.close();
    }
}

fn connect_stream(config: &ConnectionConfig) -> ClientResult<(TcpStream, SocketAddr)> {
    let mut last_err: Option<ClientError> = None;
    for addr in &config.addrs {
        let resolved = match addr.to_socket_addrs() {
            Ok(resolved) => resolved,
            Err(err) => {
                debug!(%addr, error = %err, "address did not resolve");
                last_err = Some(ConnectionError::InvalidAddress(addr.clone()).into());
                continue;
            }
        };
        for socket_addr in resolved {
            let attempt = match config.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&socket_addr, timeout),
                None => TcpStream::connect(socket_addr),
            };
            match attempt {
                Ok(stream) => return Ok((stream, socket_addr)),
                Err(err) => {
                    debug!(%socket_addr, error = %err, "connect attempt failed");
                    last_err = Some(err.into());
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ConnectionError::InvalidAddress(config.addrs.join(",")).into()))
}
