//! # KVLink Reference Server
//!
//! Purpose: A small in-memory RESP server that speaks the subset of the
//! protocol the kvlink client uses, so the client can be tested end to end
//! without an external server.
//!
//! ## Design Principles
//! 1. **One Keyspace Lock**: Single commands, transactions and scripts each
//!    take the store lock once, so they never interleave.
//! 2. **Session State per Connection**: Protocol version, authentication and
//!    the `MULTI` queue belong to the connection, not the keyspace.
//! 3. **Wire-Exact Errors**: Error replies carry the codes clients branch on
//!    (`WRONGTYPE`, `NOSCRIPT`, `EXECABORT`, `NOAUTH`, `WRONGPASS`).
//!
//! ## Quick Start
//! ```no_run
//! use kvlink_server::{spawn, ServerConfig};
//!
//! let handle = spawn(ServerConfig::ephemeral())?;
//! println!("listening on {}", handle.addr());
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod script;
pub mod server;
pub mod store;

pub use config::ServerConfig;
pub use error::{CommandError, CommandResult};
pub use server::{handle_connection, spawn, Server, ServerHandle, ServerState};
