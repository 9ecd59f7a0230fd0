//! # KVLink Sync Client
//!
//! Purpose: Provide a synchronous RESP client with connection pooling,
//! pipelined and transactional batches, and digest-addressed scripts.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Typed Edges**: Arguments go in through `ToArg`, replies come out as
//!    the Rust type each operation promises.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Frames are encoded and parsed explicitly, with
//!    RESP3 replies folded into the same `Reply` type as RESP2.

mod batch;
mod client;
mod commands;
mod config;
mod decoder;
mod encoder;
mod error;
mod pool;
mod script;
mod transport;

pub use batch::{Batch, BatchMode, BatchResult};
pub use client::{KVClient, TtlStatus};
pub use commands::{SetCondition, SetOptions};
pub use config::{ClientConfig, ClientConfigBuilder, Protocol, RetryPolicy, TtlUnit};
pub use encoder::{format_score, parse_score, Arg, Command, Score, ToArg};
pub use error::{ClientError, ClientResult, CommandError, ConnectionError, ErrorKind};
pub use kvlink_common::Reply;
pub use pool::PoolStatus;
pub use script::{Script, ScriptCache, ScriptState};
pub use transport::{Connection, ConnectionConfig, ConnectionState};
