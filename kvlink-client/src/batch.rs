//! # Batch Executor
//!
//! Purpose: Send an ordered group of commands on one connection and collect
//! one reply per command, either pipelined or inside `MULTI`/`EXEC`.
//!
//! ## Design Principles
//! 1. **Positional Results**: `BatchResult[i]` is the reply to command `i`;
//!    per-command error replies stay in place instead of failing the batch.
//! 2. **Single Write**: Every frame of a batch, including `MULTI` and `EXEC`,
//!    goes out in one write.
//! 3. **All or Nothing Rejection**: An atomic batch the server refuses to
//!    execute surfaces as one `BatchRejected`, never as partial results.

use kvlink_common::Reply;
use tracing::{debug, warn};

use crate::commands;
use crate::encoder::{Command, ToArg};
use crate::error::{ClientError, ClientResult, CommandError, ErrorKind};
use crate::transport::Connection;

/// How a batch is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Frames are written together; other clients may interleave.
    Pipelined,
    /// Wrapped in `MULTI`/`EXEC`; runs without interleaving.
    Atomic,
}

/// Ordered commands awaiting execution.
#[derive(Debug, Clone)]
pub struct Batch {
    mode: BatchMode,
    commands: Vec<Command>,
}

impl Batch {
    pub fn new(mode: BatchMode) -> Self {
        Batch {
            mode,
            commands: Vec::new(),
        }
    }

    pub fn pipeline() -> Self {
        Self::new(BatchMode::Pipelined)
    }

    pub fn atomic() -> Self {
        Self::new(BatchMode::Atomic)
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    pub fn add(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn set<K: ToArg + ?Sized, V: ToArg + ?Sized>(&mut self, key: &K, value: &V) -> &mut Self {
        self.add(commands::set(key, value))
    }

    pub fn get<K: ToArg + ?Sized>(&mut self, key: &K) -> &mut Self {
        self.add(commands::get(key))
    }

    pub fn incr<K: ToArg + ?Sized>(&mut self, key: &K) -> &mut Self {
        self.add(commands::incr(key))
    }

    pub fn del<K: ToArg>(&mut self, keys: &[K]) -> &mut Self {
        self.add(commands::del(keys))
    }

    pub fn hset<K: ToArg + ?Sized, F: ToArg, V: ToArg>(
        &mut self,
        key: &K,
        fields: &[(F, V)],
    ) -> &mut Self {
        self.add(commands::hset(key, fields))
    }

    pub fn rpush<K: ToArg + ?Sized, V: ToArg>(&mut self, key: &K, values: &[V]) -> &mut Self {
        self.add(commands::rpush(key, values))
    }

    pub fn sadd<K: ToArg + ?Sized, M: ToArg>(&mut self, key: &K, members: &[M]) -> &mut Self {
        self.add(commands::sadd(key, members))
    }

    pub fn zadd<K: ToArg + ?Sized, M: ToArg>(&mut self, key: &K, members: &[(f64, M)]) -> &mut Self {
        self.add(commands::zadd(key, members))
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// One reply per batched command, in submission order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchResult(Vec<Reply>);

impl BatchResult {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Reply> {
        self.0.get(index)
    }

    pub fn replies(&self) -> &[Reply] {
        &self.0
    }

    pub fn into_replies(self) -> Vec<Reply> {
        self.0
    }

    /// True when any command in the batch answered with an error reply.
    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Reply::is_error)
    }
}

/// Runs `batch` on an already checked-out connection.
pub(crate) fn run(conn: &mut Connection, batch: &Batch) -> ClientResult<BatchResult> {
    if batch.is_empty() {
        return Ok(BatchResult::default());
    }
    match batch.mode {
        BatchMode::Pipelined => run_pipelined(conn, &batch.commands),
        BatchMode::Atomic => run_atomic(conn, &batch.commands),
    }
}

fn run_pipelined(conn: &mut Connection, commands: &[Command]) -> ClientResult<BatchResult> {
    conn.send_many(commands)?;
    let mut replies = Vec::with_capacity(commands.len());
    for _ in commands {
        replies.push(conn.receive()?);
    }
    debug!(count = replies.len(), "pipeline completed");
    Ok(BatchResult(replies))
}

fn run_atomic(conn: &mut Connection, commands: &[Command]) -> ClientResult<BatchResult> {
    let mut frames = Vec::with_capacity(commands.len() + 2);
    frames.push(Command::new("MULTI"));
    frames.extend(commands.iter().cloned());
    frames.push(Command::new("EXEC"));
    conn.send_many(&frames)?;

    // Every reply is drained before deciding, so the connection stays in sync.
    let multi = conn.receive()?;
    let mut queue_error: Option<String> = None;
    for _ in commands {
        if let Reply::Error(message) = conn.receive()? {
            queue_error.get_or_insert(message);
        }
    }
    let exec = conn.receive()?;

    if let Reply::Error(message) = multi {
        return Err(CommandError::parse(&message).into());
    }

    match exec {
        Reply::Array(replies) if replies.len() == commands.len() => {
            debug!(count = replies.len(), "transaction committed");
            Ok(BatchResult(replies))
        }
        Reply::Array(replies) => Err(ClientError::UnexpectedReply(format!(
            "EXEC returned {} replies for {} commands",
            replies.len(),
            commands.len()
        ))),
        Reply::Nil => {
            warn!("transaction aborted by server");
            Err(ClientError::BatchRejected(
                queue_error.unwrap_or_else(|| "transaction aborted".to_string()),
            ))
        }
        Reply::Error(message) => {
            let err = CommandError::parse(&message);
            if err.kind() == ErrorKind::ExecAbort {
                warn!(reason = %err, "transaction discarded");
                Err(ClientError::BatchRejected(queue_error.unwrap_or(message)))
            } else {
                Err(err.into())
            }
        }
        other => Err(ClientError::UnexpectedReply(format!(
            "expected array from EXEC, got {}",
            other.tag()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_append_in_order() {
        let mut batch = Batch::atomic();
        batch.set("k", "v").get("k").incr("n");
        let names: Vec<&str> = batch.commands().iter().map(Command::name).collect();
        assert_eq!(names, ["SET", "GET", "INCR"]);
        assert_eq!(batch.mode(), BatchMode::Atomic);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn result_reports_positional_errors() {
        let result = BatchResult(vec![Reply::ok(), Reply::error("WRONGTYPE nope")]);
        assert!(result.has_errors());
        assert_eq!(result.get(0), Some(&Reply::ok()));
        assert!(result.get(1).map(Reply::is_error).unwrap_or(false));
    }
}
