//! # Connection Pool
//!
//! Purpose: Hand each caller exclusive use of one connection for the length
//! of one command or one batch, and reuse connections across calls.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Scoped Checkout**: `PooledConnection` returns itself on drop, on every
//!    exit path including errors and panics.
//! 3. **Discard When Unsure**: A connection that failed, or still has an
//!    unread reply in flight, is closed instead of being returned.
//! 4. **Bounded Waiting**: Exhaustion fails at once, or after
//!    `checkout_timeout` when one is configured.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{ClientResult, ConnectionError};
use crate::transport::{Connection, ConnectionConfig};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub connection: ConnectionConfig,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// How long `acquire` waits when every slot is in use.
    pub checkout_timeout: Option<Duration>,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Counts reported by `ConnectionPool::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub total: usize,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                released: Condvar::new(),
            }),
        }
    }

    /// Checks out a connection, opening a new one when a slot is free.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        let deadline = self
            .inner
            .config
            .checkout_timeout
            .map(|timeout| Instant::now() + timeout);

        let mut state = self.inner.state.lock();
        loop {
            if let Some(conn) = state.idle.pop_front() {
                return Ok(PooledConnection::new(self.inner.clone(), conn));
            }
            if state.total < self.inner.config.max_total {
                state.total += 1;
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.released.wait_until(&mut state, deadline).timed_out()
                        && state.idle.is_empty()
                        && state.total >= self.inner.config.max_total
                    {
                        return Err(ConnectionError::PoolExhausted.into());
                    }
                }
                None => return Err(ConnectionError::PoolExhausted.into()),
            }
        }
        drop(state);

        // Connect outside the lock; the slot is already reserved.
        match Connection::connect(self.inner.config.connection.clone()) {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Err(err) => {
                self.inner.release_slot();
                Err(err)
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            total: state.total,
        }
    }
}

impl PoolInner {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.released.notify_one();
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.state.lock();
        if state.idle.len() < self.config.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
        drop(state);
        self.released.notify_one();
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `drop` takes the connection out.
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if conn.is_reusable() {
            debug!("returning connection to pool");
            self.pool.return_connection(conn);
        } else {
            // An unread reply would be handed to the next caller.
            warn!(pending = conn.pending(), state = ?conn.state(), "discarding connection");
            conn.close();
            self.pool.release_slot();
        }
    }
}
