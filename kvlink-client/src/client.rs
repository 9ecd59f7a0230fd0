//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for issuing RESP commands to a
//! key-value server, with pooling, batching and scripting behind one handle.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Typed Results**: Every operation decodes into the Rust type it
//!    promises; Nil is `None`, never an empty value.
//! 3. **One Checkout per Call**: A command, a batch or a script invocation
//!    holds one connection for its whole duration.
//! 4. **Explicit Retry**: Connection failures are retried only under a
//!    configured `RetryPolicy`, and never for atomic batches.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kvlink_common::Reply;
use tracing::{debug, warn};

use crate::batch::{self, Batch, BatchMode, BatchResult};
use crate::commands::{self, SetOptions};
use crate::config::{ClientConfig, RetryPolicy, TtlUnit};
use crate::decoder::{self, *};
use crate::encoder::{Command, ToArg};
use crate::error::{ClientError, ClientResult};
use crate::pool::{ConnectionPool, PoolConfig, PoolStatus};
use crate::script::{self, Script, ScriptCache};

/// TTL state returned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Synchronous client backed by a connection pool.
#[derive(Clone)]
pub struct KVClient {
    pool: ConnectionPool,
    ttl_unit: TtlUnit,
    retry: Option<RetryPolicy>,
    scripts: Arc<ScriptCache>,
}

impl KVClient {
    /// Creates a client with default settings for a single address.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        Self::with_config(ClientConfig::builder().addr(addr).build()?)
    }

    /// Creates a client from a validated configuration.
    ///
    /// No connection is opened until the first command.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(PoolConfig {
            connection: config.connection_config(),
            max_idle: config.max_idle,
            max_total: config.max_total,
            checkout_timeout: config.checkout_timeout,
        });
        debug!(addrs = ?config.addrs, max_total = config.max_total, "client created");
        Ok(KVClient {
            pool,
            ttl_unit: config.ttl_unit,
            retry: config.retry,
            scripts: ScriptCache::global(),
        })
    }

    /// Replaces the process-wide script cache with a private one.
    pub fn with_script_cache(mut self, cache: Arc<ScriptCache>) -> Self {
        self.scripts = cache;
        self
    }

    pub fn ttl_unit(&self) -> TtlUnit {
        self.ttl_unit
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn script_cache(&self) -> &Arc<ScriptCache> {
        &self.scripts
    }

    /// Sends one command and returns its reply; error replies become
    /// `ClientError::Command`.
    pub fn execute(&self, command: &Command) -> ClientResult<Reply> {
        decoder::check(self.execute_raw(command)?)
    }

    /// Escape hatch for commands without a typed method, verb first.
    pub fn custom_command<T: ToArg>(&self, parts: &[T]) -> ClientResult<Reply> {
        let command = Command::from_parts(parts)?;
        self.execute(&command)
    }

    /// Runs a batch on one connection.
    ///
    /// An empty batch returns an empty result without touching the network.
    pub fn execute_batch(&self, batch: &Batch) -> ClientResult<BatchResult> {
        if batch.is_empty() {
            return Ok(BatchResult::default());
        }
        match batch.mode() {
            BatchMode::Pipelined => self.with_retry(|| {
                let mut conn = self.pool.acquire()?;
                batch::run(&mut conn, batch)
            }),
            // The transaction may have committed before the failure.
            BatchMode::Atomic => {
                let mut conn = self.pool.acquire()?;
                batch::run(&mut conn, batch)
            }
        }
    }

    /// Invokes a script by digest, resending the body once on `NOSCRIPT`.
    pub fn invoke_script<K: ToArg, A: ToArg>(
        &self,
        script: &Script,
        keys: &[K],
        args: &[A],
    ) -> ClientResult<Reply> {
        let mut conn = self.pool.acquire()?;
        script::invoke(&mut conn, &self.scripts, script, keys, args)
    }

    /// Registers a script with `SCRIPT LOAD`, returning the server's digest.
    pub fn load_script(&self, script: &Script) -> ClientResult<String> {
        let reply = self.execute_raw(&Command::new("SCRIPT").arg("LOAD").arg(script.body()))?;
        let digest = String::from_utf8(expect_bytes(reply)?)
            .map_err(|_| ClientError::UnexpectedReply("script digest is not UTF-8".to_string()))?;
        if digest != script.digest() {
            warn!(local = script.digest(), server = %digest, "script digest mismatch");
        }
        self.scripts.mark_registered(&digest);
        Ok(digest)
    }

    /// Asks the server which of `scripts` it currently holds.
    pub fn script_exists(&self, scripts: &[&Script]) -> ClientResult<Vec<bool>> {
        let command = Command::new("SCRIPT")
            .arg("EXISTS")
            .args(scripts.iter().map(|script| script.digest()));
        match decoder::check(self.execute_raw(&command)?)? {
            Reply::Array(items) => items.into_iter().map(expect_bool).collect(),
            other => Err(ClientError::UnexpectedReply(format!(
                "expected array, got {}",
                other.tag()
            ))),
        }
    }

    /// Drops every script on the server and marks the local cache evicted.
    pub fn script_flush(&self) -> ClientResult<()> {
        expect_ok(self.execute_raw(&Command::new("SCRIPT").arg("FLUSH"))?)?;
        self.scripts.evict_all();
        Ok(())
    }

    pub fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        expect_bytes(self.execute_raw(&commands::ping(payload))?)
    }

    /// Verifies credentials on one pooled connection.
    ///
    /// New connections authenticate with `ClientConfig::password`; this call
    /// does not change what they send.
    pub fn auth(&self, password: &str) -> ClientResult<()> {
        expect_ok(self.execute_raw(&Command::new("AUTH").arg(password))?)
    }

    pub fn flush_all(&self) -> ClientResult<()> {
        expect_ok(self.execute_raw(&Command::new("FLUSHALL"))?)
    }

    pub fn info(&self, section: Option<&str>) -> ClientResult<String> {
        let command = match section {
            Some(section) => Command::new("INFO").arg(section),
            None => Command::new("INFO"),
        };
        let data = expect_bytes(self.execute_raw(&command)?)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub fn set<K: ToArg + ?Sized, V: ToArg + ?Sized>(&self, key: &K, value: &V) -> ClientResult<()> {
        expect_ok(self.execute_raw(&commands::set(key, value))?)
    }

    /// `SET` with a TTL in the configured unit.
    pub fn set_with_ttl<K: ToArg + ?Sized, V: ToArg + ?Sized>(
        &self,
        key: &K,
        value: &V,
        ttl: Duration,
    ) -> ClientResult<()> {
        let options = SetOptions::default().expiry(ttl);
        let command = commands::set_with_options(key, value, &options, self.ttl_unit)?;
        expect_ok(self.execute_raw(&command)?)
    }

    /// `SET` with options; returns false when an NX/XX condition blocked the write.
    pub fn set_with_options<K: ToArg + ?Sized, V: ToArg + ?Sized>(
        &self,
        key: &K,
        value: &V,
        options: &SetOptions,
    ) -> ClientResult<bool> {
        let command = commands::set_with_options(key, value, options, self.ttl_unit)?;
        match decoder::check(self.execute_raw(&command)?)? {
            Reply::Nil => Ok(false),
            reply => expect_ok(reply).map(|_| true),
        }
    }

    pub fn get<K: ToArg + ?Sized>(&self, key: &K) -> ClientResult<Option<Vec<u8>>> {
        expect_bulk(self.execute_raw(&commands::get(key))?)
    }

    pub fn mset<K: ToArg, V: ToArg>(&self, pairs: &[(K, V)]) -> ClientResult<()> {
        expect_ok(self.execute_raw(&commands::mset(pairs))?)
    }

    /// One entry per key, `None` for missing keys.
    pub fn mget<K: ToArg>(&self, keys: &[K]) -> ClientResult<Vec<Option<Vec<u8>>>> {
        expect_bulk_list(self.execute_raw(&commands::mget(keys))?)
    }

    pub fn incr<K: ToArg + ?Sized>(&self, key: &K) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::incr(key))?)
    }

    pub fn incr_by<K: ToArg + ?Sized>(&self, key: &K, delta: i64) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::incr_by(key, delta))?)
    }

    pub fn decr<K: ToArg + ?Sized>(&self, key: &K) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::decr(key))?)
    }

    pub fn decr_by<K: ToArg + ?Sized>(&self, key: &K, delta: i64) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::decr_by(key, delta))?)
    }

    /// Returns the length of the string after the append.
    pub fn append<K: ToArg + ?Sized, V: ToArg + ?Sized>(&self, key: &K, value: &V) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::append(key, value))?)
    }

    pub fn get_range<K: ToArg + ?Sized>(&self, key: &K, start: i64, end: i64) -> ClientResult<Vec<u8>> {
        expect_bytes(self.execute_raw(&commands::get_range(key, start, end))?)
    }

    pub fn set_range<K: ToArg + ?Sized, V: ToArg + ?Sized>(
        &self,
        key: &K,
        offset: u64,
        value: &V,
    ) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::set_range(key, offset, value))?)
    }

    /// Returns how many of `keys` were removed.
    pub fn del<K: ToArg>(&self, keys: &[K]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::del(keys))?)
    }

    pub fn exists<K: ToArg>(&self, keys: &[K]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::exists(keys))?)
    }

    /// Sets a TTL in the configured unit; false when the key does not exist.
    pub fn expire<K: ToArg + ?Sized>(&self, key: &K, ttl: Duration) -> ClientResult<bool> {
        let command = commands::expire(key, ttl, self.ttl_unit)?;
        expect_bool(self.execute_raw(&command)?)
    }

    pub fn ttl<K: ToArg + ?Sized>(&self, key: &K) -> ClientResult<TtlStatus> {
        match expect_int(self.execute_raw(&commands::ttl(key, self.ttl_unit))?)? {
            -2 => Ok(TtlStatus::Missing),
            -1 => Ok(TtlStatus::NoExpiry),
            value if value >= 0 => Ok(TtlStatus::ExpiresIn(self.ttl_unit.from_wire(value))),
            value => Err(ClientError::UnexpectedReply(format!("invalid ttl {}", value))),
        }
    }

    /// Removes the TTL; false when the key had none or does not exist.
    pub fn persist<K: ToArg + ?Sized>(&self, key: &K) -> ClientResult<bool> {
        expect_bool(self.execute_raw(&commands::persist(key))?)
    }

    pub fn keys(&self, pattern: &str) -> ClientResult<Vec<Vec<u8>>> {
        expect_bytes_list(self.execute_raw(&commands::keys(pattern))?)
    }

    /// One `SCAN` step; iteration is finished when the returned cursor is 0.
    pub fn scan(
        &self,
        cursor: u64,
        pattern: Option<&str>,
        count: Option<usize>,
    ) -> ClientResult<(u64, Vec<Vec<u8>>)> {
        let reply = decoder::check(self.execute_raw(&commands::scan(cursor, pattern, count))?)?;
        let mut items = match reply {
            Reply::Array(items) if items.len() == 2 => items.into_iter(),
            other => {
                return Err(ClientError::UnexpectedReply(format!(
                    "expected [cursor, keys], got {}",
                    other.tag()
                )))
            }
        };
        let (Some(cursor), Some(keys)) = (items.next(), items.next()) else {
            return Err(ClientError::UnexpectedReply("truncated scan reply".to_string()));
        };
        let cursor = std::str::from_utf8(&expect_bytes(cursor)?)
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or_else(|| ClientError::UnexpectedReply("invalid scan cursor".to_string()))?;
        Ok((cursor, expect_bytes_list(keys)?))
    }

    pub fn rename<K: ToArg + ?Sized, N: ToArg + ?Sized>(&self, key: &K, new_key: &N) -> ClientResult<()> {
        expect_ok(self.execute_raw(&commands::rename(key, new_key))?)
    }

    /// Renames only when `new_key` does not exist.
    pub fn rename_nx<K: ToArg + ?Sized, N: ToArg + ?Sized>(&self, key: &K, new_key: &N) -> ClientResult<bool> {
        expect_bool(self.execute_raw(&commands::rename_nx(key, new_key))?)
    }

    /// Returns the number of fields that were newly created.
    pub fn hset<K: ToArg + ?Sized, F: ToArg, V: ToArg>(&self, key: &K, fields: &[(F, V)]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::hset(key, fields))?)
    }

    pub fn hget<K: ToArg + ?Sized, F: ToArg + ?Sized>(&self, key: &K, field: &F) -> ClientResult<Option<Vec<u8>>> {
        expect_bulk(self.execute_raw(&commands::hget(key, field))?)
    }

    pub fn hmget<K: ToArg + ?Sized, F: ToArg>(&self, key: &K, fields: &[F]) -> ClientResult<Vec<Option<Vec<u8>>>> {
        expect_bulk_list(self.execute_raw(&commands::hmget(key, fields))?)
    }

    /// All field/value pairs; RESP2 arrays and RESP3 maps decode the same.
    pub fn hgetall<K: ToArg + ?Sized>(&self, key: &K) -> ClientResult<Vec<(Vec<u8>, Vec<u8>)>> {
        expect_pairs(self.execute_raw(&commands::hgetall(key))?)
    }

    pub fn hdel<K: ToArg + ?Sized, F: ToArg>(&self, key: &K, fields: &[F]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::hdel(key, fields))?)
    }

    pub fn hexists<K: ToArg + ?Sized, F: ToArg + ?Sized>(&self, key: &K, field: &F) -> ClientResult<bool> {
        expect_bool(self.execute_raw(&commands::hexists(key, field))?)
    }

    /// Returns the list length after the push.
    pub fn lpush<K: ToArg + ?Sized, V: ToArg>(&self, key: &K, values: &[V]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::lpush(key, values))?)
    }

    pub fn rpush<K: ToArg + ?Sized, V: ToArg>(&self, key: &K, values: &[V]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::rpush(key, values))?)
    }

    pub fn lpop<K: ToArg + ?Sized>(&self, key: &K) -> ClientResult<Option<Vec<u8>>> {
        expect_bulk(self.execute_raw(&commands::lpop(key))?)
    }

    pub fn rpop<K: ToArg + ?Sized>(&self, key: &K) -> ClientResult<Option<Vec<u8>>> {
        expect_bulk(self.execute_raw(&commands::rpop(key))?)
    }

    pub fn lrange<K: ToArg + ?Sized>(&self, key: &K, start: i64, stop: i64) -> ClientResult<Vec<Vec<u8>>> {
        expect_bytes_list(self.execute_raw(&commands::lrange(key, start, stop))?)
    }

    /// Returns how many members were newly added.
    pub fn sadd<K: ToArg + ?Sized, M: ToArg>(&self, key: &K, members: &[M]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::sadd(key, members))?)
    }

    pub fn srem<K: ToArg + ?Sized, M: ToArg>(&self, key: &K, members: &[M]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::srem(key, members))?)
    }

    pub fn smembers<K: ToArg + ?Sized>(&self, key: &K) -> ClientResult<Vec<Vec<u8>>> {
        expect_bytes_list(self.execute_raw(&commands::smembers(key))?)
    }

    pub fn sismember<K: ToArg + ?Sized, M: ToArg + ?Sized>(&self, key: &K, member: &M) -> ClientResult<bool> {
        expect_bool(self.execute_raw(&commands::sismember(key, member))?)
    }

    /// Adds `(score, member)` pairs; returns how many members were new.
    pub fn zadd<K: ToArg + ?Sized, M: ToArg>(&self, key: &K, members: &[(f64, M)]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::zadd(key, members))?)
    }

    pub fn zrem<K: ToArg + ?Sized, M: ToArg>(&self, key: &K, members: &[M]) -> ClientResult<i64> {
        expect_int(self.execute_raw(&commands::zrem(key, members))?)
    }

    pub fn zscore<K: ToArg + ?Sized, M: ToArg + ?Sized>(&self, key: &K, member: &M) -> ClientResult<Option<f64>> {
        expect_score(self.execute_raw(&commands::zscore(key, member))?)
    }

    pub fn zrange<K: ToArg + ?Sized>(&self, key: &K, start: i64, stop: i64) -> ClientResult<Vec<Vec<u8>>> {
        expect_bytes_list(self.execute_raw(&commands::zrange(key, start, stop, false))?)
    }

    pub fn zrange_with_scores<K: ToArg + ?Sized>(
        &self,
        key: &K,
        start: i64,
        stop: i64,
    ) -> ClientResult<Vec<(Vec<u8>, f64)>> {
        expect_scored_members(self.execute_raw(&commands::zrange(key, start, stop, true))?)
    }

    pub fn zrank<K: ToArg + ?Sized, M: ToArg + ?Sized>(&self, key: &K, member: &M) -> ClientResult<Option<i64>> {
        expect_opt_int(self.execute_raw(&commands::zrank(key, member))?)
    }

    pub fn zrevrank<K: ToArg + ?Sized, M: ToArg + ?Sized>(&self, key: &K, member: &M) -> ClientResult<Option<i64>> {
        expect_opt_int(self.execute_raw(&commands::zrevrank(key, member))?)
    }

    /// Sends one command on a pooled connection and returns the raw reply.
    fn execute_raw(&self, command: &Command) -> ClientResult<Reply> {
        self.with_retry(|| {
            let mut conn = self.pool.acquire()?;
            conn.round_trip(command)
        })
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> ClientResult<T>) -> ClientResult<T> {
        let (attempts, backoff) = match &self.retry {
            Some(policy) => (policy.max_attempts.max(1), policy.backoff),
            None => (1, Duration::ZERO),
        };
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(attempt, max_attempts = attempts, error = %err, "retrying after connection failure");
                    if !backoff.is_zero() {
                        thread::sleep(backoff);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
