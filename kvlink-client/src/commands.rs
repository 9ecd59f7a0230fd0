//! Constructors for the commands the typed API issues.
//!
//! Shared by `KVClient` (one command per call) and `Batch` (accumulated
//! commands), so both produce identical frames for the same operation.

use std::time::Duration;

use crate::config::TtlUnit;
use crate::encoder::{Command, Score, ToArg};
use crate::error::ClientResult;

/// Write condition for `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    /// `NX`: only write when the key does not exist.
    IfAbsent,
    /// `XX`: only write when the key already exists.
    IfPresent,
}

/// Options for `SET`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub expiry: Option<Duration>,
    pub condition: Option<SetCondition>,
}

impl SetOptions {
    pub fn expiry(mut self, ttl: Duration) -> Self {
        self.expiry = Some(ttl);
        self
    }

    pub fn only_if_absent(mut self) -> Self {
        self.condition = Some(SetCondition::IfAbsent);
        self
    }

    pub fn only_if_present(mut self) -> Self {
        self.condition = Some(SetCondition::IfPresent);
        self
    }
}

pub fn ping(payload: Option<&[u8]>) -> Command {
    match payload {
        Some(data) => Command::new("PING").arg(data),
        None => Command::new("PING"),
    }
}

pub fn set<K: ToArg + ?Sized, V: ToArg + ?Sized>(key: &K, value: &V) -> Command {
    Command::new("SET").arg(key).arg(value)
}

pub fn set_with_options<K: ToArg + ?Sized, V: ToArg + ?Sized>(
    key: &K,
    value: &V,
    options: &SetOptions,
    unit: TtlUnit,
) -> ClientResult<Command> {
    let mut command = set(key, value);
    if let Some(ttl) = options.expiry {
        command = command.arg(unit.set_option()).arg(&unit.to_wire(ttl)?);
    }
    match options.condition {
        Some(SetCondition::IfAbsent) => command = command.arg("NX"),
        Some(SetCondition::IfPresent) => command = command.arg("XX"),
        None => {}
    }
    Ok(command)
}

pub fn get<K: ToArg + ?Sized>(key: &K) -> Command {
    Command::new("GET").arg(key)
}

pub fn mset<K: ToArg, V: ToArg>(pairs: &[(K, V)]) -> Command {
    pairs
        .iter()
        .fold(Command::new("MSET"), |cmd, (key, value)| cmd.arg(key).arg(value))
}

pub fn mget<K: ToArg>(keys: &[K]) -> Command {
    Command::new("MGET").args(keys)
}

pub fn incr<K: ToArg + ?Sized>(key: &K) -> Command {
    Command::new("INCR").arg(key)
}

pub fn incr_by<K: ToArg + ?Sized>(key: &K, delta: i64) -> Command {
    Command::new("INCRBY").arg(key).arg(&delta)
}

pub fn decr<K: ToArg + ?Sized>(key: &K) -> Command {
    Command::new("DECR").arg(key)
}

pub fn decr_by<K: ToArg + ?Sized>(key: &K, delta: i64) -> Command {
    Command::new("DECRBY").arg(key).arg(&delta)
}

pub fn append<K: ToArg + ?Sized, V: ToArg + ?Sized>(key: &K, value: &V) -> Command {
    Command::new("APPEND").arg(key).arg(value)
}

pub fn get_range<K: ToArg + ?Sized>(key: &K, start: i64, end: i64) -> Command {
    Command::new("GETRANGE").arg(key).arg(&start).arg(&end)
}

pub fn set_range<K: ToArg + ?Sized, V: ToArg + ?Sized>(key: &K, offset: u64, value: &V) -> Command {
    Command::new("SETRANGE").arg(key).arg(&offset).arg(value)
}

pub fn del<K: ToArg>(keys: &[K]) -> Command {
    Command::new("DEL").args(keys)
}

pub fn exists<K: ToArg>(keys: &[K]) -> Command {
    Command::new("EXISTS").args(keys)
}

pub fn expire<K: ToArg + ?Sized>(key: &K, ttl: Duration, unit: TtlUnit) -> ClientResult<Command> {
    Ok(Command::new(unit.expire_command()).arg(key).arg(&unit.to_wire(ttl)?))
}

pub fn ttl<K: ToArg + ?Sized>(key: &K, unit: TtlUnit) -> Command {
    Command::new(unit.ttl_command()).arg(key)
}

pub fn persist<K: ToArg + ?Sized>(key: &K) -> Command {
    Command::new("PERSIST").arg(key)
}

pub fn keys(pattern: &str) -> Command {
    Command::new("KEYS").arg(pattern)
}

pub fn scan(cursor: u64, pattern: Option<&str>, count: Option<usize>) -> Command {
    let mut command = Command::new("SCAN").arg(&cursor);
    if let Some(pattern) = pattern {
        command = command.arg("MATCH").arg(pattern);
    }
    if let Some(count) = count {
        command = command.arg("COUNT").arg(&count);
    }
    command
}

pub fn rename<K: ToArg + ?Sized, N: ToArg + ?Sized>(key: &K, new_key: &N) -> Command {
    Command::new("RENAME").arg(key).arg(new_key)
}

pub fn rename_nx<K: ToArg + ?Sized, N: ToArg + ?Sized>(key: &K, new_key: &N) -> Command {
    Command::new("RENAMENX").arg(key).arg(new_key)
}

pub fn hset<K: ToArg + ?Sized, F: ToArg, V: ToArg>(key: &K, fields: &[(F, V)]) -> Command {
    fields
        .iter()
        .fold(Command::new("HSET").arg(key), |cmd, (field, value)| {
            cmd.arg(field).arg(value)
        })
}

pub fn hget<K: ToArg + ?Sized, F: ToArg + ?Sized>(key: &K, field: &F) -> Command {
    Command::new("HGET").arg(key).arg(field)
}

pub fn hmget<K: ToArg + ?Sized, F: ToArg>(key: &K, fields: &[F]) -> Command {
    Command::new("HMGET").arg(key).args(fields)
}

pub fn hgetall<K: ToArg + ?Sized>(key: &K) -> Command {
    Command::new("HGETALL").arg(key)
}

pub fn hdel<K: ToArg + ?Sized, F: ToArg>(key: &K, fields: &[F]) -> Command {
    Command::new("HDEL").arg(key).args(fields)
}

pub fn hexists<K: ToArg + ?Sized, F: ToArg + ?Sized>(key: &K, field: &F) -> Command {
    Command::new("HEXISTS").arg(key).arg(field)
}

pub fn lpush<K: ToArg + ?Sized, V: ToArg>(key: &K, values: &[V]) -> Command {
    Command::new("LPUSH").arg(key).args(values)
}

pub fn rpush<K: ToArg + ?Sized, V: ToArg>(key: &K, values: &[V]) -> Command {
    Command::new("RPUSH").arg(key).args(values)
}

pub fn lpop<K: ToArg + ?Sized>(key: &K) -> Command {
    Command::new("LPOP").arg(key)
}

pub fn rpop<K: ToArg + ?Sized>(key: &K) -> Command {
    Command::new("RPOP").arg(key)
}

pub fn lrange<K: ToArg + ?Sized>(key: &K, start: i64, stop: i64) -> Command {
    Command::new("LRANGE").arg(key).arg(&start).arg(&stop)
}

pub fn sadd<K: ToArg + ?Sized, M: ToArg>(key: &K, members: &[M]) -> Command {
    Command::new("SADD").arg(key).args(members)
}

pub fn srem<K: ToArg + ?Sized, M: ToArg>(key: &K, members: &[M]) -> Command {
    Command::new("SREM").arg(key).args(members)
}

pub fn smembers<K: ToArg + ?Sized>(key: &K) -> Command {
    Command::new("SMEMBERS").arg(key)
}

pub fn sismember<K: ToArg + ?Sized, M: ToArg + ?Sized>(key: &K, member: &M) -> Command {
    Command::new("SISMEMBER").arg(key).arg(member)
}

pub fn zadd<K: ToArg + ?Sized, M: ToArg>(key: &K, members: &[(f64, M)]) -> Command {
    members
        .iter()
        .fold(Command::new("ZADD").arg(key), |cmd, (score, member)| {
            cmd.arg(&Score(*score)).arg(member)
        })
}

pub fn zrem<K: ToArg + ?Sized, M: ToArg>(key: &K, members: &[M]) -> Command {
    Command::new("ZREM").arg(key).args(members)
}

pub fn zscore<K: ToArg + ?Sized, M: ToArg + ?Sized>(key: &K, member: &M) -> Command {
    Command::new("ZSCORE").arg(key).arg(member)
}

pub fn zrange<K: ToArg + ?Sized>(key: &K, start: i64, stop: i64, with_scores: bool) -> Command {
    let command = Command::new("ZRANGE").arg(key).arg(&start).arg(&stop);
    if with_scores {
        command.arg("WITHSCORES")
    } else {
        command
    }
}

pub fn zrank<K: ToArg + ?Sized, M: ToArg + ?Sized>(key: &K, member: &M) -> Command {
    Command::new("ZRANK").arg(key).arg(member)
}

pub fn zrevrank<K: ToArg + ?Sized, M: ToArg + ?Sized>(key: &K, member: &M) -> Command {
    Command::new("ZREVRANK").arg(key).arg(member)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Arg;

    fn wire(command: &Command) -> Vec<String> {
        std::iter::once(command.name().to_string())
            .chain(command.arguments().iter().map(|arg| {
                String::from_utf8(arg.to_wire().unwrap()).unwrap()
            }))
            .collect()
    }

    #[test]
    fn set_options_follow_ttl_unit() {
        let options = SetOptions::default()
            .expiry(Duration::from_secs(60))
            .only_if_absent();
        let seconds = set_with_options("k", "v", &options, TtlUnit::Seconds).unwrap();
        assert_eq!(wire(&seconds), ["SET", "k", "v", "EX", "60", "NX"]);

        let millis = set_with_options("k", "v", &options, TtlUnit::Milliseconds).unwrap();
        assert_eq!(wire(&millis), ["SET", "k", "v", "PX", "60000", "NX"]);
    }

    #[test]
    fn expire_uses_unit_specific_verb() {
        let cmd = expire("k", Duration::from_millis(1500), TtlUnit::Milliseconds).unwrap();
        assert_eq!(wire(&cmd), ["PEXPIRE", "k", "1500"]);
        assert!(expire("k", Duration::from_millis(1500), TtlUnit::Seconds).is_err());
        assert_eq!(wire(&ttl("k", TtlUnit::Seconds)), ["TTL", "k"]);
    }

    #[test]
    fn variadic_commands_keep_order() {
        assert_eq!(
            wire(&mset(&[("k1", "v1"), ("k2", "v2")])),
            ["MSET", "k1", "v1", "k2", "v2"]
        );
        assert_eq!(
            wire(&zadd("z", &[(1.0, "one"), (2.5, "two")])),
            ["ZADD", "z", "1", "one", "2.5", "two"]
        );
        assert_eq!(
            wire(&hset("h", &[("name", "John"), ("age", "30")])),
            ["HSET", "h", "name", "John", "age", "30"]
        );
    }

    #[test]
    fn scan_options_are_optional() {
        assert_eq!(wire(&scan(0, None, None)), ["SCAN", "0"]);
        assert_eq!(
            wire(&scan(12, Some("test*"), Some(100))),
            ["SCAN", "12", "MATCH", "test*", "COUNT", "100"]
        );
        assert_eq!(zrange("z", 0, -1, true).arguments().last(), Some(&Arg::Bytes(b"WITHSCORES".to_vec())));
    }
}
