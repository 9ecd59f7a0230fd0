//! # Data Commands
//!
//! Dispatch table and handlers for every keyspace command the reference
//! server understands.
//!
//! ## Design Principles
//! 1. **Table Driven**: Each command is one `CommandDef` row with its arity,
//!    so queue-time validation and execution agree on what exists.
//! 2. **Caller Holds the Lock**: Handlers take `&mut Db`; the caller decides
//!    how many commands run under one lock (one, a transaction, a script).
//! 3. **Errors Are Replies**: Handlers return `CommandError`, which the
//!    connection turns into an error reply. Nothing here closes a connection.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use kvlink_common::{Reply, RespVersion};

use crate::error::{CommandError, CommandResult};
use crate::store::{ByteMap, ByteSet, Db, SortedSet, Value};

/// Per-command execution context.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub version: RespVersion,
    pub now: Instant,
}

/// Largest string `SETRANGE` may produce.
const MAX_STRING_LEN: usize = 512 * 1024 * 1024;

type Handler = fn(&mut Db, &[Vec<u8>], &Context) -> CommandResult;

/// One row of the command table.
pub struct CommandDef {
    pub name: &'static str,
    /// Exact argument count including the verb; negative means "at least".
    pub arity: i32,
    handler: Handler,
}

static COMMANDS: &[CommandDef] = &[
    CommandDef { name: "PING", arity: -1, handler: ping },
    CommandDef { name: "ECHO", arity: 2, handler: echo },
    CommandDef { name: "GET", arity: 2, handler: get },
    CommandDef { name: "SET", arity: -3, handler: set },
    CommandDef { name: "MSET", arity: -3, handler: mset },
    CommandDef { name: "MGET", arity: -2, handler: mget },
    CommandDef { name: "INCR", arity: 2, handler: incr },
    CommandDef { name: "DECR", arity: 2, handler: decr },
    CommandDef { name: "INCRBY", arity: 3, handler: incrby },
    CommandDef { name: "DECRBY", arity: 3, handler: decrby },
    CommandDef { name: "APPEND", arity: 3, handler: append },
    CommandDef { name: "STRLEN", arity: 2, handler: strlen },
    CommandDef { name: "GETRANGE", arity: 4, handler: getrange },
    CommandDef { name: "SETRANGE", arity: 4, handler: setrange },
    CommandDef { name: "DEL", arity: -2, handler: del },
    CommandDef { name: "EXISTS", arity: -2, handler: exists },
    CommandDef { name: "TYPE", arity: 2, handler: type_of },
    CommandDef { name: "EXPIRE", arity: 3, handler: expire },
    CommandDef { name: "PEXPIRE", arity: 3, handler: pexpire },
    CommandDef { name: "TTL", arity: 2, handler: ttl },
    CommandDef { name: "PTTL", arity: 2, handler: pttl },
    CommandDef { name: "PERSIST", arity: 2, handler: persist },
    CommandDef { name: "KEYS", arity: 2, handler: keys },
    CommandDef { name: "SCAN", arity: -2, handler: scan },
    CommandDef { name: "RENAME", arity: 3, handler: rename },
    CommandDef { name: "RENAMENX", arity: 3, handler: renamenx },
    CommandDef { name: "DBSIZE", arity: 1, handler: dbsize },
    CommandDef { name: "FLUSHALL", arity: -1, handler: flushall },
    CommandDef { name: "HSET", arity: -4, handler: hset },
    CommandDef { name: "HGET", arity: 3, handler: hget },
    CommandDef { name: "HMGET", arity: -3, handler: hmget },
    CommandDef { name: "HGETALL", arity: 2, handler: hgetall },
    CommandDef { name: "HDEL", arity: -3, handler: hdel },
    CommandDef { name: "HEXISTS", arity: 3, handler: hexists },
    CommandDef { name: "HLEN", arity: 2, handler: hlen },
    CommandDef { name: "LPUSH", arity: -3, handler: lpush },
    CommandDef { name: "RPUSH", arity: -3, handler: rpush },
    CommandDef { name: "LPOP", arity: 2, handler: lpop },
    CommandDef { name: "RPOP", arity: 2, handler: rpop },
    CommandDef { name: "LRANGE", arity: 4, handler: lrange },
    CommandDef { name: "LLEN", arity: 2, handler: llen },
    CommandDef { name: "SADD", arity: -3, handler: sadd },
    CommandDef { name: "SREM", arity: -3, handler: srem },
    CommandDef { name: "SMEMBERS", arity: 2, handler: smembers },
    CommandDef { name: "SISMEMBER", arity: 3, handler: sismember },
    CommandDef { name: "SCARD", arity: 2, handler: scard },
    CommandDef { name: "ZADD", arity: -4, handler: zadd },
    CommandDef { name: "ZREM", arity: -3, handler: zrem },
    CommandDef { name: "ZSCORE", arity: 3, handler: zscore },
    CommandDef { name: "ZRANGE", arity: -4, handler: zrange },
    CommandDef { name: "ZRANK", arity: 3, handler: zrank },
    CommandDef { name: "ZREVRANK", arity: 3, handler: zrevrank },
    CommandDef { name: "ZCARD", arity: 2, handler: zcard },
];

/// Finds the table row for a verb, case-insensitively.
pub fn lookup(name: &[u8]) -> Option<&'static CommandDef> {
    COMMANDS
        .iter()
        .find(|def| eq_ignore_ascii_case(def.name.as_bytes(), name))
}

impl CommandDef {
    pub fn check_arity(&self, argc: usize) -> Result<(), CommandError> {
        let argc = argc as i64;
        let arity = i64::from(self.arity);
        let ok = if arity >= 0 { argc == arity } else { argc >= -arity };
        if ok {
            Ok(())
        } else {
            Err(CommandError::WrongArity(self.name.to_ascii_lowercase()))
        }
    }
}

/// Checks that a command exists and has a valid argument count.
pub fn validate(args: &[Vec<u8>]) -> Result<&'static CommandDef, CommandError> {
    let name = args
        .first()
        .ok_or_else(|| CommandError::Other("empty command".to_string()))?;
    let def = lookup(name)
        .ok_or_else(|| CommandError::UnknownCommand(String::from_utf8_lossy(name).into_owned()))?;
    def.check_arity(args.len())?;
    Ok(def)
}

/// Runs one data command against `db`.
pub fn execute(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> Reply {
    match validate(args).and_then(|def| (def.handler)(db, args, ctx)) {
        Ok(reply) => reply,
        Err(err) => err.into(),
    }
}

fn ping(_: &mut Db, args: &[Vec<u8>], _: &Context) -> CommandResult {
    match args.len() {
        1 => Ok(Reply::SimpleString("PONG".to_string())),
        2 => Ok(Reply::bulk(args[1].clone())),
        _ => Err(CommandError::WrongArity("ping".to_string())),
    }
}

fn echo(_: &mut Db, args: &[Vec<u8>], _: &Context) -> CommandResult {
    Ok(Reply::bulk(args[1].clone()))
}

fn get(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    Ok(match read_str(db, &args[1], ctx.now)? {
        Some(data) => Reply::bulk(data.clone()),
        None => Reply::Nil,
    })
}

fn set(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let mut ttl: Option<Duration> = None;
    let mut only_absent = false;
    let mut only_present = false;

    let mut idx = 3;
    while idx < args.len() {
        let option = upper(&args[idx]);
        match option.as_str() {
            "EX" | "PX" if ttl.is_none() => {
                let raw = args.get(idx + 1).ok_or(CommandError::Syntax)?;
                let amount = parse_int(raw)?;
                if amount <= 0 {
                    return Err(CommandError::InvalidExpire("set".to_string()));
                }
                ttl = Some(if option == "EX" {
                    Duration::from_secs(amount as u64)
                } else {
                    Duration::from_millis(amount as u64)
                });
                idx += 2;
            }
            "NX" if !only_present => {
                only_absent = true;
                idx += 1;
            }
            "XX" if !only_absent => {
                only_present = true;
                idx += 1;
            }
            _ => return Err(CommandError::Syntax),
        }
    }

    let exists = db.contains(&args[1], ctx.now);
    if (only_absent && exists) || (only_present && !exists) {
        return Ok(Reply::Nil);
    }
    let deadline = ttl.map(|ttl| ctx.now + ttl);
    db.insert(args[1].clone(), Value::Str(args[2].clone()), deadline);
    Ok(Reply::ok())
}

fn mset(db: &mut Db, args: &[Vec<u8>], _: &Context) -> CommandResult {
    if args.len() % 2 == 0 {
        return Err(CommandError::WrongArity("mset".to_string()));
    }
    for pair in args[1..].chunks(2) {
        db.insert(pair[0].clone(), Value::Str(pair[1].clone()), None);
    }
    Ok(Reply::ok())
}

fn mget(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let items = args[1..]
        .iter()
        .map(|key| match db.get(key, ctx.now) {
            Some(Value::Str(data)) => Reply::bulk(data.clone()),
            _ => Reply::Nil,
        })
        .collect();
    Ok(Reply::Array(items))
}

fn incr(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    incr_by(db, &args[1], 1, ctx.now)
}

fn decr(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    incr_by(db, &args[1], -1, ctx.now)
}

fn incrby(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    incr_by(db, &args[1], parse_int(&args[2])?, ctx.now)
}

fn decrby(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let delta = parse_int(&args[2])?
        .checked_neg()
        .ok_or(CommandError::Overflow)?;
    incr_by(db, &args[1], delta, ctx.now)
}

// Updates in place so an existing TTL survives.
fn incr_by(db: &mut Db, key: &[u8], delta: i64, now: Instant) -> CommandResult {
    match db.get_mut(key, now) {
        Some(Value::Str(data)) => {
            let current = parse_int(data)?;
            let next = current.checked_add(delta).ok_or(CommandError::Overflow)?;
            *data = next.to_string().into_bytes();
            Ok(Reply::Integer(next))
        }
        Some(_) => Err(CommandError::WrongType),
        None => {
            db.insert(key.to_vec(), Value::Str(delta.to_string().into_bytes()), None);
            Ok(Reply::Integer(delta))
        }
    }
}

fn append(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    match db.get_or_insert_with(&args[1], ctx.now, || Value::Str(Vec::new())) {
        Value::Str(data) => {
            data.extend_from_slice(&args[2]);
            Ok(Reply::Integer(data.len() as i64))
        }
        _ => Err(CommandError::WrongType),
    }
}

fn strlen(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let len = read_str(db, &args[1], ctx.now)?.map_or(0, |data| data.len());
    Ok(Reply::Integer(len as i64))
}

fn getrange(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let start = parse_int(&args[2])?;
    let stop = parse_int(&args[3])?;
    let data = read_str(db, &args[1], ctx.now)?.map(Vec::as_slice).unwrap_or(&[]);
    Ok(match normalize_range(start, stop, data.len()) {
        Some((from, to)) => Reply::bulk(data[from..=to].to_vec()),
        None => Reply::bulk(Vec::new()),
    })
}

fn setrange(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let offset = usize::try_from(parse_int(&args[2])?)
        .ok()
        .filter(|offset| *offset < MAX_STRING_LEN)
        .ok_or(CommandError::OffsetOutOfRange)?;
    let value = &args[3];
    if value.is_empty() {
        let len = read_str(db, &args[1], ctx.now)?.map_or(0, |data| data.len());
        return Ok(Reply::Integer(len as i64));
    }
    match db.get_or_insert_with(&args[1], ctx.now, || Value::Str(Vec::new())) {
        Value::Str(data) => {
            let end = offset + value.len();
            if end > MAX_STRING_LEN {
                return Err(CommandError::Other("string exceeds maximum allowed size".to_string()));
            }
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset..end].copy_from_slice(value);
            Ok(Reply::Integer(data.len() as i64))
        }
        _ => Err(CommandError::WrongType),
    }
}

fn del(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let removed = args[1..]
        .iter()
        .filter(|key| db.remove(key, ctx.now).is_some())
        .count();
    Ok(Reply::Integer(removed as i64))
}

fn exists(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let found = args[1..]
        .iter()
        .filter(|key| db.contains(key, ctx.now))
        .count();
    Ok(Reply::Integer(found as i64))
}

fn type_of(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let name = db.get(&args[1], ctx.now).map_or("none", Value::type_name);
    Ok(Reply::SimpleString(name.to_string()))
}

fn expire(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let seconds = parse_int(&args[2])?;
    set_deadline(db, &args[1], seconds, Duration::from_secs, "expire", ctx.now)
}

fn pexpire(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let millis = parse_int(&args[2])?;
    set_deadline(db, &args[1], millis, Duration::from_millis, "pexpire", ctx.now)
}

// A non-positive TTL deletes the key immediately.
fn set_deadline(
    db: &mut Db,
    key: &[u8],
    amount: i64,
    to_duration: fn(u64) -> Duration,
    command: &str,
    now: Instant,
) -> CommandResult {
    if amount <= 0 {
        return Ok(Reply::from(db.remove(key, now).is_some()));
    }
    let deadline = now
        .checked_add(to_duration(amount as u64))
        .ok_or_else(|| CommandError::InvalidExpire(command.to_string()))?;
    Ok(Reply::from(db.set_expiry(key, now, Some(deadline))))
}

fn ttl(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    Ok(Reply::Integer(match db.expiry(&args[1], ctx.now) {
        None => -2,
        Some(None) => -1,
        // Rounded to the nearest second.
        Some(Some(left)) => ((left.as_millis() + 500) / 1000) as i64,
    }))
}

fn pttl(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    Ok(Reply::Integer(match db.expiry(&args[1], ctx.now) {
        None => -2,
        Some(None) => -1,
        Some(Some(left)) => left.as_millis() as i64,
    }))
}

fn persist(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    match db.expiry(&args[1], ctx.now) {
        Some(Some(_)) => Ok(Reply::from(db.set_expiry(&args[1], ctx.now, None))),
        _ => Ok(Reply::Integer(0)),
    }
}

fn keys(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let pattern = &args[1];
    let items = db
        .keys(ctx.now)
        .into_iter()
        .filter(|key| glob_match(pattern, key))
        .map(Reply::bulk)
        .collect();
    Ok(Reply::Array(items))
}

// The cursor is a position in the sorted key list.
fn scan(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let cursor = usize::try_from(parse_int(&args[1])?).map_err(|_| CommandError::Other("invalid cursor".to_string()))?;
    let mut pattern: Option<&[u8]> = None;
    let mut count = 10usize;

    let mut idx = 2;
    while idx < args.len() {
        let value = args.get(idx + 1).ok_or(CommandError::Syntax)?;
        match upper(&args[idx]).as_str() {
            "MATCH" => pattern = Some(value),
            "COUNT" => {
                count = usize::try_from(parse_int(value)?).map_err(|_| CommandError::Syntax)?;
                if count == 0 {
                    return Err(CommandError::Syntax);
                }
            }
            _ => return Err(CommandError::Syntax),
        }
        idx += 2;
    }

    let all = db.keys(ctx.now);
    let start = cursor.min(all.len());
    let end = start.saturating_add(count).min(all.len());
    let items = all[start..end]
        .iter()
        .filter(|key| pattern.map_or(true, |pattern| glob_match(pattern, key)))
        .map(|key| Reply::bulk(key.clone()))
        .collect();
    let next = if end < all.len() { end } else { 0 };
    Ok(Reply::Array(vec![
        Reply::bulk(next.to_string()),
        Reply::Array(items),
    ]))
}

fn rename(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    if db.rename(&args[1], &args[2], ctx.now) {
        Ok(Reply::ok())
    } else {
        Err(CommandError::NoSuchKey)
    }
}

fn renamenx(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    if !db.contains(&args[1], ctx.now) {
        return Err(CommandError::NoSuchKey);
    }
    if db.contains(&args[2], ctx.now) {
        return Ok(Reply::Integer(0));
    }
    Ok(Reply::from(db.rename(&args[1], &args[2], ctx.now)))
}

fn dbsize(db: &mut Db, _: &[Vec<u8>], ctx: &Context) -> CommandResult {
    db.purge_expired(ctx.now);
    Ok(Reply::Integer(db.len() as i64))
}

fn flushall(db: &mut Db, _: &[Vec<u8>], _: &Context) -> CommandResult {
    db.clear();
    Ok(Reply::ok())
}

fn hset(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    if args.len() % 2 != 0 {
        return Err(CommandError::WrongArity("hset".to_string()));
    }
    let hash = match db.get_or_insert_with(&args[1], ctx.now, || Value::Hash(ByteMap::default())) {
        Value::Hash(hash) => hash,
        _ => return Err(CommandError::WrongType),
    };
    let added = args[2..]
        .chunks(2)
        .filter(|pair| hash.insert(pair[0].clone(), pair[1].clone()).is_none())
        .count();
    Ok(Reply::Integer(added as i64))
}

fn hget(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    Ok(read_hash(db, &args[1], ctx.now)?
        .and_then(|hash| hash.get(&args[2]))
        .map_or(Reply::Nil, |value| Reply::bulk(value.clone())))
}

fn hmget(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let hash = read_hash(db, &args[1], ctx.now)?;
    let items = args[2..]
        .iter()
        .map(|field| {
            hash.and_then(|hash| hash.get(field))
                .map_or(Reply::Nil, |value| Reply::bulk(value.clone()))
        })
        .collect();
    Ok(Reply::Array(items))
}

fn hgetall(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = read_hash(db, &args[1], ctx.now)?
        .map(|hash| hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
        .unwrap_or_default();
    pairs.sort();
    // Map flattens to an array for RESP2 connections.
    Ok(Reply::Map(
        pairs
            .into_iter()
            .map(|(field, value)| (Reply::bulk(field), Reply::bulk(value)))
            .collect(),
    ))
}

fn hdel(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let removed = match db.get_mut(&args[1], ctx.now) {
        Some(Value::Hash(hash)) => args[2..]
            .iter()
            .filter(|field| hash.remove(field.as_slice()).is_some())
            .count(),
        Some(_) => return Err(CommandError::WrongType),
        None => 0,
    };
    db.remove_if_empty(&args[1]);
    Ok(Reply::Integer(removed as i64))
}

fn hexists(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let found = read_hash(db, &args[1], ctx.now)?.map_or(false, |hash| hash.contains_key(&args[2]));
    Ok(Reply::from(found))
}

fn hlen(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let len = read_hash(db, &args[1], ctx.now)?.map_or(0, |hash| hash.len());
    Ok(Reply::Integer(len as i64))
}

fn lpush(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    push(db, args, ctx, true)
}

fn rpush(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    push(db, args, ctx, false)
}

fn push(db: &mut Db, args: &[Vec<u8>], ctx: &Context, front: bool) -> CommandResult {
    let list = match db.get_or_insert_with(&args[1], ctx.now, || Value::List(VecDeque::new())) {
        Value::List(list) => list,
        _ => return Err(CommandError::WrongType),
    };
    for value in &args[2..] {
        if front {
            list.push_front(value.clone());
        } else {
            list.push_back(value.clone());
        }
    }
    Ok(Reply::Integer(list.len() as i64))
}

fn lpop(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    pop(db, &args[1], ctx, true)
}

fn rpop(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    pop(db, &args[1], ctx, false)
}

fn pop(db: &mut Db, key: &[u8], ctx: &Context, front: bool) -> CommandResult {
    let popped = match db.get_mut(key, ctx.now) {
        Some(Value::List(list)) => {
            if front {
                list.pop_front()
            } else {
                list.pop_back()
            }
        }
        Some(_) => return Err(CommandError::WrongType),
        None => None,
    };
    db.remove_if_empty(key);
    Ok(popped.map_or(Reply::Nil, Reply::bulk))
}

fn lrange(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let start = parse_int(&args[2])?;
    let stop = parse_int(&args[3])?;
    let items = match db.get(&args[1], ctx.now) {
        Some(Value::List(list)) => match normalize_range(start, stop, list.len()) {
            Some((from, to)) => list
                .range(from..=to)
                .map(|value| Reply::bulk(value.clone()))
                .collect(),
            None => Vec::new(),
        },
        Some(_) => return Err(CommandError::WrongType),
        None => Vec::new(),
    };
    Ok(Reply::Array(items))
}

fn llen(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    match db.get(&args[1], ctx.now) {
        Some(Value::List(list)) => Ok(Reply::Integer(list.len() as i64)),
        Some(_) => Err(CommandError::WrongType),
        None => Ok(Reply::Integer(0)),
    }
}

fn sadd(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let set = match db.get_or_insert_with(&args[1], ctx.now, || Value::Set(ByteSet::default())) {
        Value::Set(set) => set,
        _ => return Err(CommandError::WrongType),
    };
    let added = args[2..]
        .iter()
        .filter(|member| set.insert(member.to_vec()))
        .count();
    Ok(Reply::Integer(added as i64))
}

fn srem(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let removed = match db.get_mut(&args[1], ctx.now) {
        Some(Value::Set(set)) => args[2..]
            .iter()
            .filter(|member| set.remove(member.as_slice()))
            .count(),
        Some(_) => return Err(CommandError::WrongType),
        None => 0,
    };
    db.remove_if_empty(&args[1]);
    Ok(Reply::Integer(removed as i64))
}

fn smembers(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let mut members: Vec<Vec<u8>> = match db.get(&args[1], ctx.now) {
        Some(Value::Set(set)) => set.iter().cloned().collect(),
        Some(_) => return Err(CommandError::WrongType),
        None => Vec::new(),
    };
    members.sort();
    Ok(Reply::Array(members.into_iter().map(Reply::bulk).collect()))
}

fn sismember(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    match db.get(&args[1], ctx.now) {
        Some(Value::Set(set)) => Ok(Reply::from(set.contains(&args[2]))),
        Some(_) => Err(CommandError::WrongType),
        None => Ok(Reply::Integer(0)),
    }
}

fn scard(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    match db.get(&args[1], ctx.now) {
        Some(Value::Set(set)) => Ok(Reply::Integer(set.len() as i64)),
        Some(_) => Err(CommandError::WrongType),
        None => Ok(Reply::Integer(0)),
    }
}

fn zadd(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    if args.len() % 2 != 0 {
        return Err(CommandError::Syntax);
    }
    // Parse every score before touching the key.
    let members = args[2..]
        .chunks(2)
        .map(|pair| Ok((parse_float(&pair[0])?, pair[1].clone())))
        .collect::<Result<Vec<_>, CommandError>>()?;

    let zset = match db.get_or_insert_with(&args[1], ctx.now, || Value::ZSet(SortedSet::default())) {
        Value::ZSet(zset) => zset,
        _ => return Err(CommandError::WrongType),
    };
    let added = members
        .into_iter()
        .filter(|(score, member)| zset.insert(member.clone(), *score))
        .count();
    Ok(Reply::Integer(added as i64))
}

fn zrem(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let removed = match db.get_mut(&args[1], ctx.now) {
        Some(Value::ZSet(zset)) => args[2..].iter().filter(|member| zset.remove(member)).count(),
        Some(_) => return Err(CommandError::WrongType),
        None => 0,
    };
    db.remove_if_empty(&args[1]);
    Ok(Reply::Integer(removed as i64))
}

fn zscore(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    Ok(read_zset(db, &args[1], ctx.now)?
        .and_then(|zset| zset.score(&args[2]))
        .map_or(Reply::Nil, |score| Reply::bulk(format_float(score))))
}

fn zrange(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let start = parse_int(&args[2])?;
    let stop = parse_int(&args[3])?;
    let with_scores = match args.get(4) {
        None => false,
        Some(option) if upper(option) == "WITHSCORES" && args.len() == 5 => true,
        Some(_) => return Err(CommandError::Syntax),
    };

    let zset = match read_zset(db, &args[1], ctx.now)? {
        Some(zset) => zset,
        None => return Ok(Reply::Array(Vec::new())),
    };
    let ordered = zset.ordered();
    let slice = match normalize_range(start, stop, ordered.len()) {
        Some((from, to)) => &ordered[from..=to],
        None => &ordered[..0],
    };

    let mut items = Vec::with_capacity(slice.len() * if with_scores { 2 } else { 1 });
    for (member, score) in slice {
        let member = Reply::bulk(member.to_vec());
        if !with_scores {
            items.push(member);
            continue;
        }
        let score = Reply::bulk(format_float(*score));
        match ctx.version {
            RespVersion::Resp2 => {
                items.push(member);
                items.push(score);
            }
            RespVersion::Resp3 => items.push(Reply::Array(vec![member, score])),
        }
    }
    Ok(Reply::Array(items))
}

fn zrank(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    Ok(read_zset(db, &args[1], ctx.now)?
        .and_then(|zset| zset.rank(&args[2]))
        .map_or(Reply::Nil, |rank| Reply::Integer(rank as i64)))
}

fn zrevrank(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    Ok(read_zset(db, &args[1], ctx.now)?
        .and_then(|zset| zset.rank(&args[2]).map(|rank| zset.len() - 1 - rank))
        .map_or(Reply::Nil, |rank| Reply::Integer(rank as i64)))
}

fn zcard(db: &mut Db, args: &[Vec<u8>], ctx: &Context) -> CommandResult {
    let len = read_zset(db, &args[1], ctx.now)?.map_or(0, SortedSet::len);
    Ok(Reply::Integer(len as i64))
}

fn read_str<'a>(db: &'a mut Db, key: &[u8], now: Instant) -> Result<Option<&'a Vec<u8>>, CommandError> {
    match db.get(key, now) {
        Some(Value::Str(data)) => Ok(Some(data)),
        Some(_) => Err(CommandError::WrongType),
        None => Ok(None),
    }
}

fn read_hash<'a>(
    db: &'a mut Db,
    key: &[u8],
    now: Instant,
) -> Result<Option<&'a ByteMap<Vec<u8>>>, CommandError> {
    match db.get(key, now) {
        Some(Value::Hash(hash)) => Ok(Some(hash)),
        Some(_) => Err(CommandError::WrongType),
        None => Ok(None),
    }
}

fn read_zset<'a>(db: &'a mut Db, key: &[u8], now: Instant) -> Result<Option<&'a SortedSet>, CommandError> {
    match db.get(key, now) {
        Some(Value::ZSet(zset)) => Ok(Some(zset)),
        Some(_) => Err(CommandError::WrongType),
        None => Ok(None),
    }
}

/// Resolves an inclusive, possibly negative index range against `len`.
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

pub(crate) fn parse_int(arg: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(CommandError::NotInteger)
}

fn parse_float(arg: &[u8]) -> Result<f64, CommandError> {
    let text = std::str::from_utf8(arg).map_err(|_| CommandError::NotFloat)?;
    let value = match text.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        other => other.parse::<f64>().map_err(|_| CommandError::NotFloat)?,
    };
    if value.is_nan() {
        return Err(CommandError::NotFloat);
    }
    Ok(value)
}

fn format_float(value: f64) -> Vec<u8> {
    if value.is_infinite() {
        return if value > 0.0 { b"inf".to_vec() } else { b"-inf".to_vec() };
    }
    value.to_string().into_bytes()
}

fn upper(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).to_ascii_uppercase()
}

pub(crate) fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// Glob matching with `*`, `?`, `[...]` classes and `\` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((b'[', rest)) => {
            let Some((&ch, text_rest)) = text.split_first() else {
                return false;
            };
            match match_class(rest, ch) {
                Some((matched, after)) => matched && glob_match(after, text_rest),
                None => false,
            }
        }
        Some((b'\\', rest)) if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && glob_match(&rest[1..], &text[1..])
        }
        Some((&literal, rest)) => text.first() == Some(&literal) && glob_match(rest, &text[1..]),
    }
}

// Returns whether `ch` is in the class and the pattern after `]`.
fn match_class(class: &[u8], ch: u8) -> Option<(bool, &[u8])> {
    let (negate, mut idx) = match class.first() {
        Some(b'^') => (true, 1),
        _ => (false, 0),
    };
    let mut matched = false;
    while idx < class.len() {
        match class[idx] {
            b']' => return Some((matched != negate, &class[idx + 1..])),
            b'\\' if idx + 1 < class.len() => {
                matched |= class[idx + 1] == ch;
                idx += 2;
            }
            low if idx + 2 < class.len() && class[idx + 1] == b'-' && class[idx + 2] != b']' => {
                let high = class[idx + 2];
                let (low, high) = if low <= high { (low, high) } else { (high, low) };
                matched |= (low..=high).contains(&ch);
                idx += 3;
            }
            other => {
                matched |= other == ch;
                idx += 1;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context {
            version: RespVersion::Resp2,
            now: Instant::now(),
        }
    }

    fn run(db: &mut Db, parts: &[&str]) -> Reply {
        let args: Vec<Vec<u8>> = parts.iter().map(|part| part.as_bytes().to_vec()).collect();
        execute(db, &args, &ctx())
    }

    #[test]
    fn string_commands() {
        let mut db = Db::new();
        assert_eq!(run(&mut db, &["SET", "k", "hello world"]), Reply::ok());
        assert_eq!(run(&mut db, &["GET", "k"]), Reply::bulk("hello world"));
        assert_eq!(run(&mut db, &["APPEND", "k", "!"]), Reply::Integer(12));
        assert_eq!(run(&mut db, &["GETRANGE", "k", "0", "4"]), Reply::bulk("hello"));
        assert_eq!(run(&mut db, &["GETRANGE", "k", "-6", "-1"]), Reply::bulk("world!"));
        assert_eq!(run(&mut db, &["SETRANGE", "k", "6", "there"]), Reply::Integer(12));
        assert_eq!(run(&mut db, &["GET", "k"]), Reply::bulk("hello there!"));
        assert_eq!(run(&mut db, &["GET", "missing"]), Reply::Nil);
    }

    #[test]
    fn counters() {
        let mut db = Db::new();
        assert_eq!(run(&mut db, &["INCR", "n"]), Reply::Integer(1));
        assert_eq!(run(&mut db, &["INCRBY", "n", "5"]), Reply::Integer(6));
        assert_eq!(run(&mut db, &["DECRBY", "n", "2"]), Reply::Integer(4));
        assert_eq!(run(&mut db, &["DECR", "n"]), Reply::Integer(3));
        run(&mut db, &["SET", "s", "abc"]);
        assert!(run(&mut db, &["INCR", "s"]).is_error());
        let max = i64::MAX.to_string();
        run(&mut db, &["SET", "max", max.as_str()]);
        assert!(run(&mut db, &["INCR", "max"]).is_error());
    }

    #[test]
    fn set_conditions_and_expiry() {
        let mut db = Db::new();
        assert_eq!(run(&mut db, &["SET", "k", "v", "NX", "EX", "10"]), Reply::ok());
        assert_eq!(run(&mut db, &["SET", "k", "w", "NX"]), Reply::Nil);
        assert_eq!(run(&mut db, &["SET", "other", "w", "XX"]), Reply::Nil);
        assert_eq!(run(&mut db, &["TTL", "k"]), Reply::Integer(10));
        assert_eq!(run(&mut db, &["PERSIST", "k"]), Reply::Integer(1));
        assert_eq!(run(&mut db, &["TTL", "k"]), Reply::Integer(-1));
        assert_eq!(run(&mut db, &["TTL", "missing"]), Reply::Integer(-2));
        assert!(run(&mut db, &["SET", "k", "v", "EX", "0"]).is_error());
        assert!(run(&mut db, &["SET", "k", "v", "BOGUS"]).is_error());
    }

    #[test]
    fn wrong_type_and_arity() {
        let mut db = Db::new();
        run(&mut db, &["SET", "s", "v"]);
        assert_eq!(
            run(&mut db, &["LPUSH", "s", "x"]),
            Reply::Error("WRONGTYPE Operation against a key holding the wrong kind of value".into())
        );
        assert_eq!(
            run(&mut db, &["GET"]),
            Reply::Error("ERR wrong number of arguments for 'get' command".into())
        );
        assert_eq!(
            run(&mut db, &["NOPE"]),
            Reply::Error("ERR unknown command 'NOPE'".into())
        );
    }

    #[test]
    fn collections() {
        let mut db = Db::new();
        assert_eq!(run(&mut db, &["RPUSH", "l", "a", "b", "c"]), Reply::Integer(3));
        assert_eq!(run(&mut db, &["LPUSH", "l", "z"]), Reply::Integer(4));
        assert_eq!(
            run(&mut db, &["LRANGE", "l", "0", "-1"]),
            Reply::Array(vec![Reply::bulk("z"), Reply::bulk("a"), Reply::bulk("b"), Reply::bulk("c")])
        );
        assert_eq!(run(&mut db, &["RPOP", "l"]), Reply::bulk("c"));

        assert_eq!(run(&mut db, &["HSET", "h", "name", "John", "age", "30"]), Reply::Integer(2));
        assert_eq!(
            run(&mut db, &["HMGET", "h", "name", "nope"]),
            Reply::Array(vec![Reply::bulk("John"), Reply::Nil])
        );
        assert_eq!(run(&mut db, &["HDEL", "h", "name", "age"]), Reply::Integer(2));
        assert_eq!(run(&mut db, &["EXISTS", "h"]), Reply::Integer(0));

        assert_eq!(run(&mut db, &["SADD", "s", "a", "b", "a"]), Reply::Integer(2));
        assert_eq!(run(&mut db, &["SISMEMBER", "s", "b"]), Reply::Integer(1));
        assert_eq!(run(&mut db, &["SREM", "s", "a"]), Reply::Integer(1));
    }

    #[test]
    fn sorted_sets() {
        let mut db = Db::new();
        assert_eq!(run(&mut db, &["ZADD", "z", "1", "one", "2", "two", "3", "three"]), Reply::Integer(3));
        assert_eq!(run(&mut db, &["ZSCORE", "z", "two"]), Reply::bulk("2"));
        assert_eq!(run(&mut db, &["ZRANK", "z", "three"]), Reply::Integer(2));
        assert_eq!(run(&mut db, &["ZREVRANK", "z", "three"]), Reply::Integer(0));
        assert_eq!(run(&mut db, &["ZRANK", "z", "none"]), Reply::Nil);
        assert_eq!(
            run(&mut db, &["ZRANGE", "z", "0", "1", "WITHSCORES"]),
            Reply::Array(vec![Reply::bulk("one"), Reply::bulk("1"), Reply::bulk("two"), Reply::bulk("2")])
        );
        assert!(run(&mut db, &["ZADD", "z", "nan", "x"]).is_error());
    }

    #[test]
    fn resp3_zrange_nests_pairs() {
        let mut db = Db::new();
        run(&mut db, &["ZADD", "z", "1.5", "a"]);
        let args: Vec<Vec<u8>> = ["ZRANGE", "z", "0", "-1", "WITHSCORES"]
            .iter()
            .map(|part| part.as_bytes().to_vec())
            .collect();
        let ctx = Context {
            version: RespVersion::Resp3,
            now: Instant::now(),
        };
        assert_eq!(
            execute(&mut db, &args, &ctx),
            Reply::Array(vec![Reply::Array(vec![Reply::bulk("a"), Reply::bulk("1.5")])])
        );
    }

    #[test]
    fn keyspace_commands() {
        let mut db = Db::new();
        for key in ["test1", "test2", "other"] {
            run(&mut db, &["SET", key, "v"]);
        }
        assert_eq!(
            run(&mut db, &["KEYS", "test*"]),
            Reply::Array(vec![Reply::bulk("test1"), Reply::bulk("test2")])
        );
        assert_eq!(
            run(&mut db, &["SCAN", "0", "COUNT", "2"]),
            Reply::Array(vec![
                Reply::bulk("2"),
                Reply::Array(vec![Reply::bulk("other"), Reply::bulk("test1")]),
            ])
        );
        assert_eq!(run(&mut db, &["RENAMENX", "test1", "test2"]), Reply::Integer(0));
        assert_eq!(run(&mut db, &["RENAME", "test1", "renamed"]), Reply::ok());
        assert!(run(&mut db, &["RENAME", "test1", "x"]).is_error());
        assert_eq!(run(&mut db, &["DEL", "renamed", "nope"]), Reply::Integer(1));
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[^e]llo", b"hello"));
        assert!(glob_match(b"h[a-c]llo", b"hbllo"));
        assert!(glob_match(b"a\\*b", b"a*b"));
        assert!(!glob_match(b"a\\*b", b"axb"));
    }

    #[test]
    fn ranges_normalize_like_the_server() {
        assert_eq!(normalize_range(0, -1, 3), Some((0, 2)));
        assert_eq!(normalize_range(-100, 100, 3), Some((0, 2)));
        assert_eq!(normalize_range(2, 1, 3), None);
        assert_eq!(normalize_range(0, -1, 0), None);
        assert_eq!(normalize_range(5, 10, 3), None);
    }
}
