//! # Script Engine
//!
//! Purpose: Run `EVAL`/`EVALSHA` scripts in an embedded Lua 5.4 interpreter
//! and keep script bodies by SHA-1 digest.
//!
//! ## Design Principles
//! 1. **Fresh Interpreter per Run**: Every run gets its own `mlua::Lua` with
//!    `KEYS`, `ARGV` and a `redis` table; nothing leaks between scripts.
//! 2. **Sandboxed**: `os`, `io`, file loading and `debug` are removed, and
//!    assigning an undeclared global is a runtime error.
//! 3. **Atomic by Construction**: A script runs with the keyspace lock held
//!    by its caller, so no other command interleaves with it. `redis.call`
//!    reaches the keyspace through a scoped callback that borrows that lock.
//!
//! ## Reply Conversion
//!
//! ```text
//! reply -> Lua:  nil -> false   integer -> number   bulk -> string
//!                status -> {ok=..}   error -> {err=..}   array/map -> table
//! Lua -> reply:  false/nil -> nil   true -> 1   number -> integer (truncated)
//!                {err=..} -> error   {ok=..} -> status   table -> array up to first nil
//! ```

use std::cell::RefCell;
use std::sync::Arc;

use ahash::RandomState;
use kvlink_common::{sha1_hex, Reply};
use mlua::{Lua, MultiValue, Result as LuaResult, Table, Value as LuaValue};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Log levels accepted by `redis.log`.
const LOG_DEBUG: i64 = 0;
const LOG_VERBOSE: i64 = 1;
const LOG_NOTICE: i64 = 2;
const LOG_WARNING: i64 = 3;

/// Installed after the globals a script may see are in place.
const GLOBAL_GUARD: &str = r#"
setmetatable(_G, {
    __newindex = function(_, name)
        error("Script attempted to create global variable '" .. tostring(name) .. "'", 2)
    end,
})
"#;

/// Script failures, formatted as the error reply sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("ERR Error compiling script: {0}")]
    Compile(String),
    #[error("ERR Error running script: {0}")]
    Runtime(String),
    /// An error reply raised by `redis.call`, passed through unchanged.
    #[error("{0}")]
    Raised(String),
}

impl From<ScriptError> for Reply {
    fn from(err: ScriptError) -> Self {
        Reply::Error(err.to_string())
    }
}

/// Error reply a command returned inside `redis.call`.
#[derive(Debug, Error)]
#[error("{0}")]
struct Raised(String);

/// Script bodies keyed by lowercase SHA-1 hex.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: RwLock<hashbrown::HashMap<String, Arc<[u8]>, RandomState>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that `body` compiles, caches it and returns its digest.
    pub fn load(&self, body: &[u8]) -> Result<(String, Arc<[u8]>), ScriptError> {
        let digest = sha1_hex(body);
        if let Some(cached) = self.get(&digest) {
            return Ok((digest, cached));
        }
        compile(body)?;
        let body: Arc<[u8]> = Arc::from(body);
        self.scripts.write().insert(digest.clone(), body.clone());
        debug!(digest = %digest, "script cached");
        Ok((digest, body))
    }

    pub fn get(&self, digest: &str) -> Option<Arc<[u8]>> {
        self.scripts.read().get(&digest.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.scripts.read().contains_key(&digest.to_ascii_lowercase())
    }

    pub fn flush(&self) {
        self.scripts.write().clear();
    }

    pub fn len(&self) -> usize {
        self.scripts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses `body` without running it.
pub fn compile(body: &[u8]) -> Result<(), ScriptError> {
    Lua::new()
        .load(body)
        .into_function()
        .map(|_| ())
        .map_err(script_error)
}

/// Runs a script. `call` executes one command and returns its reply.
pub fn run(
    body: &[u8],
    keys: &[Vec<u8>],
    argv: &[Vec<u8>],
    call: &mut dyn FnMut(&[Vec<u8>]) -> Reply,
) -> Result<Reply, ScriptError> {
    let lua = Lua::new();
    prepare(&lua, keys, argv).map_err(script_error)?;

    let call = RefCell::new(call);
    lua.scope(|scope| {
        let redis: Table = lua.globals().get("redis")?;
        redis.set(
            "call",
            scope.create_function(|lua, args: MultiValue| match dispatch(&call, args)? {
                Reply::Error(text) => Err(mlua::Error::external(Raised(text))),
                reply => reply_to_lua(lua, reply),
            })?,
        )?;
        redis.set(
            "pcall",
            scope.create_function(|lua, args: MultiValue| reply_to_lua(lua, dispatch(&call, args)?))?,
        )?;

        let value: LuaValue = lua.load(body).eval()?;
        lua_to_reply(value)
    })
    .map_err(script_error)
}

/// Installs `KEYS`, `ARGV` and the call-independent part of `redis`, then
/// locks the global table.
fn prepare(lua: &Lua, keys: &[Vec<u8>], argv: &[Vec<u8>]) -> LuaResult<()> {
    let globals = lua.globals();
    for name in ["os", "io", "loadfile", "dofile", "require", "debug"] {
        globals.set(name, LuaValue::Nil)?;
    }
    globals.set("KEYS", string_table(lua, keys)?)?;
    globals.set("ARGV", string_table(lua, argv)?)?;

    let redis = lua.create_table()?;
    redis.set(
        "status_reply",
        lua.create_function(|lua, text: String| flagged(lua, "ok", &text))?,
    )?;
    redis.set(
        "error_reply",
        lua.create_function(|lua, text: String| flagged(lua, "err", &text))?,
    )?;
    redis.set(
        "sha1hex",
        lua.create_function(|_, data: mlua::String| Ok(sha1_hex(data.as_bytes())))?,
    )?;
    redis.set(
        "log",
        lua.create_function(|_, (level, message): (i64, String)| {
            match level {
                LOG_DEBUG => debug!(target: "kvlink_server::script", "{}", message),
                LOG_WARNING => warn!(target: "kvlink_server::script", "{}", message),
                _ => info!(target: "kvlink_server::script", "{}", message),
            }
            Ok(())
        })?,
    )?;
    redis.set("LOG_DEBUG", LOG_DEBUG)?;
    redis.set("LOG_VERBOSE", LOG_VERBOSE)?;
    redis.set("LOG_NOTICE", LOG_NOTICE)?;
    redis.set("LOG_WARNING", LOG_WARNING)?;
    globals.set("redis", redis)?;

    lua.load(GLOBAL_GUARD).exec()
}

fn dispatch(
    call: &RefCell<&mut dyn FnMut(&[Vec<u8>]) -> Reply>,
    args: MultiValue,
) -> LuaResult<Reply> {
    let command = args
        .into_iter()
        .map(|arg| match arg {
            LuaValue::String(text) => Ok(text.as_bytes().to_vec()),
            LuaValue::Integer(value) => Ok(value.to_string().into_bytes()),
            LuaValue::Number(value) => Ok(value.to_string().into_bytes()),
            _ => Err(mlua::Error::RuntimeError(
                "Lua redis lib command arguments must be strings or integers".to_string(),
            )),
        })
        .collect::<LuaResult<Vec<_>>>()?;
    if command.is_empty() {
        return Err(mlua::Error::RuntimeError(
            "Please specify at least one argument for this redis lib call".to_string(),
        ));
    }
    let mut call = call.borrow_mut();
    Ok((*call)(&command))
}

fn string_table<'lua>(lua: &'lua Lua, items: &[Vec<u8>]) -> LuaResult<Table<'lua>> {
    let table = lua.create_table()?;
    for (idx, item) in items.iter().enumerate() {
        table.raw_set(idx + 1, lua.create_string(item)?)?;
    }
    Ok(table)
}

fn flagged<'lua>(lua: &'lua Lua, field: &str, text: &str) -> LuaResult<Table<'lua>> {
    let table = lua.create_table()?;
    table.raw_set(field, text)?;
    Ok(table)
}

fn reply_to_lua<'lua>(lua: &'lua Lua, reply: Reply) -> LuaResult<LuaValue<'lua>> {
    Ok(match reply {
        Reply::Nil => LuaValue::Boolean(false),
        Reply::Integer(value) => LuaValue::Integer(value),
        Reply::BulkString(data) => LuaValue::String(lua.create_string(&data)?),
        Reply::SimpleString(text) => LuaValue::Table(flagged(lua, "ok", &text)?),
        Reply::Error(text) => LuaValue::Table(flagged(lua, "err", &text)?),
        Reply::Array(items) => {
            let table = lua.create_table()?;
            for (idx, item) in items.into_iter().enumerate() {
                table.raw_set(idx + 1, reply_to_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Reply::Map(pairs) => reply_to_lua(
            lua,
            Reply::Array(pairs.into_iter().flat_map(|(key, value)| [key, value]).collect()),
        )?,
    })
}

fn lua_to_reply(value: LuaValue) -> LuaResult<Reply> {
    Ok(match value {
        LuaValue::Boolean(true) => Reply::Integer(1),
        LuaValue::Integer(value) => Reply::Integer(value),
        LuaValue::Number(value) => Reply::Integer(value as i64),
        LuaValue::String(text) => Reply::BulkString(text.as_bytes().to_vec()),
        LuaValue::Table(table) => {
            let err: LuaValue = table.raw_get("err")?;
            if let LuaValue::String(text) = err {
                return Ok(Reply::Error(text.to_string_lossy().into_owned()));
            }
            let ok: LuaValue = table.raw_get("ok")?;
            if let LuaValue::String(text) = ok {
                return Ok(Reply::SimpleString(text.to_string_lossy().into_owned()));
            }
            let mut items = Vec::new();
            for idx in 1_i64.. {
                let item: LuaValue = table.raw_get(idx)?;
                if matches!(item, LuaValue::Nil) {
                    break;
                }
                items.push(lua_to_reply(item)?);
            }
            Reply::Array(items)
        }
        _ => Reply::Nil,
    })
}

fn script_error(err: mlua::Error) -> ScriptError {
    match err {
        mlua::Error::SyntaxError { message, .. } => ScriptError::Compile(message),
        mlua::Error::CallbackError { cause, .. } => script_error(cause.as_ref().clone()),
        mlua::Error::ExternalError(inner) => match inner.downcast_ref::<Raised>() {
            Some(Raised(text)) => ScriptError::Raised(text.clone()),
            None => ScriptError::Runtime(inner.to_string()),
        },
        mlua::Error::RuntimeError(message) => ScriptError::Runtime(message),
        other => ScriptError::Runtime(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|item| item.as_bytes().to_vec()).collect()
    }

    fn eval(source: &str, keys: &[&str], argv: &[&str]) -> Result<Reply, ScriptError> {
        let mut call = |args: &[Vec<u8>]| -> Reply {
            match (args[0].as_slice(), args.get(1).map(Vec::as_slice)) {
                (b"GET", Some(b"missing")) => Reply::Nil,
                (b"GET", Some(key)) => Reply::bulk(key.to_vec()),
                (b"PING", _) => Reply::SimpleString("PONG".to_string()),
                _ => Reply::Error("ERR unknown command".to_string()),
            }
        };
        run(source.as_bytes(), &bytes(keys), &bytes(argv), &mut call)
    }

    #[test]
    fn returns_keys_and_argv() {
        assert_eq!(
            eval("return { KEYS[1], ARGV[1] }", &["foo"], &["bar"]).unwrap(),
            Reply::Array(vec![Reply::bulk("foo"), Reply::bulk("bar")])
        );
    }

    #[test]
    fn keys_are_binary_safe() {
        let key = vec![0xff, 0x00, b'k'];
        let mut call = |_: &[Vec<u8>]| Reply::Nil;
        assert_eq!(
            run(b"return KEYS[1]", &[key.clone()], &[], &mut call).unwrap(),
            Reply::BulkString(key)
        );
    }

    #[test]
    fn literal_conversions() {
        assert_eq!(eval("return 42", &[], &[]).unwrap(), Reply::Integer(42));
        assert_eq!(eval("return -7", &[], &[]).unwrap(), Reply::Integer(-7));
        assert_eq!(eval("return 3.9", &[], &[]).unwrap(), Reply::Integer(3));
        assert_eq!(eval("return 'hi'", &[], &[]).unwrap(), Reply::bulk("hi"));
        assert_eq!(eval("return nil", &[], &[]).unwrap(), Reply::Nil);
        assert_eq!(eval("return false", &[], &[]).unwrap(), Reply::Nil);
        assert_eq!(eval("return true", &[], &[]).unwrap(), Reply::Integer(1));
        assert_eq!(eval("return { 1, nil, 3 }", &[], &[]).unwrap(), Reply::Array(vec![Reply::Integer(1)]));
        assert_eq!(eval("", &[], &[]).unwrap(), Reply::Nil);
    }

    #[test]
    fn redis_call_and_locals() {
        let source = "local v = redis.call('GET', KEYS[1])\n-- comment\nreturn v";
        assert_eq!(eval(source, &["k"], &[]).unwrap(), Reply::bulk("k"));
        assert_eq!(
            eval("return redis.call('PING')", &[], &[]).unwrap(),
            Reply::SimpleString("PONG".to_string())
        );
        assert_eq!(
            eval("return redis.status_reply('FINE')", &[], &[]).unwrap(),
            Reply::SimpleString("FINE".to_string())
        );
        assert_eq!(
            eval("return redis.error_reply('ERR custom')", &[], &[]).unwrap(),
            Reply::Error("ERR custom".to_string())
        );
    }

    #[test]
    fn control_flow_and_concatenation() {
        let source = "local v = redis.call('GET', KEYS[1]) if v then return v end return 'none'";
        assert_eq!(eval(source, &["missing"], &[]).unwrap(), Reply::bulk("none"));
        assert_eq!(eval(source, &["here"], &[]).unwrap(), Reply::bulk("here"));
        assert_eq!(eval("return 'a' .. ARGV[1]", &[], &["b"]).unwrap(), Reply::bulk("ab"));

        let sum = "local n = 0 for i = 1, #ARGV do n = n + tonumber(ARGV[i]) end return n";
        assert_eq!(eval(sum, &[], &["1", "2", "3"]).unwrap(), Reply::Integer(6));
        assert_eq!(
            eval("return redis.sha1hex('return 1')", &[], &[]).unwrap(),
            Reply::bulk("e0e1f9fabfc9d4800c877a703b823ac0578ff8db")
        );
    }

    #[test]
    fn call_raises_and_pcall_returns_errors() {
        assert_eq!(
            eval("return redis.call('NOPE')", &[], &[]),
            Err(ScriptError::Raised("ERR unknown command".to_string()))
        );
        assert_eq!(
            eval("return redis.pcall('NOPE')", &[], &[]).unwrap(),
            Reply::Error("ERR unknown command".to_string())
        );
        assert!(matches!(eval("return redis.call()", &[], &[]), Err(ScriptError::Runtime(_))));
    }

    #[test]
    fn sandbox_rejects_what_it_cannot_run() {
        assert!(matches!(compile(b"return 1 +"), Err(ScriptError::Compile(_))));
        assert!(matches!(compile(b"return 'open"), Err(ScriptError::Compile(_))));
        assert!(matches!(eval("os.exit()", &[], &[]), Err(ScriptError::Runtime(_))));
        match eval("x = 1", &[], &[]) {
            Err(ScriptError::Runtime(message)) => assert!(message.contains("global variable 'x'")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn registry_caches_by_digest() {
        let registry = ScriptRegistry::new();
        let (digest, body) = registry.load(b"return 1").unwrap();
        assert_eq!(digest, "e0e1f9fabfc9d4800c877a703b823ac0578ff8db");
        assert_eq!(&body[..], b"return 1");
        assert!(registry.contains(&digest.to_uppercase()));
        registry.flush();
        assert!(registry.get(&digest).is_none());
        assert!(registry.load(b"return {").is_err());
        assert!(registry.is_empty());
    }
}
