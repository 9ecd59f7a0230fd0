//! # Script Invoker
//!
//! Purpose: Run server-side scripts by digest and recover transparently when
//! the server no longer knows the digest.
//!
//! ## Design Principles
//! 1. **Digest First**: `EVALSHA` is always tried first; the full body only
//!    travels after a `NOSCRIPT` reply.
//! 2. **One Fallback**: A `NOSCRIPT` is answered with exactly one `EVAL` on
//!    the same connection. Any other error reaches the caller.
//! 3. **Shared Registry**: Registration state lives in one process-wide
//!    `ScriptCache` behind a `RwLock`, so clients agree on what the server
//!    is believed to hold.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use kvlink_common::{sha1_hex, Reply};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::decoder;
use crate::encoder::{Command, ToArg};
use crate::error::{ClientResult, ErrorKind};
use crate::transport::Connection;

/// A script body and its SHA-1 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    body: String,
    digest: String,
}

impl Script {
    pub fn new(body: impl Into<String>) -> Self {
        let body = body.into();
        let digest = sha1_hex(body.as_bytes());
        Script { body, digest }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Lowercase hex SHA-1 of the body, as `EVALSHA` expects it.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// What the client believes about a digest on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Unregistered,
    Registered,
    /// The server answered `NOSCRIPT` for it.
    Evicted,
}

/// Registration state of every digest this process has used.
#[derive(Debug, Default)]
pub struct ScriptCache {
    states: RwLock<HashMap<String, ScriptState>>,
}

static GLOBAL_CACHE: OnceLock<Arc<ScriptCache>> = OnceLock::new();

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every client that was not given its own.
    pub fn global() -> Arc<ScriptCache> {
        GLOBAL_CACHE
            .get_or_init(|| Arc::new(ScriptCache::new()))
            .clone()
    }

    pub fn state(&self, digest: &str) -> ScriptState {
        self.states
            .read()
            .get(digest)
            .copied()
            .unwrap_or(ScriptState::Unregistered)
    }

    pub fn mark_registered(&self, digest: &str) {
        self.set(digest, ScriptState::Registered);
    }

    pub fn mark_evicted(&self, digest: &str) {
        self.set(digest, ScriptState::Evicted);
    }

    /// Marks every known digest evicted, e.g. after `SCRIPT FLUSH`.
    pub fn evict_all(&self) {
        let mut states = self.states.write();
        for state in states.values_mut() {
            *state = ScriptState::Evicted;
        }
    }

    fn set(&self, digest: &str, state: ScriptState) {
        let mut states = self.states.write();
        match states.get_mut(digest) {
            Some(current) => *current = state,
            None => {
                states.insert(digest.to_string(), state);
            }
        }
    }
}

/// Runs `script` on `conn`, falling back from `EVALSHA` to `EVAL` once.
pub(crate) fn invoke<K: ToArg, A: ToArg>(
    conn: &mut Connection,
    cache: &ScriptCache,
    script: &Script,
    keys: &[K],
    args: &[A],
) -> ClientResult<Reply> {
    let evalsha = script_command("EVALSHA", script.digest(), keys, args);
    match decoder::check(conn.round_trip(&evalsha)?) {
        Ok(reply) => {
            cache.mark_registered(script.digest());
            Ok(reply)
        }
        Err(err) if err.command_kind() == Some(ErrorKind::NoScript) => {
            cache.mark_evicted(script.digest());
            warn!(digest = script.digest(), "script not cached on server; sending body");
            let eval = script_command("EVAL", script.body(), keys, args);
            let reply = decoder::check(conn.round_trip(&eval)?)?;
            cache.mark_registered(script.digest());
            debug!(digest = script.digest(), "script registered via EVAL");
            Ok(reply)
        }
        Err(err) => Err(err),
    }
}

fn script_command<K: ToArg, A: ToArg>(verb: &str, head: &str, keys: &[K], args: &[A]) -> Command {
    Command::new(verb)
        .arg(head)
        .arg(&keys.len())
        .args(keys)
        .args(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_lowercase_sha1_hex() {
        let script = Script::new("return 1");
        assert_eq!(script.digest(), "e0e1f9fabfc9d4800c877a703b823ac0578ff8db");
        assert_eq!(Script::new("").digest(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn cache_tracks_lifecycle() {
        let cache = ScriptCache::new();
        let digest = Script::new("return 1").digest().to_string();
        assert_eq!(cache.state(&digest), ScriptState::Unregistered);

        cache.mark_registered(&digest);
        assert_eq!(cache.state(&digest), ScriptState::Registered);

        cache.evict_all();
        assert_eq!(cache.state(&digest), ScriptState::Evicted);

        cache.mark_registered(&digest);
        assert_eq!(cache.state(&digest), ScriptState::Registered);
    }

    #[test]
    fn global_cache_is_shared() {
        assert!(Arc::ptr_eq(&ScriptCache::global(), &ScriptCache::global()));
    }
}
