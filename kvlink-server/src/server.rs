//! # TCP Server
//!
//! Accept RESP2/RESP3 connections, track per-connection session state, and
//! dispatch commands to the keyspace.
//!
//! ## Design Principles
//! 1. **Session Commands Here, Data Commands Elsewhere**: `HELLO`, `AUTH`,
//!    `MULTI`/`EXEC`/`DISCARD`, scripting, `INFO` and `DEBUG` live in this
//!    module; everything else goes through the `commands` table.
//! 2. **Lock Outside Await**: Every locked section is synchronous, so no
//!    keyspace guard is ever held across an `.await`.
//! 3. **Queue-Time Validation**: Inside `MULTI`, unknown commands and bad
//!    arity are rejected immediately and poison the transaction; `EXEC` then
//!    answers `EXECABORT` and nothing runs.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use kvlink_common::{parse_request, write_reply, Reply, RespVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::commands::{self, eq_ignore_ascii_case, parse_int, Context};
use crate::config::ServerConfig;
use crate::error::CommandError;
use crate::script::{self, ScriptRegistry};
use crate::store::{Db, Store};

const SERVER_NAME: &str = "kvlink";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// State shared by every connection.
pub struct ServerState {
    store: Store,
    scripts: ScriptRegistry,
    password: Option<String>,
    started: Instant,
    next_client_id: AtomicU64,
}

impl ServerState {
    pub fn new(password: Option<String>) -> Self {
        Self {
            store: Store::new(),
            scripts: ScriptRegistry::new(),
            password,
            started: Instant::now(),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }
}

/// What the connection loop should do after dispatch.
enum Action {
    Reply(Reply),
    Sleep(Duration),
}

struct Session {
    id: u64,
    version: RespVersion,
    authenticated: bool,
    // Queued commands while inside MULTI.
    queue: Option<Vec<Vec<Vec<u8>>>>,
    // Set when a queued command was rejected.
    dirty: bool,
}

impl Session {
    fn new(id: u64, state: &ServerState) -> Self {
        Self {
            id,
            version: RespVersion::Resp2,
            authenticated: state.password.is_none(),
            queue: None,
            dirty: false,
        }
    }

    fn dispatch(&mut self, args: &[Vec<u8>], state: &ServerState) -> Action {
        let verb = args[0].to_ascii_uppercase();
        let reply = match verb.as_slice() {
            b"HELLO" => self.hello(args, state),
            b"AUTH" => self.auth(args, state),
            _ if !self.authenticated => CommandError::NoAuth.into(),
            b"MULTI" => self.multi(args),
            b"EXEC" => self.exec(args, state),
            b"DISCARD" => self.discard(args),
            _ if self.queue.is_some() => self.enqueue(args),
            b"DEBUG" => return self.debug(args),
            _ => run_locked(&mut state.store.lock(), state, args, self.version),
        };
        Action::Reply(reply)
    }

    fn hello(&mut self, args: &[Vec<u8>], state: &ServerState) -> Reply {
        if self.queue.is_some() {
            return self.reject_in_multi("hello");
        }
        let mut version = self.version;
        if let Some(requested) = args.get(1) {
            version = match parse_int(requested) {
                Ok(2) => RespVersion::Resp2,
                Ok(3) => RespVersion::Resp3,
                _ => return CommandError::NoProto.into(),
            };
        }

        let credentials = match args.get(2..).unwrap_or(&[]) {
            [] => None,
            [option, user, password] if eq_ignore_ascii_case(option, b"AUTH") => Some((user, password)),
            _ => return CommandError::Syntax.into(),
        };

        if let Some((user, password)) = credentials {
            if let Err(err) = self.check_password(state, Some(user), password) {
                return err.into();
            }
        }
        if !self.authenticated {
            return CommandError::NoAuth.into();
        }

        self.version = version;
        let proto = match version {
            RespVersion::Resp2 => 2,
            RespVersion::Resp3 => 3,
        };
        Reply::Map(vec![
            (Reply::bulk("server"), Reply::bulk(SERVER_NAME)),
            (Reply::bulk("version"), Reply::bulk(VERSION)),
            (Reply::bulk("proto"), Reply::Integer(proto)),
            (Reply::bulk("id"), Reply::Integer(self.id as i64)),
            (Reply::bulk("mode"), Reply::bulk("standalone")),
            (Reply::bulk("role"), Reply::bulk("master")),
            (Reply::bulk("modules"), Reply::Array(Vec::new())),
        ])
    }

    fn auth(&mut self, args: &[Vec<u8>], state: &ServerState) -> Reply {
        if self.queue.is_some() {
            return self.reject_in_multi("auth");
        }
        let result = match args.len() {
            2 => self.check_password(state, None, &args[1]),
            3 => self.check_password(state, Some(&args[1]), &args[2]),
            _ => Err(CommandError::WrongArity("auth".to_string())),
        };
        match result {
            Ok(()) => Reply::ok(),
            Err(err) => err.into(),
        }
    }

    fn check_password(
        &mut self,
        state: &ServerState,
        user: Option<&Vec<u8>>,
        password: &[u8],
    ) -> Result<(), CommandError> {
        let expected = state.password.as_deref().ok_or_else(|| {
            CommandError::Other(
                "AUTH <password> called without any password configured for the default user. \
                 Are you sure your configuration is correct?"
                    .to_string(),
            )
        })?;
        let user_ok = user.map_or(true, |user| user.as_slice() == b"default");
        if user_ok && password == expected.as_bytes() {
            self.authenticated = true;
            Ok(())
        } else {
            warn!(client = self.id, "authentication failed");
            Err(CommandError::WrongPass)
        }
    }

    fn multi(&mut self, args: &[Vec<u8>]) -> Reply {
        if args.len() != 1 {
            return CommandError::WrongArity("multi".to_string()).into();
        }
        if self.queue.is_some() {
            return CommandError::Other("MULTI calls can not be nested".to_string()).into();
        }
        self.queue = Some(Vec::new());
        self.dirty = false;
        Reply::ok()
    }

    fn exec(&mut self, args: &[Vec<u8>], state: &ServerState) -> Reply {
        let queue = match self.queue.take() {
            Some(queue) => queue,
            None => return CommandError::Other("EXEC without MULTI".to_string()).into(),
        };
        if std::mem::take(&mut self.dirty) || args.len() != 1 {
            debug!(client = self.id, queued = queue.len(), "transaction aborted");
            return CommandError::Raw(
                "EXECABORT Transaction discarded because of previous errors.".to_string(),
            )
            .into();
        }

        let mut db = state.store.lock();
        Reply::Array(
            queue
                .iter()
                .map(|command| run_locked(&mut db, state, command, self.version))
                .collect(),
        )
    }

    fn discard(&mut self, args: &[Vec<u8>]) -> Reply {
        if args.len() != 1 {
            return CommandError::WrongArity("discard".to_string()).into();
        }
        match self.queue.take() {
            Some(_) => {
                self.dirty = false;
                Reply::ok()
            }
            None => CommandError::Other("DISCARD without MULTI".to_string()).into(),
        }
    }

    fn enqueue(&mut self, args: &[Vec<u8>]) -> Reply {
        if let Err(err) = validate_queued(args) {
            self.dirty = true;
            return err.into();
        }
        if let Some(queue) = self.queue.as_mut() {
            queue.push(args.to_vec());
        }
        Reply::SimpleString("QUEUED".to_string())
    }

    fn reject_in_multi(&mut self, name: &str) -> Reply {
        self.dirty = true;
        CommandError::Other(format!("Command '{}' not allowed inside a transaction", name)).into()
    }

    fn debug(&self, args: &[Vec<u8>]) -> Action {
        if args.len() == 3 && eq_ignore_ascii_case(&args[1], b"SLEEP") {
            let seconds = std::str::from_utf8(&args[2])
                .ok()
                .and_then(|text| text.parse::<f64>().ok())
                .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok());
            return match seconds {
                Some(duration) => Action::Sleep(duration),
                None => Action::Reply(CommandError::NotFloat.into()),
            };
        }
        Action::Reply(CommandError::Other("DEBUG subcommand not supported".to_string()).into())
    }
}

/// Checks a command before it joins a transaction queue.
fn validate_queued(args: &[Vec<u8>]) -> Result<(), CommandError> {
    let verb = args[0].to_ascii_uppercase();
    let min_arity = match verb.as_slice() {
        b"EVAL" | b"EVALSHA" => 3,
        b"SCRIPT" => 2,
        b"INFO" => 1,
        b"HELLO" | b"AUTH" | b"DEBUG" => {
            return Err(CommandError::Other(format!(
                "Command '{}' not allowed inside a transaction",
                String::from_utf8_lossy(&verb).to_ascii_lowercase()
            )))
        }
        _ => return commands::validate(args).map(|_| ()),
    };
    if args.len() < min_arity {
        return Err(CommandError::WrongArity(
            String::from_utf8_lossy(&verb).to_ascii_lowercase(),
        ));
    }
    Ok(())
}

/// Runs a command that needs the keyspace lock: data commands, scripts and
/// server introspection.
fn run_locked(db: &mut Db, state: &ServerState, args: &[Vec<u8>], version: RespVersion) -> Reply {
    let ctx = Context {
        version,
        now: Instant::now(),
    };
    let verb = args[0].to_ascii_uppercase();
    match verb.as_slice() {
        b"EVAL" => eval(db, state, args, &ctx, false),
        b"EVALSHA" => eval(db, state, args, &ctx, true),
        b"SCRIPT" => script_command(state, args),
        b"INFO" => info(state),
        _ => commands::execute(db, args, &ctx),
    }
}

fn eval(db: &mut Db, state: &ServerState, args: &[Vec<u8>], ctx: &Context, by_digest: bool) -> Reply {
    let name = if by_digest { "evalsha" } else { "eval" };
    if args.len() < 3 {
        return CommandError::WrongArity(name.to_string()).into();
    }

    let body = if by_digest {
        match state.scripts.get(&String::from_utf8_lossy(&args[1])) {
            Some(body) => body,
            None => return CommandError::NoScript.into(),
        }
    } else {
        match state.scripts.load(&args[1]) {
            Ok((_, body)) => body,
            Err(err) => return err.into(),
        }
    };

    let numkeys = match parse_int(&args[2]) {
        Ok(count) => count,
        Err(err) => return err.into(),
    };
    let rest = &args[3..];
    let numkeys = match usize::try_from(numkeys) {
        Ok(count) if count <= rest.len() => count,
        Ok(_) => {
            return CommandError::Other("Number of keys can't be greater than number of args".to_string())
                .into()
        }
        Err(_) => return CommandError::Other("Number of keys can't be negative".to_string()).into(),
    };
    let (keys, argv) = rest.split_at(numkeys);

    // Scripts always see RESP2-shaped replies.
    let script_ctx = Context {
        version: RespVersion::Resp2,
        now: ctx.now,
    };
    let mut call = |command: &[Vec<u8>]| commands::execute(db, command, &script_ctx);
    match script::run(&body, keys, argv, &mut call) {
        Ok(reply) => reply,
        Err(err) => {
            debug!(error = %err, "script failed");
            err.into()
        }
    }
}

fn script_command(state: &ServerState, args: &[Vec<u8>]) -> Reply {
    if args.len() < 2 {
        return CommandError::WrongArity("script".to_string()).into();
    }
    let sub = args[1].to_ascii_uppercase();
    match sub.as_slice() {
        b"LOAD" if args.len() == 3 => match state.scripts.load(&args[2]) {
            Ok((digest, _)) => Reply::bulk(digest),
            Err(err) => err.into(),
        },
        b"EXISTS" if args.len() >= 3 => Reply::Array(
            args[2..]
                .iter()
                .map(|digest| Reply::from(state.scripts.contains(&String::from_utf8_lossy(digest))))
                .collect(),
        ),
        b"FLUSH" if args.len() <= 3 => {
            state.scripts.flush();
            Reply::ok()
        }
        b"LOAD" | b"EXISTS" | b"FLUSH" => CommandError::WrongArity(format!(
            "script|{}",
            String::from_utf8_lossy(&sub).to_ascii_lowercase()
        ))
        .into(),
        _ => CommandError::Other(format!(
            "unknown subcommand '{}'",
            String::from_utf8_lossy(&args[1])
        ))
        .into(),
    }
}

/// `INFO`: only the server section is reported, whatever was asked for.
fn info(state: &ServerState) -> Reply {
    Reply::bulk(format!(
        "# Server\r\nkvlink_version:{}\r\nuptime_in_seconds:{}\r\n",
        VERSION,
        state.started.elapsed().as_secs()
    ))
}

/// Handles a single TCP client connection until it closes.
pub async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) -> io::Result<()> {
    let id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    let mut session = Session::new(id, &state);
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = BytesMut::with_capacity(8 * 1024);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            match parse_request(&mut buffer) {
                Ok(Some(args)) => {
                    if args.is_empty() {
                        continue;
                    }
                    let reply = match session.dispatch(&args, &state) {
                        Action::Reply(reply) => reply,
                        Action::Sleep(duration) => {
                            tokio::time::sleep(duration).await;
                            Reply::ok()
                        }
                    };
                    out.clear();
                    write_reply(&reply, session.version, &mut out);
                    stream.write_all(&out).await?;
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(client = id, error = %err, "protocol error; closing connection");
                    out.clear();
                    write_reply(
                        &Reply::Error(format!("ERR Protocol error: {}", err)),
                        session.version,
                        &mut out,
                    );
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

/// A bound server ready to accept connections.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    purge_interval: Duration,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.addr).await?;
        Ok(Self::from_listener(listener, config))
    }

    pub fn from_listener(listener: TcpListener, config: &ServerConfig) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new(config.password.clone())),
            purge_interval: config.purge_interval,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let expirer = start_expirer(&self.state, self.purge_interval);
        info!(addr = %self.local_addr()?, "server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        debug!(%peer, "client connected");
                        if let Err(err) = handle_connection(stream, Arc::clone(&state)).await {
                            debug!(%peer, error = %err, "connection ended with error");
                        }
                    });
                }
            }
        }

        expirer.abort();
        info!("server stopped");
        Ok(())
    }
}

/// Starts the background task that purges expired keys.
pub fn start_expirer(state: &Arc<ServerState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    let interval = if interval.is_zero() {
        Duration::from_millis(1)
    } else {
        interval
    };
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let purged = state.store.purge_expired(Instant::now());
            if purged > 0 {
                debug!(purged, "expired keys purged");
            }
        }
    })
}

/// A server running on its own thread and runtime. Dropping it stops the
/// server.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(mut self) {
        self.shutdown_now();
    }

    fn shutdown_now(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

/// Binds `config.addr` and serves it from a background thread.
pub fn spawn(config: ServerConfig) -> io::Result<ServerHandle> {
    let listener = std::net::TcpListener::bind(&config.addr)?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let (tx, rx) = oneshot::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("kvlink-server".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = match TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(err) => {
                        error!(error = %err, "failed to register listener");
                        return;
                    }
                };
                let server = Server::from_listener(listener, &config);
                let shutdown = async {
                    let _ = rx.await;
                };
                if let Err(err) = server.run_until(shutdown).await {
                    error!(error = %err, "server failed");
                }
            });
        })?;

    Ok(ServerHandle {
        addr,
        shutdown: Some(tx),
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|item| item.as_bytes().to_vec()).collect()
    }

    fn send(session: &mut Session, state: &ServerState, items: &[&str]) -> Reply {
        match session.dispatch(&args(items), state) {
            Action::Reply(reply) => reply,
            Action::Sleep(_) => Reply::ok(),
        }
    }

    #[test]
    fn transaction_runs_queued_commands() {
        let state = ServerState::new(None);
        let mut session = Session::new(1, &state);
        assert_eq!(send(&mut session, &state, &["MULTI"]), Reply::ok());
        assert_eq!(
            send(&mut session, &state, &["SET", "k", "v"]),
            Reply::SimpleString("QUEUED".to_string())
        );
        assert_eq!(
            send(&mut session, &state, &["GET", "k"]),
            Reply::SimpleString("QUEUED".to_string())
        );
        assert_eq!(
            send(&mut session, &state, &["EXEC"]),
            Reply::Array(vec![Reply::ok(), Reply::bulk("v")])
        );
    }

    #[test]
    fn queue_error_aborts_transaction() {
        let state = ServerState::new(None);
        let mut session = Session::new(1, &state);
        send(&mut session, &state, &["MULTI"]);
        send(&mut session, &state, &["SET", "k", "v"]);
        assert!(send(&mut session, &state, &["NOPE"]).is_error());
        match send(&mut session, &state, &["EXEC"]) {
            Reply::Error(text) => assert!(text.starts_with("EXECABORT")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(send(&mut session, &state, &["GET", "k"]), Reply::Nil);
    }

    #[test]
    fn exec_and_discard_require_multi() {
        let state = ServerState::new(None);
        let mut session = Session::new(1, &state);
        assert!(send(&mut session, &state, &["EXEC"]).is_error());
        assert!(send(&mut session, &state, &["DISCARD"]).is_error());
        send(&mut session, &state, &["MULTI"]);
        assert!(send(&mut session, &state, &["MULTI"]).is_error());
        assert_eq!(send(&mut session, &state, &["DISCARD"]), Reply::ok());
    }

    #[test]
    fn password_gates_commands() {
        let state = ServerState::new(Some("secret".to_string()));
        let mut session = Session::new(1, &state);
        assert_eq!(
            send(&mut session, &state, &["PING"]),
            Reply::Error("NOAUTH Authentication required.".to_string())
        );
        assert!(send(&mut session, &state, &["AUTH", "wrong"]).is_error());
        assert_eq!(send(&mut session, &state, &["AUTH", "default", "secret"]), Reply::ok());
        assert_eq!(
            send(&mut session, &state, &["PING"]),
            Reply::SimpleString("PONG".to_string())
        );
    }

    #[test]
    fn hello_switches_protocol() {
        let state = ServerState::new(None);
        let mut session = Session::new(7, &state);
        match send(&mut session, &state, &["HELLO", "3"]) {
            Reply::Map(pairs) => assert!(pairs.contains(&(Reply::bulk("proto"), Reply::Integer(3)))),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.version, RespVersion::Resp3);
        assert!(send(&mut session, &state, &["HELLO", "2", "SETNAME", "me"]).is_error());
        assert_eq!(
            send(&mut session, &state, &["HELLO", "4"]),
            Reply::Error("NOPROTO unsupported protocol version".to_string())
        );
        assert_eq!(session.version, RespVersion::Resp3);
    }

    #[test]
    fn evalsha_requires_loaded_script() {
        let state = ServerState::new(None);
        let mut session = Session::new(1, &state);
        let digest = "e0e1f9fabfc9d4800c877a703b823ac0578ff8db";
        assert_eq!(
            send(&mut session, &state, &["EVALSHA", digest, "0"]),
            Reply::Error("NOSCRIPT No matching script. Please use EVAL.".to_string())
        );
        assert_eq!(send(&mut session, &state, &["SCRIPT", "LOAD", "return 1"]), Reply::bulk(digest));
        assert_eq!(send(&mut session, &state, &["EVALSHA", digest, "0"]), Reply::Integer(1));
        assert_eq!(send(&mut session, &state, &["SCRIPT", "FLUSH"]), Reply::ok());
        assert_eq!(
            send(&mut session, &state, &["SCRIPT", "EXISTS", digest]),
            Reply::Array(vec![Reply::Integer(0)])
        );
    }

    #[test]
    fn eval_checks_key_count() {
        let state = ServerState::new(None);
        let mut session = Session::new(1, &state);
        assert!(send(&mut session, &state, &["EVAL", "return 1", "2", "a"]).is_error());
        assert!(send(&mut session, &state, &["EVAL", "return 1", "-1"]).is_error());
        assert_eq!(
            send(&mut session, &state, &["EVAL", "return redis.call('SET', KEYS[1], ARGV[1])", "1", "k", "v"]),
            Reply::ok()
        );
        assert_eq!(send(&mut session, &state, &["GET", "k"]), Reply::bulk("v"));
    }
}
