//! RPC Surface (C6): token-authenticated unary + server-streaming operations
//! mirroring the Session/Worktree/TaskRouter services, so the in-process and
//! remote paths the caller drives are behaviorally identical (spec §9,
//! "in-process vs remote parity").
//!
//! The wire encoding is deliberately narrow: every message is a length-prefixed
//! (`u32` big-endian) JSON payload over a plain TCP stream. Any framing would
//! satisfy the spec's "typed request/response pairs" requirement; this one is
//! grounded on the teacher's own `localhost_runtime` raw-`TcpListener` usage,
//! simplified to one frame-per-message instead of an HTTP server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::broadcaster::SharedBroadcaster;
use crate::error::BrambleError;
use crate::core::session_manager::{
    Event, OutputLine, Session, SessionStatus, SessionType, SharedSessionManager, StartSessionOptions, StoredSession,
};
use crate::core::task_router::{RouteRequest, TaskRouter};
use crate::core::worktree_engine::{GatherContextOptions, MergeOptions, SyncReport, Worktree, WorktreeEngine, WorktreeStatus};

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// Every request carries its bearer token alongside the operation; this is
/// the "request metadata" the spec's interceptor inspects, just expressed in
/// this framing's envelope rather than an HTTP header.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub token: String,
    pub op: RpcOp,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "service", content = "op", rename_all = "camelCase")]
pub enum RpcOp {
    Session(SessionOp),
    Worktree(WorktreeOp),
    TaskRouter(TaskRouterOp),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum SessionOp {
    StartSession { session_type: SessionType, worktree_name: String, prompt: String, opts: StartSessionOptions },
    StopSession { id: String },
    SendFollowUp { id: String, message: String },
    CompleteSession { id: String },
    DeleteSession { id: String },
    GetSessionInfo { id: String },
    GetSessionsForWorktree { worktree_name: String },
    GetAllSessions,
    GetSessionOutput { worktree_name: String, id: String },
    CountByStatus,
    LoadHistorySessions { worktree_name: String },
    LoadSessionFromHistory { worktree_name: String, id: String },
    IsInTmuxMode,
    /// Upgrades the connection: after this request, the server writes a
    /// stream of framed `Event` messages instead of one `RpcResponse`.
    StreamEvents { buf_size: usize },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WorktreeOp {
    List,
    GetGitStatus { branch: String },
    FetchAllPrInfo,
    NewAtomic { branch: String, base: String, goal: String },
    Remove { name_or_branch: String, delete_branch: bool },
    Sync { branch: Option<String> },
    MergePrForBranch { branch: String, opts: MergeOptions },
    GatherContext { branch: String, opts: GatherContextOptions },
    ResetToDefault { branch: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum TaskRouterOp {
    Route { req: RouteRequest },
}

// Mutating worktree calls (`Sync`, `MergePrForBranch`) already return a
// `messages: Vec<String>` field on their own result type (`SyncReport`,
// `MergeResult`); that's the per-call buffer the design note asks for, so it
// rides along in `RpcResponse::Ok` like any other payload rather than a
// separate side-channel.

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "camelCase")]
pub enum RpcResponse {
    Ok(serde_json::Value),
    NotFound(String),
    Exists(String),
    Conflict(String),
    Subprocess(String),
    Unauthenticated,
    BudgetExceeded(String),
    Cancelled,
    Internal(String),
}

impl RpcResponse {
    fn from_result<T: Serialize>(r: anyhow::Result<T>) -> Self {
        match r {
            Ok(v) => RpcResponse::Ok(serde_json::to_value(v).unwrap_or(serde_json::Value::Null)),
            Err(e) => Self::from_error(e),
        }
    }

    /// Routes a component-boundary error to its named §7 taxonomy variant
    /// when the call site raised a `BrambleError`; anything else (a leaf
    /// `anyhow::Context` wrapping raw I/O, say) falls back to `Internal`.
    fn from_error(e: anyhow::Error) -> Self {
        match e.downcast::<BrambleError>() {
            Ok(BrambleError::NotFound(msg)) => RpcResponse::NotFound(msg),
            Ok(BrambleError::Exists(msg)) => RpcResponse::Exists(msg),
            Ok(BrambleError::Conflict(msg)) => RpcResponse::Conflict(msg),
            Ok(BrambleError::Subprocess { cmd, stderr_tail }) => {
                RpcResponse::Subprocess(format!("{cmd}: {stderr_tail}"))
            }
            Ok(BrambleError::Network(msg)) => RpcResponse::Subprocess(msg),
            Ok(BrambleError::Unauthenticated) => RpcResponse::Unauthenticated,
            Ok(BrambleError::BudgetExceeded(msg)) => RpcResponse::BudgetExceeded(msg),
            Ok(BrambleError::Cancelled) => RpcResponse::Cancelled,
            Ok(BrambleError::HookFailure(msg)) => RpcResponse::Internal(format!("hook failure: {msg}")),
            Err(e) => RpcResponse::Internal(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).context("serialize rpc frame")?;
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes()).context("write frame length")?;
    stream.write_all(&bytes).context("write frame body")?;
    stream.flush().context("flush frame")?;
    Ok(())
}

fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).context("read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).context("read frame body")?;
    serde_json::from_slice(&body).context("deserialize rpc frame")
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct RpcServer {
    token: String,
    session_manager: SharedSessionManager,
    worktree_engine: Arc<WorktreeEngine>,
    broadcaster: SharedBroadcaster,
    task_router: Option<Arc<TaskRouter>>,
    stop: Arc<AtomicBool>,
}

impl RpcServer {
    pub fn new(
        token: impl Into<String>,
        session_manager: SharedSessionManager,
        worktree_engine: Arc<WorktreeEngine>,
        broadcaster: SharedBroadcaster,
        task_router: Option<Arc<TaskRouter>>,
    ) -> Self {
        Self {
            token: token.into(),
            session_manager,
            worktree_engine,
            broadcaster,
            task_router,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Binds and serves until `stop()` is called. Logs a warning if `addr`
    /// is not a loopback address, per spec §4.6 (plaintext transport, TLS
    /// out of scope here).
    pub fn serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).with_context(|| format!("bind rpc listener on {addr}"))?;
        listener.set_nonblocking(true).context("set listener nonblocking")?;
        if !addr.starts_with("127.0.0.1") && !addr.starts_with("localhost") && !addr.starts_with("[::1]") {
            warn!(addr, "rpc server bound to a non-loopback address over plaintext transport");
        }
        info!(addr, "rpc server listening");

        while !self.stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            warn!(%peer, error = %e, "rpc connection ended with error");
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e).context("accept rpc connection"),
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let envelope: RpcEnvelope = read_frame(&mut stream)?;
        if envelope.token != self.token {
            write_frame(&mut stream, &RpcResponse::Unauthenticated)?;
            bail!("unauthenticated rpc request rejected");
        }

        match envelope.op {
            RpcOp::Session(SessionOp::StreamEvents { buf_size }) => self.stream_events(stream, buf_size),
            RpcOp::Session(op) => {
                let resp = self.dispatch_session(op);
                write_frame(&mut stream, &resp)
            }
            RpcOp::Worktree(op) => {
                let resp = self.dispatch_worktree(op);
                write_frame(&mut stream, &resp)
            }
            RpcOp::TaskRouter(op) => {
                let resp = self.dispatch_task_router(op);
                write_frame(&mut stream, &resp)
            }
        }
    }

    fn stream_events(&self, mut stream: TcpStream, buf_size: usize) -> Result<()> {
        let (id, rx) = self.broadcaster.subscribe(buf_size.max(1));
        loop {
            match rx.recv() {
                Some(event) => {
                    if write_frame(&mut stream, &event).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        self.broadcaster.unsubscribe(id);
        Ok(())
    }

    fn dispatch_session(&self, op: SessionOp) -> RpcResponse {
        let mgr = &self.session_manager;
        match op {
            SessionOp::StartSession { session_type, worktree_name, prompt, opts } => {
                RpcResponse::from_result(mgr.start_session(session_type, &worktree_name, &prompt, opts))
            }
            SessionOp::StopSession { id } => RpcResponse::from_result(mgr.stop_session(&id)),
            SessionOp::SendFollowUp { id, message } => {
                match mgr.send_follow_up(&id, &message) {
                    Ok(()) => RpcResponse::Ok(serde_json::Value::Null),
                    Err(e) => RpcResponse::Conflict(e.to_string()),
                }
            }
            SessionOp::CompleteSession { id } => match mgr.complete_session(&id) {
                Ok(()) => RpcResponse::Ok(serde_json::Value::Null),
                Err(e) => RpcResponse::Conflict(e.to_string()),
            },
            SessionOp::DeleteSession { id } => match mgr.delete_session(&id) {
                Ok(()) => RpcResponse::Ok(serde_json::Value::Null),
                Err(e) => RpcResponse::Conflict(e.to_string()),
            },
            SessionOp::GetSessionInfo { id } => match mgr.get_session_info(&id) {
                Some(s) => RpcResponse::Ok(serde_json::to_value(s).unwrap()),
                None => RpcResponse::NotFound(format!("session {id}")),
            },
            SessionOp::GetSessionsForWorktree { worktree_name } => {
                RpcResponse::Ok(serde_json::to_value(mgr.get_sessions_for_worktree(&worktree_name)).unwrap())
            }
            SessionOp::GetAllSessions => RpcResponse::Ok(serde_json::to_value(mgr.get_all_sessions()).unwrap()),
            SessionOp::GetSessionOutput { worktree_name, id } => {
                RpcResponse::from_result(mgr.get_session_output(&worktree_name, &id))
            }
            SessionOp::CountByStatus => RpcResponse::Ok(serde_json::to_value(mgr.count_by_status()).unwrap()),
            SessionOp::LoadHistorySessions { worktree_name } => {
                RpcResponse::from_result(mgr.load_history_sessions(&worktree_name))
            }
            SessionOp::LoadSessionFromHistory { worktree_name, id } => {
                RpcResponse::from_result(mgr.load_session_from_history(&worktree_name, &id))
            }
            SessionOp::IsInTmuxMode => RpcResponse::Ok(serde_json::Value::Bool(false)),
            SessionOp::StreamEvents { .. } => unreachable!("handled before dispatch"),
        }
    }

    fn dispatch_worktree(&self, op: WorktreeOp) -> RpcResponse {
        let eng = &self.worktree_engine;
        match op {
            WorktreeOp::List => RpcResponse::from_result(eng.list()),
            WorktreeOp::GetGitStatus { branch } => {
                let status = eng
                    .list()
                    .and_then(|wts| wts.into_iter().find(|w| w.branch == branch).context("worktree not found"))
                    .and_then(|wt| eng.get_git_status(&wt));
                RpcResponse::from_result(status)
            }
            WorktreeOp::FetchAllPrInfo => {
                let result = eng.list().and_then(|wts| eng.fetch_all_pr_info(&wts));
                RpcResponse::from_result(result)
            }
            WorktreeOp::NewAtomic { branch, base, goal } => {
                RpcResponse::from_result(eng.new_atomic(&branch, &base, &goal))
            }
            WorktreeOp::Remove { name_or_branch, delete_branch } => {
                RpcResponse::from_result(eng.remove(&name_or_branch, delete_branch))
            }
            WorktreeOp::Sync { branch } => RpcResponse::from_result(eng.sync(branch.as_deref())),
            WorktreeOp::MergePrForBranch { branch, opts } => {
                RpcResponse::from_result(eng.merge_pr_for_branch(&branch, &opts))
            }
            WorktreeOp::GatherContext { branch, opts } => {
                let result = eng
                    .list()
                    .and_then(|wts| wts.into_iter().find(|w| w.branch == branch).context("worktree not found"))
                    .and_then(|wt| eng.gather_context(&wt, &opts));
                RpcResponse::from_result(result)
            }
            WorktreeOp::ResetToDefault { branch } => RpcResponse::from_result(eng.reset_to_default(&branch)),
        }
    }

    fn dispatch_task_router(&self, op: TaskRouterOp) -> RpcResponse {
        match op {
            TaskRouterOp::Route { req } => match &self.task_router {
                Some(router) => RpcResponse::Ok(serde_json::to_value(router.route(&req)).unwrap()),
                None => RpcResponse::Internal("task router not configured on this server".to_string()),
            },
        }
    }
}

/// Wrap a locally-generated or CLI-supplied token. Generated tokens are
/// 256 bits of hex, printed to stdout by the caller at server startup.
pub fn generate_token() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    // No real CSPRNG dependency in this stack; mix process-local entropy
    // sources the way the teacher's `ids::new_id` already does for tokens
    // that only need to be unpredictable to a casual local observer, not
    // cryptographically secure against a targeted attacker.
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let pid = std::process::id() as u128;
    let mixed = nanos ^ (pid << 64) ^ 0x9E3779B97F4A7C15u128;
    format!("{:032x}{:032x}", mixed, mixed.rotate_left(61))
}

// ---------------------------------------------------------------------------
// Client proxy
// ---------------------------------------------------------------------------

/// Implements the same call surface the in-process manager does, over one
/// TCP connection per call. `StreamEvents` is driven by `EventStreamClient`
/// instead, since it is long-lived.
pub struct RpcClient {
    addr: String,
    token: String,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self { addr: addr.into(), token: token.into() }
    }

    fn call(&self, op: RpcOp) -> Result<RpcResponse> {
        let mut stream = TcpStream::connect(&self.addr).with_context(|| format!("connect to rpc server {}", self.addr))?;
        stream.set_nodelay(true).ok();
        write_frame(&mut stream, &RpcEnvelope { token: self.token.clone(), op })?;
        read_frame(&mut stream)
    }

    fn call_typed<T: for<'de> Deserialize<'de>>(&self, op: RpcOp) -> Result<T> {
        match self.call(op)? {
            RpcResponse::Ok(v) => serde_json::from_value(v).context("decode rpc response body"),
            RpcResponse::NotFound(m) => Err(BrambleError::NotFound(m).into()),
            RpcResponse::Exists(m) => Err(BrambleError::Exists(m).into()),
            RpcResponse::Conflict(m) => Err(BrambleError::Conflict(m).into()),
            RpcResponse::Subprocess(m) => Err(BrambleError::Subprocess { cmd: String::new(), stderr_tail: m }.into()),
            RpcResponse::Unauthenticated => Err(BrambleError::Unauthenticated.into()),
            RpcResponse::BudgetExceeded(m) => Err(BrambleError::BudgetExceeded(m).into()),
            RpcResponse::Cancelled => Err(BrambleError::Cancelled.into()),
            RpcResponse::Internal(m) => bail!("{m}"),
        }
    }

    pub fn start_session(&self, session_type: SessionType, worktree_name: &str, prompt: &str, opts: StartSessionOptions) -> Result<String> {
        self.call_typed(RpcOp::Session(SessionOp::StartSession {
            session_type,
            worktree_name: worktree_name.to_string(),
            prompt: prompt.to_string(),
            opts,
        }))
    }

    pub fn stop_session(&self, id: &str) -> Result<()> {
        self.call_typed(RpcOp::Session(SessionOp::StopSession { id: id.to_string() }))
    }

    pub fn send_follow_up(&self, id: &str, message: &str) -> Result<()> {
        self.call_typed(RpcOp::Session(SessionOp::SendFollowUp { id: id.to_string(), message: message.to_string() }))
    }

    pub fn complete_session(&self, id: &str) -> Result<()> {
        self.call_typed(RpcOp::Session(SessionOp::CompleteSession { id: id.to_string() }))
    }

    pub fn delete_session(&self, id: &str) -> Result<()> {
        self.call_typed(RpcOp::Session(SessionOp::DeleteSession { id: id.to_string() }))
    }

    pub fn get_session_info(&self, id: &str) -> Result<Session> {
        self.call_typed(RpcOp::Session(SessionOp::GetSessionInfo { id: id.to_string() }))
    }

    pub fn get_all_sessions(&self) -> Result<Vec<Session>> {
        self.call_typed(RpcOp::Session(SessionOp::GetAllSessions))
    }

    pub fn get_session_output(&self, worktree_name: &str, id: &str) -> Result<Vec<OutputLine>> {
        self.call_typed(RpcOp::Session(SessionOp::GetSessionOutput { worktree_name: worktree_name.to_string(), id: id.to_string() }))
    }

    pub fn load_session_from_history(&self, worktree_name: &str, id: &str) -> Result<StoredSession> {
        self.call_typed(RpcOp::Session(SessionOp::LoadSessionFromHistory { worktree_name: worktree_name.to_string(), id: id.to_string() }))
    }

    /// Remote proxies always report `false` here (spec §9: tmux is a
    /// local-only concept).
    pub fn is_in_tmux_mode(&self) -> bool {
        false
    }

    pub fn list_worktrees(&self) -> Result<Vec<Worktree>> {
        self.call_typed(RpcOp::Worktree(WorktreeOp::List))
    }

    pub fn sync(&self, branch: Option<&str>) -> Result<SyncReport> {
        self.call_typed(RpcOp::Worktree(WorktreeOp::Sync { branch: branch.map(String::from) }))
    }

    pub fn fetch_all_pr_info(&self) -> Result<std::collections::HashMap<String, WorktreeStatus>> {
        self.call_typed(RpcOp::Worktree(WorktreeOp::FetchAllPrInfo))
    }

    pub fn route(&self, req: RouteRequest) -> Result<crate::core::task_router::RouteProposal> {
        self.call_typed(RpcOp::TaskRouter(TaskRouterOp::Route { req }))
    }
}

// ---------------------------------------------------------------------------
// Reconnecting event-stream client (spec §4.6)
// ---------------------------------------------------------------------------

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 10_000;

/// Maintains a background thread that holds one `StreamEvents` connection
/// open, forwarding events into a bounded drop-oldest channel, and
/// reconnects with exponential backoff (reset to the initial delay on every
/// successful connect) whenever the stream breaks.
pub struct EventStreamClient {
    events: Arc<Mutex<std::collections::VecDeque<Event>>>,
    buf_size: usize,
    stop: Arc<AtomicBool>,
}

impl EventStreamClient {
    pub fn start(addr: impl Into<String>, token: impl Into<String>, buf_size: usize) -> Arc<Self> {
        let this = Arc::new(Self {
            events: Arc::new(Mutex::new(std::collections::VecDeque::new())),
            buf_size,
            stop: Arc::new(AtomicBool::new(false)),
        });
        let addr = addr.into();
        let token = token.into();
        let worker = this.clone();
        thread::spawn(move || worker.run(addr, token));
        this
    }

    fn run(&self, addr: String, token: String) {
        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
        while !self.stop.load(Ordering::SeqCst) {
            match self.connect_and_drain(&addr, &token) {
                Ok(()) => {
                    backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "event stream disconnected; reconnecting");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
                }
            }
        }
    }

    fn connect_and_drain(&self, addr: &str, token: &str) -> Result<()> {
        let mut stream = TcpStream::connect(addr).with_context(|| format!("connect to rpc server {addr}"))?;
        write_frame(&mut stream, &RpcEnvelope { token: token.to_string(), op: RpcOp::Session(SessionOp::StreamEvents { buf_size: self.buf_size }) })?;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            let event: Event = read_frame(&mut stream)?;
            let mut q = self.events.lock().expect("event stream client queue mutex poisoned");
            if q.len() >= self.buf_size {
                q.pop_front();
            }
            q.push_back(event);
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.events.lock().expect("event stream client queue mutex poisoned").pop_front()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_distinct_and_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn unauthenticated_request_is_rejected_before_dispatch() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::core::session_store::SessionStore::new(root.path()));
        let engine = Arc::new(WorktreeEngine::new(root.path(), "repo"));
        let agents: crate::core::provider::SharedAgentRegistry = Arc::new(Mutex::new(crate::core::provider::AgentRegistry::detect()));
        let (mgr, _rx) = crate::core::session_manager::SessionManager::new(store, engine.clone(), agents, "repo");
        let broadcaster = crate::core::broadcaster::Broadcaster::new();
        let server = Arc::new(RpcServer::new("right-token", mgr, engine, broadcaster, None));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let server_for_thread = server.clone();
        let addr_for_thread = addr.clone();
        thread::spawn(move || {
            let _ = server_for_thread.serve(&addr_for_thread);
        });
        thread::sleep(Duration::from_millis(100));

        let client = RpcClient::new(&addr, "wrong-token");
        let result = client.get_all_sessions();
        assert!(result.is_err());
        server.stop();
    }
}
