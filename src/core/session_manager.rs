//! Session Manager (C4): per-session lifecycle state machine, fan-in of
//! provider events into a single outbound channel, follow-up queueing.
//!
//! Heavily expanded from the teacher's `core::session_manager` stub (which
//! only tracked a PTY claim/release pair) into the full state machine from
//! spec §4.4, reusing the teacher's general shape: a shared map guarded by a
//! single mutex, one runner per live session, and a manager that never blocks
//! on provider I/O while holding that mutex.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use crate::error::BrambleError;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::core::ids::now_rfc3339;
use crate::core::ids::new_id;
use crate::core::provider::{
    long_running_provider_for, AgentEvent, AgentType, CancellationToken, ExecuteOptions, SharedAgentRegistry, Usage,
};
use crate::core::session_store::SessionStore;
use crate::core::worktree_engine::{WorktreeContext, WorktreeEngine};

// ---------------------------------------------------------------------------
// Data model (spec §3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Planner,
    Builder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Idle,
    Stopped,
    Failed,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed | SessionStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    InProcess,
    Tmux,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub current_phase: Option<String>,
    pub current_tool: Option<String>,
    pub status_line: Option<String>,
    pub turn_count: u32,
    pub total_cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub last_activity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub worktree_path: String,
    pub worktree_name: String,
    pub prompt: String,
    pub title: Option<String>,
    pub model: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_msg: Option<String>,
    pub progress: SessionProgress,
    pub runner_type: RunnerType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLineType {
    Text,
    Thinking,
    ToolStart,
    ToolEnd,
    ToolResult,
    Error,
    TurnComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub line_type: OutputLineType,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_id: Option<String>,
    pub tool_state: Option<ToolState>,
    pub tool_input: Option<serde_json::Value>,
    pub tool_result: Option<serde_json::Value>,
    pub turn_number: u32,
    pub start_time: Option<String>,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub is_error: bool,
}

impl OutputLine {
    fn text(content: impl Into<String>, turn_number: u32) -> Self {
        Self {
            timestamp: now_rfc3339(),
            line_type: OutputLineType::Text,
            content: content.into(),
            tool_name: None,
            tool_id: None,
            tool_state: None,
            tool_input: None,
            tool_result: None,
            turn_number,
            start_time: None,
            duration_ms: None,
            cost_usd: None,
            is_error: false,
        }
    }

    fn turn_complete(usage: &Usage, turn_number: u32) -> Self {
        Self {
            timestamp: now_rfc3339(),
            line_type: OutputLineType::TurnComplete,
            content: String::new(),
            tool_name: None,
            tool_id: None,
            tool_state: None,
            tool_input: None,
            tool_result: None,
            turn_number,
            start_time: None,
            duration_ms: None,
            cost_usd: Some(usage.cost_usd),
            is_error: false,
        }
    }

    fn error(msg: impl Into<String>, turn_number: u32) -> Self {
        Self {
            timestamp: now_rfc3339(),
            line_type: OutputLineType::Error,
            content: msg.into(),
            tool_name: None,
            tool_id: None,
            tool_state: None,
            tool_input: None,
            tool_result: None,
            turn_number,
            start_time: None,
            duration_ms: None,
            cost_usd: None,
            is_error: true,
        }
    }

    fn thinking(delta: impl Into<String>, turn_number: u32) -> Self {
        Self {
            timestamp: now_rfc3339(),
            line_type: OutputLineType::Thinking,
            content: delta.into(),
            tool_name: None,
            tool_id: None,
            tool_state: None,
            tool_input: None,
            tool_result: None,
            turn_number,
            start_time: None,
            duration_ms: None,
            cost_usd: None,
            is_error: false,
        }
    }

    fn tool_start(name: String, id: String, input: serde_json::Value, turn_number: u32) -> Self {
        let now = now_rfc3339();
        Self {
            timestamp: now.clone(),
            line_type: OutputLineType::ToolStart,
            content: String::new(),
            tool_name: Some(name),
            tool_id: Some(id),
            tool_state: Some(ToolState::Running),
            tool_input: Some(input),
            tool_result: None,
            turn_number,
            start_time: Some(now),
            duration_ms: None,
            cost_usd: None,
            is_error: false,
        }
    }

    fn tool_end(id: String, result: serde_json::Value, is_error: bool, duration_ms: u64, turn_number: u32) -> Self {
        Self {
            timestamp: now_rfc3339(),
            line_type: OutputLineType::ToolEnd,
            content: String::new(),
            tool_name: None,
            tool_id: Some(id),
            tool_state: Some(if is_error { ToolState::Failed } else { ToolState::Complete }),
            tool_input: None,
            tool_result: Some(result),
            turn_number,
            start_time: None,
            duration_ms: Some(duration_ms),
            cost_usd: None,
            is_error,
        }
    }

    /// Converts one provider event into the `OutputLine` it produces, if any —
    /// `Ready` is a provider-internal readiness signal with no line shape of
    /// its own (spec §3's `OutputLine` type list has no `ready` variant).
    fn from_agent_event(event: AgentEvent, turn_number: u32) -> Option<Self> {
        match event {
            AgentEvent::Ready => None,
            AgentEvent::TextDelta { delta } => Some(Self::text(delta, turn_number)),
            AgentEvent::Thinking { delta } => Some(Self::thinking(delta, turn_number)),
            AgentEvent::ToolStart { name, id, input } => Some(Self::tool_start(name, id, input, turn_number)),
            AgentEvent::ToolEnd { id, result, is_error, duration_ms } => {
                Some(Self::tool_end(id, result, is_error, duration_ms, turn_number))
            }
            AgentEvent::TurnComplete { usage } => Some(Self::turn_complete(&usage, turn_number)),
            AgentEvent::Error { kind, msg } => Some(Self::error(format!("{kind}: {msg}"), turn_number)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Event {
    StateChange { session_id: String, old_status: SessionStatus, new_status: SessionStatus },
    Output { session_id: String, line: OutputLine },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub session: Session,
    pub output: Vec<OutputLine>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionOptions {
    pub base_branch: Option<String>,
    pub goal: Option<String>,
    pub agent: Option<AgentType>,
    pub model: Option<String>,
    pub title: Option<String>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct LiveEntry {
    session: Session,
    cancel: CancellationToken,
    follow_up_tx: Option<Sender<String>>,
    handle: Option<JoinHandle<()>>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, LiveEntry>>,
    store: Arc<SessionStore>,
    worktree_engine: Arc<WorktreeEngine>,
    agents: SharedAgentRegistry,
    event_tx: Sender<Event>,
    repo_name: String,
}

pub type SharedSessionManager = Arc<SessionManager>;

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        worktree_engine: Arc<WorktreeEngine>,
        agents: SharedAgentRegistry,
        repo_name: impl Into<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (event_tx, event_rx) = mpsc::channel();
        let mgr = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            worktree_engine,
            agents,
            event_tx,
            repo_name: repo_name.into(),
        });
        (mgr, event_rx)
    }

    fn emit(&self, ev: Event) {
        let _ = self.event_tx.send(ev);
    }

    fn transition(&self, id: &str, new_status: SessionStatus) {
        let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
        if let Some(entry) = sessions.get_mut(id) {
            let old_status = entry.session.status;
            entry.session.status = new_status;
            if new_status == SessionStatus::Running && entry.session.started_at.is_none() {
                entry.session.started_at = Some(now_rfc3339());
            }
            if new_status.is_terminal() {
                entry.session.completed_at = Some(now_rfc3339());
            }
            let _ = self.store.save(&self.repo_name, &entry.session.worktree_name, &entry.session);
            drop(sessions);
            // State transitions precede any output emitted under the new state (spec invariant 1).
            self.emit(Event::StateChange { session_id: id.to_string(), old_status, new_status });
        }
    }

    fn append_output(&self, id: &str, worktree_name: &str, line: OutputLine) {
        let _ = self.store.append_output(&self.repo_name, worktree_name, id, &line);
        self.emit(Event::Output { session_id: id.to_string(), line });
    }

    /// `StartSession(type, worktreePath, prompt) -> id`.
    pub fn start_session(
        self: &Arc<Self>,
        session_type: SessionType,
        worktree_name: &str,
        prompt: &str,
        opts: StartSessionOptions,
    ) -> Result<String> {
        let id = new_id("sess");

        let worktree_path = {
            let existing = self.worktree_engine.list()?.into_iter().find(|w| w.branch == worktree_name);
            match existing {
                Some(w) => w.path,
                None if session_type == SessionType::Builder => {
                    let base = match &opts.base_branch {
                        Some(b) => b.clone(),
                        None => self.worktree_engine.default_base_branch()?,
                    };
                    let goal = opts.goal.clone().unwrap_or_default();
                    self.worktree_engine
                        .new_atomic(worktree_name, &base, &goal)?
                        .to_string_lossy()
                        .to_string()
                }
                None => {
                    return Err(BrambleError::NotFound(format!(
                        "worktree '{worktree_name}' does not exist and session type is not builder"
                    ))
                    .into())
                }
            }
        };

        let agent = opts.agent.unwrap_or(AgentType::ClaudeCode);
        {
            let registry = self.agents.lock().expect("agent registry mutex poisoned");
            if !registry.is_installed(agent) {
                warn!(?agent, "requested agent not installed; falling back to terminal");
            }
        }

        let session = Session {
            id: id.clone(),
            session_type,
            status: SessionStatus::Pending,
            worktree_path: worktree_path.clone(),
            worktree_name: worktree_name.to_string(),
            prompt: prompt.to_string(),
            title: opts.title.clone(),
            model: opts.model.clone(),
            created_at: now_rfc3339(),
            started_at: None,
            completed_at: None,
            error_msg: None,
            progress: SessionProgress::default(),
            runner_type: RunnerType::InProcess,
        };
        self.store.save(&self.repo_name, worktree_name, &session)?;

        let cancel = CancellationToken::new();
        let (follow_up_tx, follow_up_rx) = mpsc::channel::<String>();

        {
            let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
            sessions.insert(
                id.clone(),
                LiveEntry { session: session.clone(), cancel: cancel.clone(), follow_up_tx: Some(follow_up_tx), handle: None },
            );
        }
        self.emit(Event::StateChange {
            session_id: id.clone(),
            old_status: SessionStatus::Pending,
            new_status: SessionStatus::Pending,
        });

        let mgr = self.clone();
        let worktree_ctx = WorktreeContext {
            branch: worktree_name.to_string(),
            path: worktree_path,
            goal: opts.goal,
            parent: self.worktree_engine.parent_of(worktree_name),
            is_dirty: false,
            ahead: 0,
            behind: 0,
            changed_files: Vec::new(),
            untracked_files: Vec::new(),
            recent_commits: Vec::new(),
            diff: None,
            diff_truncated: false,
            pr: None,
            gathered_at: now_rfc3339(),
        };
        let model = opts.model;
        let prompt_owned = prompt.to_string();
        let id_for_thread = id.clone();

        let handle = thread::spawn(move || {
            let _span = info_span!("session_runner", session_id = %id_for_thread).entered();
            mgr.run_session(id_for_thread, agent, prompt_owned, worktree_ctx, model, cancel, follow_up_rx);
        });

        {
            let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
            if let Some(entry) = sessions.get_mut(&id) {
                entry.handle = Some(handle);
            }
        }

        Ok(id)
    }

    /// The sole writer of this session's OutputLines and StateChanges
    /// (spec §4.4's "Runner" requirement).
    fn run_session(
        self: Arc<Self>,
        id: String,
        agent: AgentType,
        prompt: String,
        worktree_ctx: WorktreeContext,
        model: Option<String>,
        cancel: CancellationToken,
        follow_up_rx: std::sync::mpsc::Receiver<String>,
    ) {
        let mut provider = long_running_provider_for(agent);
        let events_rx = provider.take_events();
        self.transition(&id, SessionStatus::Running);

        let opts = ExecuteOptions { model, extra_args: Vec::new() };
        if let Err(e) = provider.start(&cancel, &worktree_ctx, &opts) {
            warn!(error = %e, "provider failed to start");
            self.append_output(&id, &worktree_ctx.branch, OutputLine::error(e.to_string(), 0));
            self.transition(&id, SessionStatus::Failed);
            return;
        }

        let mut turn_number: u32 = 0;
        let mut current_prompt = prompt;

        loop {
            turn_number += 1;
            let result = provider.send_message(&cancel, &current_prompt);
            self.drain_events(&id, &worktree_ctx.branch, events_rx.as_ref(), turn_number);
            match result {
                Ok(agent_result) => {
                    self.update_progress(&id, &agent_result.usage, turn_number);
                    if !agent_result.success {
                        self.append_output(&id, &worktree_ctx.branch, OutputLine::error("agent turn reported failure", turn_number));
                        self.transition(&id, SessionStatus::Failed);
                        provider.stop();
                        return;
                    }
                    self.transition(&id, SessionStatus::Idle);
                }
                Err(e) => {
                    warn!(error = %e, "provider execution failed");
                    self.append_output(&id, &worktree_ctx.branch, OutputLine::error(e.to_string(), turn_number));
                    self.transition(&id, SessionStatus::Failed);
                    provider.stop();
                    return;
                }
            }

            if cancel.is_cancelled() {
                self.transition(&id, SessionStatus::Stopped);
                provider.stop();
                return;
            }

            // Idle: wait for a follow-up or for the channel to close (StopSession/shutdown).
            match follow_up_rx.recv() {
                Ok(msg) => {
                    current_prompt = msg;
                }
                Err(_) => {
                    self.transition(&id, SessionStatus::Stopped);
                    provider.stop();
                    return;
                }
            }
            self.transition(&id, SessionStatus::Running);
        }
    }

    /// Drains every event the provider queued for the turn that just
    /// completed, translating each into an `OutputLine` in arrival order
    /// before the caller moves on to the next state transition (spec
    /// invariant 1: a state change never precedes output emitted under the
    /// prior state).
    fn drain_events(&self, id: &str, branch: &str, events_rx: Option<&Receiver<AgentEvent>>, turn_number: u32) {
        let Some(rx) = events_rx else { return };
        while let Ok(event) = rx.try_recv() {
            if let Some(line) = OutputLine::from_agent_event(event, turn_number) {
                self.append_output(id, branch, line);
            }
        }
    }

    fn update_progress(&self, id: &str, usage: &Usage, turn_number: u32) {
        let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
        if let Some(entry) = sessions.get_mut(id) {
            entry.session.progress.turn_count = turn_number;
            entry.session.progress.total_cost_usd += usage.cost_usd;
            entry.session.progress.input_tokens += usage.input_tokens;
            entry.session.progress.output_tokens += usage.output_tokens;
            entry.session.progress.cache_read_tokens += usage.cache_read_tokens;
            entry.session.progress.last_activity = Some(now_rfc3339());
        }
    }

    /// `SendFollowUp(id, message)` — only valid in `idle`.
    pub fn send_follow_up(&self, id: &str, message: &str) -> Result<()> {
        let sessions = self.sessions.lock().expect("session map mutex poisoned");
        let entry = sessions.get(id).ok_or_else(|| BrambleError::NotFound(format!("session {id}")))?;
        if entry.session.status != SessionStatus::Idle {
            return Err(BrambleError::Conflict(format!(
                "SendFollowUp only valid when idle (current status: {:?})",
                entry.session.status
            ))
            .into());
        }
        let tx = entry.follow_up_tx.clone().context("session has no follow-up channel")?;
        tx.send(message.to_string()).map_err(|_| anyhow::anyhow!("runner channel closed"))?;
        Ok(())
    }

    /// `StopSession(id)` — cancels the runner; expects transition to `stopped` or terminal.
    pub fn stop_session(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
        let entry = sessions.get_mut(id).ok_or_else(|| BrambleError::NotFound(format!("session {id}")))?;
        entry.cancel.cancel();
        // Unblock a runner parked on follow_up_rx.recv() by dropping our sender handle.
        entry.follow_up_tx = None;
        Ok(())
    }

    /// `CompleteSession(id)` — valid in `idle` or any terminal state (idempotent terminal->terminal,
    /// per the open-question decision recorded in DESIGN.md).
    pub fn complete_session(&self, id: &str) -> Result<()> {
        let status = {
            let sessions = self.sessions.lock().expect("session map mutex poisoned");
            sessions
                .get(id)
                .ok_or_else(|| BrambleError::NotFound(format!("session {id}")))?
                .session
                .status
        };
        if status != SessionStatus::Idle && !status.is_terminal() {
            return Err(BrambleError::Conflict(format!(
                "CompleteSession only valid from idle or terminal states (current: {status:?})"
            ))
            .into());
        }
        if status == SessionStatus::Completed {
            return Ok(());
        }
        self.transition(id, SessionStatus::Completed);
        Ok(())
    }

    /// `DeleteSession(id)` — only valid in terminal; removes the live record.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
        let entry = sessions.get(id).ok_or_else(|| BrambleError::NotFound(format!("session {id}")))?;
        if !entry.session.status.is_terminal() {
            return Err(BrambleError::Conflict(format!(
                "DeleteSession only valid from a terminal state (current: {:?})",
                entry.session.status
            ))
            .into());
        }
        if let Some(mut e) = sessions.remove(id) {
            e.follow_up_tx = None;
            if let Some(h) = e.handle.take() {
                let _ = h.join();
            }
        }
        Ok(())
    }

    pub fn get_session_info(&self, id: &str) -> Option<Session> {
        self.sessions.lock().expect("session map mutex poisoned").get(id).map(|e| e.session.clone())
    }

    pub fn get_sessions_for_worktree(&self, worktree_name: &str) -> Vec<Session> {
        self.sessions
            .lock()
            .expect("session map mutex poisoned")
            .values()
            .filter(|e| e.session.worktree_name == worktree_name)
            .map(|e| e.session.clone())
            .collect()
    }

    pub fn get_all_sessions(&self) -> Vec<Session> {
        self.sessions.lock().expect("session map mutex poisoned").values().map(|e| e.session.clone()).collect()
    }

    pub fn get_session_output(&self, worktree_name: &str, id: &str) -> Result<Vec<OutputLine>> {
        self.store.load_output(&self.repo_name, worktree_name, id)
    }

    pub fn count_by_status(&self) -> HashMap<SessionStatus, usize> {
        let mut counts = HashMap::new();
        for e in self.sessions.lock().expect("session map mutex poisoned").values() {
            *counts.entry(e.session.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn load_history_sessions(&self, worktree_name: &str) -> Result<Vec<Session>> {
        self.store.load_history_sessions(&self.repo_name, worktree_name)
    }

    pub fn load_session_from_history(&self, worktree_name: &str, id: &str) -> Result<StoredSession> {
        self.store.load_session(&self.repo_name, worktree_name, id)
    }

    /// Shutdown: every non-terminal session transitions to `stopped` and is
    /// persisted (spec §5), runners are cancelled and joined.
    pub fn shutdown(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().expect("session map mutex poisoned");
            sessions.keys().cloned().collect()
        };
        for id in &ids {
            let _ = self.stop_session(id);
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut sessions = self.sessions.lock().expect("session map mutex poisoned");
            sessions.values_mut().filter_map(|e| e.handle.take()).collect()
        };
        for h in handles {
            let _ = h.join();
        }
        info!("session manager shut down");
    }

    pub fn is_in_tmux_mode(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_terminal_classification() {
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
    }
}
