//! Session Store (C3): durable session snapshots and append-only output logs.
//!
//! Grounded on the teacher's `core::persistence` snapshot file layout
//! (one JSON file per record, directory keyed by project/session) but
//! generalized to a true atomic write (temp file + rename) since this
//! store, unlike the teacher's, is the system of record a crashed process
//! must be able to resume from cleanly (spec §9 decision: flush/fsync
//! after every complete output line).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::session_manager::{OutputLine, Session, StoredSession};

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sessions_dir(&self, repo: &str, worktree_name: &str) -> PathBuf {
        self.root.join(repo).join(worktree_name).join("sessions")
    }

    fn session_path(&self, repo: &str, worktree_name: &str, id: &str) -> PathBuf {
        self.sessions_dir(repo, worktree_name).join(format!("{id}.json"))
    }

    fn output_path(&self, repo: &str, worktree_name: &str, id: &str) -> PathBuf {
        self.sessions_dir(repo, worktree_name).join(format!("{id}.output.jsonl"))
    }

    fn write_atomic(path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(contents.as_bytes()).with_context(|| format!("write {}", tmp.display()))?;
            f.sync_all().with_context(|| format!("fsync {}", tmp.display()))?;
        }
        fs::rename(&tmp, path).with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Persists the full session record, overwriting any prior snapshot.
    pub fn save(&self, repo: &str, worktree_name: &str, session: &Session) -> Result<()> {
        let path = self.session_path(repo, worktree_name, &session.id);
        let text = serde_json::to_string_pretty(session).context("serialize session")?;
        Self::write_atomic(&path, &text)
    }

    /// Appends one output line, fsyncing before returning (spec §9 decision:
    /// no output is acknowledged to callers until it has survived a crash).
    pub fn append_output(&self, repo: &str, worktree_name: &str, session_id: &str, line: &OutputLine) -> Result<()> {
        let path = self.output_path(repo, worktree_name, session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let mut text = serde_json::to_string(line).context("serialize output line")?;
        text.push('\n');
        f.write_all(text.as_bytes()).with_context(|| format!("append {}", path.display()))?;
        f.sync_all().with_context(|| format!("fsync {}", path.display()))?;
        Ok(())
    }

    pub fn load_output(&self, repo: &str, worktree_name: &str, session_id: &str) -> Result<Vec<OutputLine>> {
        let path = self.output_path(repo, worktree_name, session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let f = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let reader = BufReader::new(f);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line.with_context(|| format!("read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: OutputLine = serde_json::from_str(&line).with_context(|| format!("parse output line in {}", path.display()))?;
            out.push(parsed);
        }
        Ok(out)
    }

    /// All sessions ever recorded for a worktree, most-recently-created first.
    pub fn load_history_sessions(&self, repo: &str, worktree_name: &str) -> Result<Vec<Session>> {
        let dir = self.sessions_dir(repo, worktree_name);
        let entries = match fs::read_dir(&dir) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read_dir {}", dir.display())),
        };

        let mut out = Vec::new();
        for ent in entries {
            let ent = match ent {
                Ok(v) => v,
                Err(_) => continue,
            };
            let path = ent.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if let Ok(session) = serde_json::from_str::<Session>(&text) {
                out.push(session);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    pub fn load_session(&self, repo: &str, worktree_name: &str, id: &str) -> Result<StoredSession> {
        let path = self.session_path(repo, worktree_name, id);
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let session: Session = serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        let output = self.load_output(repo, worktree_name, id)?;
        Ok(StoredSession { session, output })
    }

    /// Permanently removes a session's stored record and output log.
    /// Distinct from `SessionManager::delete_session`, which only drops the
    /// live in-memory entry — history is retained there deliberately.
    pub fn delete(&self, repo: &str, worktree_name: &str, id: &str) -> Result<()> {
        let session_path = self.session_path(repo, worktree_name, id);
        let output_path = self.output_path(repo, worktree_name, id);
        if session_path.exists() {
            fs::remove_file(&session_path).with_context(|| format!("remove {}", session_path.display()))?;
        }
        if output_path.exists() {
            fs::remove_file(&output_path).with_context(|| format!("remove {}", output_path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session_manager::{RunnerType, SessionProgress, SessionStatus, SessionType};

    fn sample_session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            session_type: SessionType::Builder,
            status: SessionStatus::Running,
            worktree_path: "/tmp/wt".to_string(),
            worktree_name: "feature-x".to_string(),
            prompt: "do the thing".to_string(),
            title: None,
            model: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            started_at: None,
            completed_at: None,
            error_msg: None,
            progress: SessionProgress::default(),
            runner_type: RunnerType::InProcess,
        }
    }

    #[test]
    fn save_and_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let session = sample_session("sess-1");
        store.save("repo", "feature-x", &session).unwrap();

        let history = store.load_history_sessions("repo", "feature-x").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "sess-1");
    }

    #[test]
    fn append_output_accumulates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let session = sample_session("sess-2");
        store.save("repo", "feature-x", &session).unwrap();

        for i in 0..3 {
            let line = OutputLine {
                timestamp: "2026-01-01T00:00:00Z".to_string(),
                line_type: crate::core::session_manager::OutputLineType::Text,
                content: format!("line {i}"),
                tool_name: None,
                tool_id: None,
                tool_state: None,
                tool_input: None,
                tool_result: None,
                turn_number: 1,
                start_time: None,
                duration_ms: None,
                cost_usd: None,
                is_error: false,
            };
            store.append_output("repo", "feature-x", "sess-2", &line).unwrap();
        }

        let output = store.load_output("repo", "feature-x", "sess-2").unwrap();
        assert_eq!(output.len(), 3);
        assert_eq!(output[2].content, "line 2");
    }

    #[test]
    fn delete_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let session = sample_session("sess-3");
        store.save("repo", "feature-x", &session).unwrap();
        store.delete("repo", "feature-x", "sess-3").unwrap();

        let history = store.load_history_sessions("repo", "feature-x").unwrap();
        assert!(history.is_empty());
    }
}
