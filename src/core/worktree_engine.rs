//! Worktree Engine (C1): atomic mutation of the on-disk worktree tree, parent
//! tracking via git config, and the cascading topological sync/rebase.
//!
//! Grounded on the teacher's `core::git_manager` — the subprocess-wrapping
//! idiom (`run_git`, `shell_join`, `decode_utf8_lossy`), the diff model
//! (`FileDiff`/`DiffHunk`/`parse_unified_diff`), and `WorktreeInfo`/`list_worktrees`
//! are carried over near-verbatim and generalized from a single-project-root
//! layout to the bare-repo-plus-worktrees layout this spec requires.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BrambleError;

use crate::core::ids::now_rfc3339;

// ---------------------------------------------------------------------------
// Runner interfaces (spec §6) — the adapters around git/gh subprocess mechanics
// are external collaborators; the core only requires these narrow contracts.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait GitRunner: Send + Sync {
    fn run(&self, args: &[&str], workdir: &Path) -> Result<CommandOutput>;
}

pub trait GHRunner: Send + Sync {
    fn run(&self, args: &[&str], workdir: &Path) -> Result<CommandOutput>;
}

fn shell_join(args: &[&str]) -> String {
    args.to_vec().join(" ")
}

/// Whether a `gh` CLI failure's stderr looks like a dropped connection to
/// the GitHub API rather than a normal "no such resource" exit.
fn looks_like_transient_network_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    ["could not connect", "network is unreachable", "timeout", "timed out", "connection refused", "temporary failure"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn decode_utf8_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Which `.wt.yaml` hook lists fire for a worktree lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookEvent {
    Create,
    Delete,
}

/// Default `GitRunner`, wrapping `std::process::Command` the way the teacher's
/// `GitManager::run_git` does.
pub struct SystemGitRunner;

impl GitRunner for SystemGitRunner {
    fn run(&self, args: &[&str], workdir: &Path) -> Result<CommandOutput> {
        let out = Command::new("git")
            .current_dir(workdir)
            .args(args)
            .output()
            .with_context(|| format!("run git {}", shell_join(args)))?;
        Ok(CommandOutput {
            stdout: decode_utf8_lossy(&out.stdout),
            stderr: decode_utf8_lossy(&out.stderr),
            exit_code: out.status.code().unwrap_or(-1),
        })
    }
}

/// Default `GHRunner`, wrapping the `gh` CLI the same way.
pub struct SystemGHRunner;

impl GHRunner for SystemGHRunner {
    fn run(&self, args: &[&str], workdir: &Path) -> Result<CommandOutput> {
        let out = Command::new("gh")
            .current_dir(workdir)
            .args(args)
            .output()
            .with_context(|| format!("run gh {}", shell_join(args)))?;
        Ok(CommandOutput {
            stdout: decode_utf8_lossy(&out.stdout),
            stderr: decode_utf8_lossy(&out.stderr),
            exit_code: out.status.code().unwrap_or(-1),
        })
    }
}

// ---------------------------------------------------------------------------
// Data model (spec §3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
    pub path: String,
    pub branch: String,
    pub commit: String,
    pub detached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeStatus {
    pub worktree: Worktree,
    pub is_dirty: bool,
    pub ahead: u32,
    pub behind: u32,
    pub last_commit_time: Option<String>,
    pub last_commit_msg: Option<String>,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub pr_state: Option<PrState>,
    pub pr_review_status: Option<String>,
    pub pr_is_draft: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GatherContextOptions {
    pub include_diff: bool,
    pub max_diff_bytes: Option<usize>,
    pub max_commits: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeContext {
    pub branch: String,
    pub path: String,
    pub goal: Option<String>,
    pub parent: Option<String>,
    pub is_dirty: bool,
    pub ahead: u32,
    pub behind: u32,
    pub changed_files: Vec<String>,
    pub untracked_files: Vec<String>,
    pub recent_commits: Vec<String>,
    pub diff: Option<String>,
    pub diff_truncated: bool,
    pub pr: Option<WorktreeStatus>,
    pub gathered_at: String,
}

// Diff model, carried over from the teacher's git_manager near-verbatim.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDiffStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffLineType {
    Context,
    Addition,
    Deletion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    #[serde(rename = "type")]
    pub line_type: DiffLineType,
    pub line_number: u32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffHunk {
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub path: String,
    pub status: FileDiffStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub hunks: Vec<DiffHunk>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Merge,
    Squash,
    Rebase,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub keep_branch: bool,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        MergeStrategy::Squash
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    pub messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_files: Option<Vec<String>>,
}

fn strip_prefix_path(s: &str) -> String {
    let s = s.trim();
    if s == "/dev/null" {
        return s.to_string();
    }
    let s = s.strip_prefix("a/").unwrap_or(s);
    let s = s.strip_prefix("b/").unwrap_or(s);
    s.to_string()
}

fn parse_hunk_header(line: &str) -> Option<(u32, u32, u32, u32)> {
    if !line.starts_with("@@ ") {
        return None;
    }
    let end = line.rfind(" @@")?;
    let body = &line[3..end];
    let mut it = body.split_whitespace();
    let old = it.next()?;
    let new = it.next()?;
    if !old.starts_with('-') || !new.starts_with('+') {
        return None;
    }
    fn parse_range(s: &str) -> Option<(u32, u32)> {
        let s = &s[1..];
        if let Some((a, b)) = s.split_once(',') {
            Some((a.parse().ok()?, b.parse().ok()?))
        } else {
            Some((s.parse().ok()?, 1))
        }
    }
    let (old_start, old_count) = parse_range(old)?;
    let (new_start, new_count) = parse_range(new)?;
    Some((old_start, old_count, new_start, new_count))
}

pub fn parse_unified_diff(text: &str) -> Vec<FileDiff> {
    let mut out: Vec<FileDiff> = Vec::new();
    let mut cur_old_path: Option<String> = None;
    let mut cur_new_path: Option<String> = None;
    let mut cur_hunks: Vec<DiffHunk> = Vec::new();
    let mut cur_hunk: Option<DiffHunk> = None;
    let mut old_line: u32 = 0;
    let mut new_line: u32 = 0;

    fn flush_hunk(cur_hunks: &mut Vec<DiffHunk>, cur_hunk: &mut Option<DiffHunk>) {
        if let Some(h) = cur_hunk.take() {
            cur_hunks.push(h);
        }
    }

    fn flush_file(
        out: &mut Vec<FileDiff>,
        cur_old_path: &mut Option<String>,
        cur_new_path: &mut Option<String>,
        cur_hunks: &mut Vec<DiffHunk>,
        cur_hunk: &mut Option<DiffHunk>,
    ) {
        flush_hunk(cur_hunks, cur_hunk);
        let (Some(oldp), Some(newp)) = (cur_old_path.take(), cur_new_path.take()) else {
            cur_hunks.clear();
            return;
        };
        let old_clean = strip_prefix_path(&oldp);
        let new_clean = strip_prefix_path(&newp);
        let (status, path, old_path) = if old_clean == "/dev/null" && new_clean != "/dev/null" {
            (FileDiffStatus::Added, new_clean, None)
        } else if new_clean == "/dev/null" && old_clean != "/dev/null" {
            (FileDiffStatus::Deleted, old_clean, None)
        } else if old_clean != new_clean {
            (FileDiffStatus::Renamed, new_clean, Some(old_clean))
        } else {
            (FileDiffStatus::Modified, new_clean, None)
        };
        out.push(FileDiff {
            path,
            status,
            old_path,
            hunks: std::mem::take(cur_hunks),
        });
    }

    for line in text.lines() {
        if line.starts_with("diff --git ") {
            flush_file(&mut out, &mut cur_old_path, &mut cur_new_path, &mut cur_hunks, &mut cur_hunk);
            continue;
        }
        if let Some(v) = line.strip_prefix("--- ") {
            cur_old_path = Some(v.trim().to_string());
            continue;
        }
        if let Some(v) = line.strip_prefix("+++ ") {
            cur_new_path = Some(v.trim().to_string());
            continue;
        }
        if let Some((os, oc, ns, nc)) = parse_hunk_header(line) {
            flush_hunk(&mut cur_hunks, &mut cur_hunk);
            old_line = os;
            new_line = ns;
            cur_hunk = Some(DiffHunk {
                old_start: os,
                old_count: oc,
                new_start: ns,
                new_count: nc,
                lines: Vec::new(),
            });
            continue;
        }
        let Some(h) = cur_hunk.as_mut() else { continue };
        if line.starts_with('\\') {
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let (prefix, content) = line.split_at(1);
        match prefix {
            " " => {
                h.lines.push(DiffLine {
                    line_type: DiffLineType::Context,
                    line_number: new_line,
                    content: content.to_string(),
                });
                old_line = old_line.saturating_add(1);
                new_line = new_line.saturating_add(1);
            }
            "+" => {
                h.lines.push(DiffLine {
                    line_type: DiffLineType::Addition,
                    line_number: new_line,
                    content: content.to_string(),
                });
                new_line = new_line.saturating_add(1);
            }
            "-" => {
                h.lines.push(DiffLine {
                    line_type: DiffLineType::Deletion,
                    line_number: old_line,
                    content: content.to_string(),
                });
                old_line = old_line.saturating_add(1);
            }
            _ => {}
        }
    }
    flush_file(&mut out, &mut cur_old_path, &mut cur_new_path, &mut cur_hunks, &mut cur_hunk);
    out
}

fn slugify_branch(name: &str) -> String {
    let mut out = String::new();
    let mut prev_dash = false;
    for ch in name.chars() {
        let c = ch.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            prev_dash = false;
            continue;
        }
        if !out.is_empty() && !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "branch".to_string()
    } else {
        out
    }
}

// ---------------------------------------------------------------------------
// Atomic mutation with LIFO rollback (spec §4.1)
// ---------------------------------------------------------------------------

/// A single reversible step recorded while `NewAtomic` runs. Rollback replays
/// these in reverse order; `commit()` disarms the whole stack.
enum UndoStep {
    RemoveBranch { branch: String },
    RemoveWorktreeAndBranch { path: PathBuf, branch: String },
    UnsetConfig { key: String },
}

struct AtomicGuard<'a> {
    engine: &'a WorktreeEngine,
    steps: Vec<UndoStep>,
    committed: bool,
}

impl<'a> AtomicGuard<'a> {
    fn new(engine: &'a WorktreeEngine) -> Self {
        Self {
            engine,
            steps: Vec::new(),
            committed: false,
        }
    }

    fn push(&mut self, step: UndoStep) {
        self.steps.push(step);
    }

    /// Removes and returns the most recently pushed step, so a caller can
    /// collapse two steps into one once a later sub-step succeeds (e.g. a
    /// lone branch-delete becomes a combined worktree+branch-delete once the
    /// worktree is actually created).
    fn pop(&mut self) -> Option<UndoStep> {
        self.steps.pop()
    }

    fn commit(mut self) {
        self.committed = true;
        self.steps.clear();
    }
}

impl<'a> Drop for AtomicGuard<'a> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut first_err: Option<anyhow::Error> = None;
        while let Some(step) = self.steps.pop() {
            let res = match &step {
                UndoStep::RemoveBranch { branch } => self.engine.force_remove_branch(branch),
                UndoStep::RemoveWorktreeAndBranch { path, branch } => {
                    self.engine.force_remove_worktree_and_branch(path, branch)
                }
                UndoStep::UnsetConfig { key } => self.engine.unset_config(key),
            };
            if let Err(e) = res {
                warn!("rollback step failed: {e:#}");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        if let Some(e) = first_err {
            warn!("NewAtomic rollback completed with first error: {e:#}");
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct WorktreeEngine {
    /// `<root>/<repoName>`.
    repo_root: PathBuf,
    repo_name: String,
    git: Arc<dyn GitRunner>,
    gh: Arc<dyn GHRunner>,
}

impl WorktreeEngine {
    pub fn new(root: impl Into<PathBuf>, repo_name: impl Into<String>) -> Self {
        Self::with_runners(root, repo_name, Arc::new(SystemGitRunner), Arc::new(SystemGHRunner))
    }

    pub fn with_runners(
        root: impl Into<PathBuf>,
        repo_name: impl Into<String>,
        git: Arc<dyn GitRunner>,
        gh: Arc<dyn GHRunner>,
    ) -> Self {
        let root = root.into();
        let repo_name = repo_name.into();
        Self {
            repo_root: root.join(&repo_name),
            repo_name,
            git,
            gh,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn bare_path(&self) -> PathBuf {
        self.repo_root.join(".bare")
    }

    fn worktree_path(&self, name: &str) -> PathBuf {
        self.repo_root.join(slugify_branch(name))
    }

    fn git_in(&self, args: &[&str], workdir: &Path) -> Result<String> {
        let out = self.git.run(args, workdir)?;
        if !out.success() {
            return Err(BrambleError::subprocess(format!("git {}", shell_join(args)), &out.stderr).into());
        }
        Ok(out.stdout)
    }

    fn git_status_in(&self, args: &[&str], workdir: &Path) -> Result<bool> {
        Ok(self.git.run(args, workdir)?.success())
    }

    fn bare_git(&self, args: &[&str]) -> Result<String> {
        self.git_in(args, &self.bare_path())
    }

    // -- parent tracking --------------------------------------------------

    fn set_config(&self, key: &str, value: &str, workdir: &Path) -> Result<()> {
        self.git_in(&["config", key, value], workdir)?;
        Ok(())
    }

    fn unset_config(&self, key: &str) -> Result<()> {
        let _ = self.git.run(&["config", "--unset", key], &self.bare_path());
        Ok(())
    }

    fn config_get(&self, key: &str) -> Option<String> {
        let out = self.git.run(&["config", "--get", key], &self.bare_path()).ok()?;
        if !out.success() {
            return None;
        }
        let v = out.stdout.trim();
        if v.is_empty() {
            None
        } else {
            Some(v.to_string())
        }
    }

    /// `branch.<name>.description = "parent:<base>"`.
    pub fn parent_of(&self, branch: &str) -> Option<String> {
        let desc = self.config_get(&format!("branch.{branch}.description"))?;
        desc.strip_prefix("parent:").map(|s| s.trim().to_string())
    }

    pub fn goal_of(&self, branch: &str) -> Option<String> {
        self.config_get(&format!("branch.{branch}.goal"))
    }

    fn set_parent(&self, branch: &str, base: &str) -> Result<()> {
        self.set_config(&format!("branch.{branch}.description"), &format!("parent:{base}"), &self.bare_path())
    }

    pub fn set_goal(&self, branch: &str, goal: &str) -> Result<()> {
        self.set_config(&format!("branch.{branch}.goal"), goal, &self.bare_path())
    }

    // -- branch/default helpers --------------------------------------------

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        self.git_status_in(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")], &self.bare_path())
    }

    fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        self.git_status_in(
            &["show-ref", "--verify", "--quiet", &format!("refs/remotes/origin/{branch}")],
            &self.bare_path(),
        )
    }

    fn detect_origin_head_branch(&self) -> Option<String> {
        let out = self.git.run(&["symbolic-ref", "--quiet", "refs/remotes/origin/HEAD"], &self.bare_path()).ok()?;
        if !out.success() {
            return None;
        }
        let name = out.stdout.trim().rsplit('/').next()?.trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    /// Re-resolved fresh on every call (never cached across a `Sync` invocation,
    /// per the open-question decision recorded in DESIGN.md).
    pub fn default_base_branch(&self) -> Result<String> {
        if self.branch_exists("main")? {
            return Ok("main".to_string());
        }
        if self.branch_exists("master")? {
            return Ok("master".to_string());
        }
        if let Some(origin) = self.detect_origin_head_branch() {
            if self.branch_exists(&origin).unwrap_or(false) {
                return Ok(origin);
            }
        }
        bail!("could not determine a default base branch (expected main/master or origin/HEAD)")
    }

    // -- Init ---------------------------------------------------------------

    pub fn init(&self, url: &str) -> Result<PathBuf> {
        if self.bare_path().exists() {
            return Err(BrambleError::Exists(format!("repo already initialized at {}", self.repo_root.display())).into());
        }
        fs::create_dir_all(&self.repo_root).context("create repo root")?;
        self.git_in(
            &["clone", "--bare", url, self.bare_path().to_string_lossy().as_ref()],
            &self.repo_root,
        )?;
        self.bare_git(&[
            "config",
            "remote.origin.fetch",
            "+refs/heads/*:refs/remotes/origin/*",
        ])?;
        self.bare_git(&["fetch", "origin"])?;

        let default_branch = self.default_base_branch()?;
        let main_path = self.worktree_path(&default_branch);
        self.bare_git(&[
            "worktree",
            "add",
            main_path.to_string_lossy().as_ref(),
            &default_branch,
        ])?;
        self.run_hooks_best_effort(&main_path, HookEvent::Create, &default_branch);
        info!(branch = %default_branch, "initialized repo");
        Ok(main_path)
    }

    // -- New / NewAtomic ------------------------------------------------------

    /// Creates `branch` from `origin/<base>` if it doesn't already exist.
    /// Returns whether this call is the one that created it, so atomic
    /// callers know whether they own an undo step for it.
    fn ensure_branch(&self, branch: &str, base: &str) -> Result<bool> {
        if self.branch_exists(branch)? {
            return Ok(false);
        }
        self.bare_git(&["branch", branch, &format!("origin/{base}")])
            .with_context(|| format!("create branch {branch} from origin/{base}"))?;
        Ok(true)
    }

    /// Non-atomic create: same steps as `new_atomic` but without rollback
    /// bookkeeping — used where the caller has already established its own
    /// outer transaction (e.g. `Open`).
    pub fn new_worktree(&self, branch: &str, base: &str, goal: &str) -> Result<PathBuf> {
        self.bare_git(&["fetch", "origin"])?;
        let wt_path = self.worktree_path(branch);
        let _ = self.ensure_branch(branch, base)?;
        self.bare_git(&["worktree", "add", "-b", branch, wt_path.to_string_lossy().as_ref(), &format!("origin/{base}")])
            .or_else(|_| self.bare_git(&["worktree", "add", wt_path.to_string_lossy().as_ref(), branch]))?;
        self.set_parent(branch, base)?;
        if !goal.is_empty() {
            self.set_goal(branch, goal)?;
        }
        self.run_hooks_best_effort(&wt_path, HookEvent::Create, branch);
        Ok(wt_path)
    }

    /// `NewAtomic`: records undo steps as each sub-step succeeds; on any
    /// failure the guard's `Drop` rolls back LIFO. Hooks are never undone.
    pub fn new_atomic(&self, branch: &str, base: &str, goal: &str) -> Result<PathBuf> {
        if self.worktree_path(branch).exists() {
            return Err(BrambleError::Exists(format!("worktree already exists for branch {branch}")).into());
        }
        let mut guard = AtomicGuard::new(self);

        // (1) fetch — no undo.
        self.bare_git(&["fetch", "origin"])?;

        // (2a) create the branch — undo deletes it. Pushed *before* `worktree
        // add` runs, so a failing `worktree add` still rolls back the branch
        // (spec invariant 3: no new local branch survives a failed NewAtomic).
        let wt_path = self.worktree_path(branch);
        let branch_created = self.ensure_branch(branch, base)?;
        if branch_created {
            guard.push(UndoStep::RemoveBranch {
                branch: branch.to_string(),
            });
        }

        // (2b) worktree add — undo removes the tree and branch. Collapses the
        // lone branch-delete step above into one combined step, since from
        // here on the worktree and branch must be torn down together.
        self.bare_git(&["worktree", "add", wt_path.to_string_lossy().as_ref(), branch])
            .with_context(|| format!("git worktree add for branch {branch}"))?;
        if branch_created {
            guard.pop();
        }
        guard.push(UndoStep::RemoveWorktreeAndBranch {
            path: wt_path.clone(),
            branch: branch.to_string(),
        });

        // (3) set parent description — undo unsets the config.
        self.set_parent(branch, base)?;
        guard.push(UndoStep::UnsetConfig {
            key: format!("branch.{branch}.description"),
        });

        // (4) set goal — undo unsets the config.
        if !goal.is_empty() {
            self.set_goal(branch, goal)?;
            guard.push(UndoStep::UnsetConfig {
                key: format!("branch.{branch}.goal"),
            });
        }

        // (5) post-create hooks — explicitly not undone; warn-only.
        self.run_hooks_best_effort(&wt_path, HookEvent::Create, branch);

        guard.commit();
        Ok(wt_path)
    }

    fn force_remove_worktree_and_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let _ = self.bare_git(&["worktree", "remove", "--force", path.to_string_lossy().as_ref()]);
        let _ = self.bare_git(&["branch", "-D", branch]);
        Ok(())
    }

    /// Rollback for a branch created by `ensure_branch` before `worktree add`
    /// has run — no working tree exists yet, so only the branch is deleted.
    fn force_remove_branch(&self, branch: &str) -> Result<()> {
        let _ = self.bare_git(&["branch", "-D", branch]);
        Ok(())
    }

    // -- Open -----------------------------------------------------------------

    pub fn open(&self, branch: &str, goal: &str) -> Result<PathBuf> {
        self.bare_git(&["fetch", "origin"])?;
        if !self.remote_branch_exists(branch)? {
            return Err(BrambleError::NotFound(format!("remote branch '{branch}' not found on origin")).into());
        }
        let wt_path = self.worktree_path(branch);
        if wt_path.exists() {
            return Ok(wt_path);
        }
        self.bare_git(&["worktree", "add", "--track", "-b", branch, wt_path.to_string_lossy().as_ref(), &format!("origin/{branch}")])
            .with_context(|| format!("git worktree add --track for branch {branch}"))?;
        let default_branch = self.default_base_branch().unwrap_or_else(|_| "main".to_string());
        self.set_parent(branch, &default_branch)?;
        if !goal.is_empty() {
            self.set_goal(branch, goal)?;
        }
        self.run_hooks_best_effort(&wt_path, HookEvent::Create, branch);
        Ok(wt_path)
    }

    // -- List / status ----------------------------------------------------------

    pub fn list(&self) -> Result<Vec<Worktree>> {
        let text = self.bare_git(&["worktree", "list", "--porcelain"])?;
        let mut out = Vec::new();
        let mut path: Option<String> = None;
        let mut head: Option<String> = None;
        let mut branch: Option<String> = None;
        let mut detached = false;

        let flush = |out: &mut Vec<Worktree>, path: &mut Option<String>, head: &mut Option<String>, branch: &mut Option<String>, detached: &mut bool| {
            if let Some(p) = path.take() {
                out.push(Worktree {
                    path: p,
                    branch: branch.take().unwrap_or_default(),
                    commit: head.take().unwrap_or_default(),
                    detached: *detached,
                });
            }
            *detached = false;
        };

        for line in text.lines() {
            if let Some(v) = line.strip_prefix("worktree ") {
                flush(&mut out, &mut path, &mut head, &mut branch, &mut detached);
                path = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("HEAD ") {
                head = Some(v.trim().chars().take(12).collect());
            } else if let Some(v) = line.strip_prefix("branch ") {
                branch = Some(v.trim().trim_start_matches("refs/heads/").to_string());
            } else if line.trim() == "detached" {
                detached = true;
            }
        }
        flush(&mut out, &mut path, &mut head, &mut branch, &mut detached);
        // The bare repo itself appears as a worktree entry; drop entries pointing at .bare.
        out.retain(|w| !w.path.ends_with(".bare"));
        Ok(out)
    }

    pub fn get_git_status(&self, wt: &Worktree) -> Result<WorktreeStatus> {
        let path = Path::new(&wt.path);
        let dirty = !self.git_in(&["status", "--porcelain"], path)?.trim().is_empty();
        let (ahead, behind) = self.ahead_behind(&wt.branch, path).unwrap_or((0, 0));
        let last_commit = self.git_in(&["log", "-1", "--format=%cI%x1f%s"], path).unwrap_or_default();
        let mut parts = last_commit.splitn(2, '\x1f');
        let last_commit_time = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let last_commit_msg = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        Ok(WorktreeStatus {
            worktree: wt.clone(),
            is_dirty: dirty,
            ahead,
            behind,
            last_commit_time,
            last_commit_msg,
            pr_number: None,
            pr_url: None,
            pr_state: None,
            pr_review_status: None,
            pr_is_draft: None,
        })
    }

    fn ahead_behind(&self, branch: &str, workdir: &Path) -> Result<(u32, u32)> {
        let out = self.git_in(&["rev-list", "--left-right", "--count", &format!("origin/{branch}...HEAD")], workdir)?;
        let mut it = out.split_whitespace();
        let behind = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let ahead = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok((ahead, behind))
    }

    /// A single batched GitHub call covering every open worktree's branch.
    pub fn fetch_all_pr_info(&self, worktrees: &[Worktree]) -> Result<HashMap<String, WorktreeStatus>> {
        let mut out = HashMap::new();
        for wt in worktrees {
            match self.fetch_pr_info_with_retry(wt) {
                Ok(status) => {
                    out.insert(wt.branch.clone(), status);
                }
                Err(e) => warn!(branch = %wt.branch, error = %e, "dropping worktree from batched PR info fetch"),
            }
        }
        Ok(out)
    }

    /// `fetch_pr_info` is an idempotent read, so a transient network failure
    /// (per §7's retry policy) is retried once before giving up.
    pub fn fetch_pr_info_with_retry(&self, wt: &Worktree) -> Result<WorktreeStatus> {
        match self.fetch_pr_info(wt) {
            Ok(status) => Ok(status),
            Err(e) => {
                let transient = e.downcast_ref::<BrambleError>().map(BrambleError::is_transient_network).unwrap_or(false);
                if !transient {
                    return Err(e);
                }
                warn!(branch = %wt.branch, "retrying PR info fetch after transient network error");
                self.fetch_pr_info(wt)
            }
        }
    }

    pub fn fetch_pr_info(&self, wt: &Worktree) -> Result<WorktreeStatus> {
        let mut status = self.get_git_status(wt)?;
        let out = self.gh.run(
            &[
                "pr",
                "view",
                &wt.branch,
                "--json",
                "number,url,state,isDraft,reviewDecision",
            ],
            &self.repo_root,
        )?;
        // `gh pr view` exits non-zero both for "no PR open on this branch"
        // (expected, not an error) and for a dropped connection to the
        // GitHub API (a transient read failure worth retrying — spec §7's
        // "idempotent read operations ... GitHub status queries during
        // MergeApproved refresh"). Only the latter is surfaced as an error.
        if !out.success() && looks_like_transient_network_failure(&out.stderr) {
            return Err(BrambleError::Network(out.stderr).into());
        }
        if out.success() {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&out.stdout) {
                status.pr_number = v.get("number").and_then(|x| x.as_u64());
                status.pr_url = v.get("url").and_then(|x| x.as_str()).map(String::from);
                status.pr_is_draft = v.get("isDraft").and_then(|x| x.as_bool());
                status.pr_review_status = v.get("reviewDecision").and_then(|x| x.as_str()).map(String::from);
                status.pr_state = match v.get("state").and_then(|x| x.as_str()) {
                    Some("MERGED") => Some(PrState::Merged),
                    Some("CLOSED") => Some(PrState::Closed),
                    Some("OPEN") => Some(PrState::Open),
                    _ => None,
                };
            }
        }
        Ok(status)
    }

    pub fn gather_context(&self, wt: &Worktree, opts: &GatherContextOptions) -> Result<WorktreeContext> {
        let path = Path::new(&wt.path);
        let status = self.get_git_status(wt).ok();
        let changed_files: Vec<String> = self
            .git_in(&["diff", "--name-only"], path)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect();
        let untracked_files: Vec<String> = self
            .git_in(&["ls-files", "--others", "--exclude-standard"], path)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect();
        let max_commits = opts.max_commits.unwrap_or(20);
        let recent_commits: Vec<String> = self
            .git_in(&["log", &format!("-{max_commits}"), "--format=%h %s"], path)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect();

        let (diff, diff_truncated) = if opts.include_diff {
            let raw = self.git_in(&["diff"], path).unwrap_or_default();
            if let Some(cap) = opts.max_diff_bytes {
                if raw.len() > cap {
                    let mut truncated = raw.as_bytes()[..cap].to_vec();
                    let truncated = String::from_utf8_lossy(&mut truncated).to_string();
                    (Some(format!("{truncated}\n[... diff truncated at {cap} bytes ...]")), true)
                } else {
                    (Some(raw), false)
                }
            } else {
                (Some(raw), false)
            }
        } else {
            (None, false)
        };

        Ok(WorktreeContext {
            branch: wt.branch.clone(),
            path: wt.path.clone(),
            goal: self.goal_of(&wt.branch),
            parent: self.parent_of(&wt.branch),
            is_dirty: status.as_ref().map(|s| s.is_dirty).unwrap_or(false),
            ahead: status.as_ref().map(|s| s.ahead).unwrap_or(0),
            behind: status.as_ref().map(|s| s.behind).unwrap_or(0),
            changed_files,
            untracked_files,
            recent_commits,
            diff,
            diff_truncated,
            pr: self.fetch_pr_info(wt).ok(),
            gathered_at: now_rfc3339(),
        })
    }

    // -- Remove -----------------------------------------------------------------

    pub fn remove(&self, name_or_branch: &str, delete_branch: bool) -> Result<()> {
        let wt_path = self.worktree_path(name_or_branch);
        self.run_hooks_best_effort(&wt_path, HookEvent::Delete, name_or_branch);
        let _ = self.bare_git(&["worktree", "remove", "--force", wt_path.to_string_lossy().as_ref()]);
        if delete_branch {
            if !self.git_status_in(&["branch", "-d", name_or_branch], &self.bare_path())? {
                self.bare_git(&["branch", "-D", name_or_branch])
                    .with_context(|| format!("force delete branch {name_or_branch}"))?;
            }
            let remote_ok = self.git_status_in(&["push", "origin", "--delete", name_or_branch], &self.bare_path()).unwrap_or(false);
            if !remote_ok {
                warn!(branch = %name_or_branch, "remote branch absent or delete failed (non-fatal)");
            }
        }
        Ok(())
    }

    // -- ResetToDefault -----------------------------------------------------------

    pub fn reset_to_default(&self, branch: &str) -> Result<()> {
        let default_branch = self.default_base_branch()?;
        let wt_path = self.worktree_path(branch);
        self.git_in(&["fetch", "origin"], &wt_path)?;
        self.git_in(&["reset", "--hard", &format!("origin/{default_branch}")], &wt_path)?;
        Ok(())
    }

    // -- Hooks --------------------------------------------------------------------

    /// Runs every hook configured for `event` (spec §6: `.wt.yaml` carries
    /// both a `post_create`/`post_remove` list and an `on_worktree_create`/
    /// `on_worktree_delete` list for the same two events — both are honored,
    /// in that order, so neither documented key is dead).
    fn run_hooks_best_effort(&self, workdir: &Path, event: HookEvent, branch: &str) {
        let cfg_path = workdir.join(".wt.yaml");
        let Ok(raw) = fs::read_to_string(&cfg_path) else { return };
        let Ok(cfg) = serde_yaml::from_str::<crate::core::config::WtConfig>(&raw) else { return };
        let hooks: Vec<&String> = match event {
            HookEvent::Create => cfg.post_create.iter().chain(cfg.on_worktree_create.iter()).collect(),
            HookEvent::Delete => cfg.post_remove.iter().chain(cfg.on_worktree_delete.iter()).collect(),
        };
        for hook in hooks {
            let status = Command::new("sh")
                .arg("-c")
                .arg(hook)
                .current_dir(workdir)
                .env("WT_BRANCH", branch)
                .env("WT_PATH", workdir)
                .status();
            match status {
                Ok(s) if s.success() => {}
                Ok(s) => warn!(hook, code = ?s.code(), "hook exited non-zero (non-fatal)"),
                Err(e) => warn!(hook, error = %e, "hook failed to spawn (non-fatal)"),
            }
        }
    }

    // -- Sync (cascading topological rebase) ----------------------------------------

    pub fn sync(&self, branch: Option<&str>) -> Result<SyncReport> {
        let worktrees = self.list()?;
        let targets: Vec<Worktree> = match branch {
            Some(b) => worktrees.into_iter().filter(|w| w.branch == b).collect(),
            None => worktrees,
        };
        let default_branch = self.default_base_branch()?;

        // Build the dependency graph: branch -> parent.
        let mut parent_of: HashMap<String, Option<String>> = HashMap::new();
        let mut by_branch: HashMap<String, Worktree> = HashMap::new();
        for wt in &targets {
            parent_of.insert(wt.branch.clone(), self.parent_of(&wt.branch));
            by_branch.insert(wt.branch.clone(), wt.clone());
        }

        let order = topological_order(&parent_of);

        let mut report = SyncReport::default();
        let mut failed: HashSet<String> = HashSet::new();

        for branch in order {
            let Some(wt) = by_branch.get(&branch) else { continue };
            let parent = parent_of.get(&branch).cloned().flatten();

            if let Some(p) = &parent {
                if failed.contains(p) {
                    failed.insert(branch.clone());
                    report.skipped.push(branch.clone());
                    continue;
                }
            }

            let target = match &parent {
                None => format!("origin/{default_branch}"),
                Some(p) if p == &default_branch => format!("origin/{default_branch}"),
                Some(p) => {
                    let parent_merged = self.is_branch_merged(p)?;
                    if parent_merged {
                        if let Ok(status) = self.fetch_pr_info(&wt.clone()) {
                            if let Some(pr) = status.pr_number {
                                let _ = self.gh.run(
                                    &["pr", "edit", &pr.to_string(), "--base", &default_branch],
                                    &self.repo_root,
                                );
                            }
                        }
                        let _ = self.set_parent(&branch, &default_branch);
                        format!("origin/{default_branch}")
                    } else {
                        format!("origin/{p}")
                    }
                }
            };

            let path = Path::new(&wt.path);
            let _ = self.git_in(&["fetch", "origin"], path);
            let rebased = self.git_in(&["rebase", "--autostash", &target], path);
            match rebased {
                Ok(_) => {
                    report.rebased.push(branch.clone());
                }
                Err(e) => {
                    warn!(branch = %branch, error = %e, "rebase failed, chain halted here; other chains continue");
                    failed.insert(branch.clone());
                    report.failed.push(SyncFailure {
                        branch: branch.clone(),
                        path: wt.path.clone(),
                        remediation: format!(
                            "cd {} && git status   # resolve conflicts, then: git rebase --continue (or --abort)",
                            wt.path
                        ),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    fn is_branch_merged(&self, branch: &str) -> Result<bool> {
        if !self.remote_branch_exists(branch)? {
            return Ok(true);
        }
        let out = self.gh.run(&["pr", "view", branch, "--json", "state"], &self.repo_root)?;
        if out.success() {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&out.stdout) {
                return Ok(v.get("state").and_then(|s| s.as_str()) == Some("MERGED"));
            }
        }
        Ok(false)
    }

    // -- MergePRForBranch --------------------------------------------------------

    pub fn merge_pr_for_branch(&self, branch: &str, opts: &MergeOptions) -> Result<MergeResult> {
        let mut messages = Vec::new();
        let out = self.gh.run(&["pr", "view", branch, "--json", "number"], &self.repo_root)?;
        if !out.success() {
            return Err(BrambleError::NotFound(format!("no PR found for branch {branch}")).into());
        }
        let pr_number: u64 = serde_json::from_str::<serde_json::Value>(&out.stdout)
            .ok()
            .and_then(|v| v.get("number").and_then(|n| n.as_u64()))
            .context("parse PR number")?;

        let flag = match opts.strategy {
            MergeStrategy::Merge => "--merge",
            MergeStrategy::Squash => "--squash",
            MergeStrategy::Rebase => "--rebase",
        };
        let branch_owned = branch.to_string();
        let mut args: Vec<&str> = vec!["pr", "merge", &branch_owned, flag];
        if !opts.keep_branch {
            args.push("--delete-branch");
        }
        let merge_out = self.gh.run(&args, &self.repo_root)?;
        if !merge_out.success() {
            return Ok(MergeResult {
                success: false,
                messages: vec![merge_out.stderr],
                conflict_files: None,
            });
        }
        messages.push(format!("merged PR #{pr_number} for {branch}"));

        let _ = self.bare_git(&["fetch", "origin"]);

        // Cascade: rebase children whose PR base equals the merged branch.
        let list_out = self.gh.run(
            &["pr", "list", "--json", "number,headRefName,baseRefName", "--state", "open", "--search", &format!("base:{branch}")],
            &self.repo_root,
        )?;
        if list_out.success() {
            if let Ok(serde_json::Value::Array(children)) = serde_json::from_str(&list_out.stdout) {
                let default_branch = self.default_base_branch().unwrap_or_else(|_| branch.to_string());
                for child in children {
                    let Some(head) = child.get("headRefName").and_then(|v| v.as_str()) else { continue };
                    let Some(child_pr) = child.get("number").and_then(|v| v.as_u64()) else { continue };
                    let worktrees = self.list()?;
                    if let Some(child_wt) = worktrees.iter().find(|w| w.branch == head) {
                        let path = Path::new(&child_wt.path);
                        let _ = self.git_in(&["fetch", "origin"], path);
                        match self.git_in(&["rebase", "--autostash", &format!("origin/{default_branch}")], path) {
                            Ok(_) => {
                                let _ = self.git_in(&["push", "--force-with-lease"], path);
                                messages.push(format!("rebased child {head} onto {default_branch}"));
                            }
                            Err(e) => {
                                messages.push(format!("failed to rebase child {head}: {e}"));
                            }
                        }
                    } else {
                        messages.push(format!("child {head} has no local worktree; updating PR base only"));
                    }
                    let _ = self.gh.run(&["pr", "edit", &child_pr.to_string(), "--base", &default_branch], &self.repo_root);
                    let _ = self.set_parent(head, &default_branch);
                }
            }
        }

        Ok(MergeResult {
            success: true,
            messages,
            conflict_files: None,
        })
    }

    // -- PR creation --------------------------------------------------------

    /// Creates a PR for `branch` against `base` if one does not already
    /// exist, pushing the branch first. Returns `None` when the branch has
    /// no local changes relative to `base` worth opening a PR for.
    pub fn create_pr(&self, branch: &str, base: &str, title: &str, body: &str, draft: bool) -> Result<Option<(u64, String)>> {
        self.create_pr_with_push(branch, base, title, body, draft, true)
    }

    /// Same as `create_pr`, but lets the caller skip the `git push` (spec §6
    /// `wt pr --no-push`: the caller has already pushed, or wants to open the
    /// PR against whatever commit is already on the remote).
    pub fn create_pr_with_push(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
        draft: bool,
        push: bool,
    ) -> Result<Option<(u64, String)>> {
        let wt_path = self.worktree_path(branch);
        if !wt_path.exists() {
            return Err(BrambleError::NotFound(format!("no worktree for branch {branch}")).into());
        }
        let existing = self.gh.run(&["pr", "view", branch, "--json", "number,url"], &self.repo_root)?;
        if existing.success() {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&existing.stdout) {
                if let (Some(n), Some(u)) = (v.get("number").and_then(|x| x.as_u64()), v.get("url").and_then(|x| x.as_str())) {
                    return Ok(Some((n, u.to_string())));
                }
            }
        }

        if push {
            let _ = self.git_in(&["push", "-u", "origin", branch], &wt_path);
        }

        let mut args: Vec<&str> = vec!["pr", "create", "--base", base, "--head", branch, "--title", title, "--body", body];
        if draft {
            args.push("--draft");
        }
        let out = self.gh.run(&args, &wt_path)?;
        if !out.success() {
            return Err(BrambleError::subprocess("gh pr create", &out.stderr).into());
        }
        // `gh pr create` prints the created PR's URL on stdout.
        let url = out.stdout.trim().to_string();
        if url.is_empty() {
            return Ok(None);
        }
        let view = self.gh.run(&["pr", "view", branch, "--json", "number"], &self.repo_root)?;
        let number = view
            .success()
            .then(|| serde_json::from_str::<serde_json::Value>(&view.stdout).ok())
            .flatten()
            .and_then(|v| v.get("number").and_then(|n| n.as_u64()))
            .unwrap_or(0);
        Ok(Some((number, url)))
    }

    /// Whether `branch`'s worktree has any local changes relative to `base`
    /// (committed or uncommitted) worth opening a PR for.
    pub fn has_changes_vs(&self, branch: &str, base: &str) -> Result<bool> {
        let wt_path = self.worktree_path(branch);
        let diffstat = self.git_in(&["diff", "--stat", &format!("origin/{base}...HEAD")], &wt_path).unwrap_or_default();
        if !diffstat.trim().is_empty() {
            return Ok(true);
        }
        let porcelain = self.git_in(&["status", "--porcelain"], &wt_path).unwrap_or_default();
        Ok(!porcelain.trim().is_empty())
    }

    pub fn detect_orphans(&self, min_age: Duration) -> Result<Vec<(Worktree, u64)>> {
        let now = SystemTime::now();
        let mut out = Vec::new();
        for wt in self.list()? {
            let path = Path::new(&wt.path);
            let Ok(meta) = fs::metadata(path) else { continue };
            let Ok(age) = now.duration_since(meta.modified().unwrap_or(now)) else { continue };
            if age >= min_age && self.parent_of(&wt.branch).is_none() {
                out.push((wt.clone(), age.as_secs()));
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub branch: String,
    pub path: String,
    pub remediation: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub rebased: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<SyncFailure>,
}

/// Kahn's algorithm; nodes left over after the queue drains (cycles or
/// self-referential orphans) are appended deterministically rather than
/// dropped, per the cyclic-parent-graph design note.
fn topological_order(parent_of: &HashMap<String, Option<String>>) -> Vec<String> {
    let mut indegree: HashMap<String, usize> = parent_of.keys().map(|k| (k.clone(), 0)).collect();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();

    for (branch, parent) in parent_of {
        if let Some(p) = parent {
            if parent_of.contains_key(p) {
                *indegree.get_mut(branch).unwrap() += 1;
                children.entry(p.clone()).or_default().push(branch.clone());
            }
        }
    }

    let mut queue: VecDeque<String> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(k, _)| k.clone())
        .collect();
    let mut queue_vec: Vec<String> = queue.iter().cloned().collect();
    queue_vec.sort();
    queue = queue_vec.into_iter().collect();

    let mut order = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(branch) = queue.pop_front() {
        if !visited.insert(branch.clone()) {
            continue;
        }
        order.push(branch.clone());
        if let Some(kids) = children.get(&branch) {
            let mut kids_sorted = kids.clone();
            kids_sorted.sort();
            for kid in kids_sorted {
                if let Some(d) = indegree.get_mut(&kid) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        queue.push_back(kid);
                    }
                }
            }
        }
    }

    // Cycle/orphan leftovers: append remaining nodes in deterministic (sorted) order.
    let mut leftover: Vec<String> = parent_of
        .keys()
        .filter(|k| !visited.contains(*k))
        .cloned()
        .collect();
    if !leftover.is_empty() {
        leftover.sort();
        warn!(count = leftover.len(), "cyclic or orphaned parent graph nodes appended at end of sync order");
        order.extend(leftover);
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topo_order_respects_parent_before_child() {
        let mut m = HashMap::new();
        m.insert("a".to_string(), None);
        m.insert("b".to_string(), Some("a".to_string()));
        m.insert("c".to_string(), Some("b".to_string()));
        let order = topological_order(&m);
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn topo_order_appends_cycle_deterministically() {
        let mut m = HashMap::new();
        m.insert("x".to_string(), Some("y".to_string()));
        m.insert("y".to_string(), Some("x".to_string()));
        let order = topological_order(&m);
        assert_eq!(order.len(), 2);
        assert!(order.contains(&"x".to_string()));
        assert!(order.contains(&"y".to_string()));
    }

    #[test]
    fn parse_unified_diff_detects_added_file() {
        let diff = "diff --git a/new.txt b/new.txt\n--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+hello\n+world\n";
        let files = parse_unified_diff(diff);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, FileDiffStatus::Added);
        assert_eq!(files[0].path, "new.txt");
    }

    #[test]
    fn slugify_branch_collapses_separators() {
        assert_eq!(slugify_branch("feat/auth-login"), "feat-auth-login");
        assert_eq!(slugify_branch(""), "branch");
    }

    struct NoopRunner;
    impl GitRunner for NoopRunner {
        fn run(&self, _args: &[&str], _workdir: &Path) -> Result<CommandOutput> {
            Ok(CommandOutput { stdout: String::new(), stderr: String::new(), exit_code: 0 })
        }
    }
    impl GHRunner for NoopRunner {
        fn run(&self, _args: &[&str], _workdir: &Path) -> Result<CommandOutput> {
            Ok(CommandOutput { stdout: String::new(), stderr: String::new(), exit_code: 0 })
        }
    }

    /// Both hook lists `.wt.yaml` documents for the same event (spec §6:
    /// `post_create[]` and `on_worktree_create[]`) must actually run.
    #[test]
    fn both_documented_create_hook_keys_run() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker.txt");
        std::fs::write(
            dir.path().join(".wt.yaml"),
            format!(
                "post_create:\n  - echo post_create >> {}\non_worktree_create:\n  - echo on_worktree_create >> {}\n",
                marker.display(),
                marker.display()
            ),
        )
        .unwrap();
        let engine = WorktreeEngine::with_runners(
            dir.path().to_path_buf(),
            "repo".to_string(),
            Arc::new(NoopRunner),
            Arc::new(NoopRunner),
        );
        engine.run_hooks_best_effort(dir.path(), HookEvent::Create, "branch");
        let contents = std::fs::read_to_string(&marker).unwrap();
        assert!(contents.contains("post_create"));
        assert!(contents.contains("on_worktree_create"));
    }
}
