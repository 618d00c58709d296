//! Fix dispatch: a bounded worker pool that turns actionable issues into
//! ephemeral builder sessions, one atomically-created worktree per issue.
//!
//! The worker-pool shape (fixed thread count, work handed over a channel,
//! results joined back) is grounded on the teacher's PTY pool sizing
//! (`core::process_pool`'s `max_active` cap) generalized from "cap concurrent
//! PTYs" to "cap concurrent fixer attempts".

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::fixer::tracker::Tracker;
use crate::core::fixer::{FixAttempt, Issue, IssueStatus};
use crate::core::ids::now_rfc3339;
use crate::core::session_manager::{SessionManager, SessionStatus, SessionType, StartSessionOptions};
use crate::core::worktree_engine::WorktreeEngine;

pub const DEFAULT_PARALLELISM: usize = 3;

fn build_prompt(issue: &Issue) -> String {
    let file_line = match (&issue.file, issue.line) {
        (Some(f), Some(l)) => format!("{f}:{l}"),
        (Some(f), None) => f.clone(),
        _ => "unknown location".to_string(),
    };
    let verify_cmd = match issue.category {
        crate::core::fixer::IssueCategory::Lint => "run the project's lint command and confirm it passes",
        crate::core::fixer::IssueCategory::Test => "run the failing test and confirm it passes",
        crate::core::fixer::IssueCategory::Build => "run the project's build and confirm it succeeds",
        crate::core::fixer::IssueCategory::Typecheck => "run the project's typechecker and confirm it is clean",
        crate::core::fixer::IssueCategory::Unknown => "re-run the originally failing CI job and confirm it passes",
    };
    format!(
        "CI failure to fix.\nCategory: {}\nLocation: {file_line}\nSummary: {}\nDetails: {}\n\nAfter making the fix, {verify_cmd}.",
        issue.category.slug(),
        issue.summary,
        issue.details
    )
}

/// Dispatches every `new`/`in_progress`-eligible issue to a bounded pool of
/// worker threads. Each worker runs one issue fully (worktree creation,
/// session start, wait for completion, PR creation if changes exist) before
/// picking up the next. Cost accumulates across all attempts; the tracker is
/// saved once, after every worker has finished.
pub fn dispatch_fixes(
    tracker: &Arc<Tracker>,
    worktree_engine: &Arc<WorktreeEngine>,
    session_manager: &Arc<SessionManager>,
    scan_branch: &str,
    parallelism: usize,
) -> Result<f64> {
    let actionable: Vec<Issue> = tracker
        .list()
        .into_iter()
        .filter(|i| matches!(i.status, IssueStatus::New))
        .collect();

    if actionable.is_empty() {
        return Ok(0.0);
    }

    let (tx, rx) = mpsc::channel::<Issue>();
    for issue in actionable {
        tx.send(issue).expect("channel receiver outlives all sends");
    }
    drop(tx);

    let rx = Arc::new(std::sync::Mutex::new(rx));
    let total_cost = Arc::new(std::sync::Mutex::new(0.0f64));
    let worker_count = parallelism.max(1);
    let mut handles = Vec::with_capacity(worker_count);

    for _ in 0..worker_count {
        let rx = rx.clone();
        let tracker = tracker.clone();
        let worktree_engine = worktree_engine.clone();
        let session_manager = session_manager.clone();
        let scan_branch = scan_branch.to_string();
        let total_cost = total_cost.clone();

        handles.push(thread::spawn(move || loop {
            let issue = {
                let guard = rx.lock().expect("dispatch queue mutex poisoned");
                match guard.recv() {
                    Ok(issue) => issue,
                    Err(_) => break,
                }
            };
            let cost = run_one_fix(&tracker, &worktree_engine, &session_manager, &scan_branch, &issue);
            *total_cost.lock().expect("total cost mutex poisoned") += cost;
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }

    tracker.save()?;
    Ok(*total_cost.lock().expect("total cost mutex poisoned"))
}

fn run_one_fix(
    tracker: &Arc<Tracker>,
    worktree_engine: &Arc<WorktreeEngine>,
    session_manager: &Arc<SessionManager>,
    scan_branch: &str,
    issue: &Issue,
) -> f64 {
    tracker.update(&issue.signature, |i| i.status = IssueStatus::InProgress);

    let fix_branch = format!("fix/{}/{}", issue.category.slug(), issue.id);
    let started_at = now_rfc3339();

    let worktree_path = match worktree_engine.new_atomic(&fix_branch, scan_branch, &issue.summary) {
        Ok(path) => path,
        Err(e) => {
            warn!(issue = %issue.id, error = %e, "fixer failed to create worktree for fix attempt");
            tracker.update(&issue.signature, |i| {
                i.status = IssueStatus::New;
                i.attempts.push(FixAttempt {
                    started_at: started_at.clone(),
                    completed_at: Some(now_rfc3339()),
                    session_id: None,
                    branch: fix_branch.clone(),
                    success: false,
                    cost_usd: 0.0,
                    notes: format!("worktree creation failed: {e}"),
                });
            });
            return 0.0;
        }
    };
    let _ = worktree_path;

    let prompt = build_prompt(issue);
    let session_id = match session_manager.start_session(
        SessionType::Builder,
        &fix_branch,
        &prompt,
        StartSessionOptions { base_branch: Some(scan_branch.to_string()), goal: Some(issue.summary.clone()), ..Default::default() },
    ) {
        Ok(id) => id,
        Err(e) => {
            warn!(issue = %issue.id, error = %e, "fixer failed to start builder session");
            tracker.update(&issue.signature, |i| i.status = IssueStatus::New);
            return 0.0;
        }
    };

    // Poll for terminal state; the runner thread owns progress/events.
    let mut cost = 0.0;
    loop {
        std::thread::sleep(std::time::Duration::from_millis(500));
        let Some(info) = session_manager.get_session_info(&session_id) else { break };
        cost = info.progress.total_cost_usd;
        if info.status.is_terminal() {
            break;
        }
        if info.status == SessionStatus::Idle {
            let _ = session_manager.complete_session(&session_id);
        }
    }

    let mut succeeded = session_manager
        .get_session_info(&session_id)
        .map(|s| s.status == SessionStatus::Completed)
        .unwrap_or(false);

    // Only a session that actually produced changes earns a PR; a clean
    // session (no diff) is not an attempt worth surfacing for review.
    let mut pr_number = None;
    let mut notes = if succeeded { "fix session completed".to_string() } else { "fix session did not complete successfully".to_string() };

    if succeeded {
        match worktree_engine.has_changes_vs(&fix_branch, scan_branch) {
            Ok(true) => {
                let title = format!("fix({}): {}", issue.category.slug(), issue.summary);
                let body = format!("Automated fix for tracked issue `{}`.\n\n{}", issue.id, issue.details);
                match worktree_engine.create_pr(&fix_branch, scan_branch, &title, &body, false) {
                    Ok(Some((number, url))) => {
                        pr_number = Some(number);
                        notes = format!("fix session completed; opened PR #{number} ({url})");
                    }
                    Ok(None) => {
                        notes = "fix session completed but PR creation produced no URL".to_string();
                    }
                    Err(e) => {
                        warn!(issue = %issue.id, error = %e, "fixer failed to open PR for completed fix session");
                        succeeded = false;
                        notes = format!("fix session completed but PR creation failed: {e}");
                    }
                }
            }
            Ok(false) => {
                succeeded = false;
                notes = "fix session completed with no file changes; nothing to submit".to_string();
            }
            Err(e) => {
                warn!(issue = %issue.id, error = %e, "fixer failed to check for changes after fix session");
            }
        }
    }

    tracker.update(&issue.signature, |i| {
        i.fix_branch = Some(fix_branch.clone());
        i.status = if succeeded { IssueStatus::FixPending } else { IssueStatus::New };
        if let Some(n) = pr_number {
            i.pr_number = Some(n);
        }
        i.attempts.push(FixAttempt {
            started_at: started_at.clone(),
            completed_at: Some(now_rfc3339()),
            session_id: Some(session_id.clone()),
            branch: fix_branch.clone(),
            success: succeeded,
            cost_usd: cost,
            notes,
        });
    });

    if succeeded {
        info!(issue = %issue.id, branch = %fix_branch, "fix session completed and PR opened");
    }

    cost
}
