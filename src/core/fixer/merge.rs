//! Merge-approved stage: refresh PR review status for fixes awaiting
//! approval, merge the ones that are approved, and tear down their
//! worktrees.
//!
//! Grounded directly on `WorktreeEngine::fetch_pr_info` (review-status
//! refresh) and `WorktreeEngine::merge_pr_for_branch`/`remove` (the actual
//! merge and cleanup), reused as-is rather than reimplemented.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::core::fixer::tracker::Tracker;
use crate::core::fixer::IssueStatus;
use crate::core::worktree_engine::{MergeOptions, MergeStrategy, WorktreeEngine};

#[derive(Debug, Default)]
pub struct MergeApprovedReport {
    pub merged: Vec<String>,
    pub still_pending: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// For every issue in `fix_pending`, refreshes its PR's review status; issues
/// whose PR is `APPROVED` get merged squash-no-keep and transition to
/// `fix_merged`. Worktree removal failures are logged as warnings, never
/// fatal to the overall pass (spec §4.8).
pub fn run_merge_approved(tracker: &Arc<Tracker>, worktree_engine: &Arc<WorktreeEngine>) -> Result<MergeApprovedReport> {
    let mut report = MergeApprovedReport::default();
    let pending = tracker.list_by_status(IssueStatus::FixPending);
    let worktrees = worktree_engine.list()?;

    for issue in pending {
        let Some(branch) = issue.fix_branch.clone() else { continue };
        let Some(wt) = worktrees.iter().find(|w| w.branch == branch) else {
            warn!(issue = %issue.id, branch = %branch, "fix worktree no longer present; leaving pending");
            report.still_pending.push(issue.signature.clone());
            continue;
        };

        let status = match worktree_engine.fetch_pr_info_with_retry(wt) {
            Ok(s) => s,
            Err(e) => {
                warn!(issue = %issue.id, branch = %branch, error = %e, "failed to refresh PR status during merge-approved pass");
                report.still_pending.push(issue.signature.clone());
                continue;
            }
        };

        // A PR closed without merging sends the issue back to `new` so the
        // next dispatch pass can try again, rather than leaving it stuck.
        if status.pr_state == Some(crate::core::worktree_engine::PrState::Closed) {
            tracker.update(&issue.signature, |i| i.status = crate::core::fixer::IssueStatus::New);
            report.still_pending.push(issue.signature.clone());
            continue;
        }

        if status.pr_review_status.as_deref() != Some("APPROVED") {
            report.still_pending.push(issue.signature.clone());
            continue;
        }

        tracker.update(&issue.signature, |i| i.status = IssueStatus::FixApproved);

        let merge_opts = MergeOptions { strategy: MergeStrategy::Squash, keep_branch: false };
        match worktree_engine.merge_pr_for_branch(&branch, &merge_opts) {
            Ok(result) if result.success => {
                tracker.update(&issue.signature, |i| {
                    i.status = IssueStatus::FixMerged;
                    i.pr_number = status.pr_number;
                });
                if let Err(e) = worktree_engine.remove(&branch, true) {
                    warn!(issue = %issue.id, branch = %branch, error = %e, "worktree removal after merge failed (non-fatal)");
                }
                report.merged.push(issue.signature.clone());
            }
            Ok(result) => {
                let reason = result.messages.join("; ");
                warn!(issue = %issue.id, branch = %branch, reason = %reason, "PR merge reported failure");
                report.failed.push((issue.signature.clone(), reason));
            }
            Err(e) => {
                warn!(issue = %issue.id, branch = %branch, error = %e, "PR merge call failed");
                report.failed.push((issue.signature.clone(), e.to_string()));
            }
        }
    }

    tracker.save()?;
    Ok(report)
}
