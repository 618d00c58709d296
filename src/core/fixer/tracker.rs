//! Persistent `signature -> Issue` map backing the fixer pipeline.
//!
//! Single JSON file (`<repo>/.fixer/issues.json`), written atomically via
//! write-temp-then-rename — the same pattern `session_store::SessionStore`
//! uses, generalized here to a whole-map snapshot rather than per-record
//! files since the teacher's closest analogue (`core::review_store`) keeps
//! one file per record but the fixer's map is small and always read/written
//! as a unit during reconcile.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::core::ids::now_rfc3339;
use crate::core::fixer::{Issue, IssueStatus, ReconcileReport, TriageFinding, compute_signature, IssueCategory};

pub struct Tracker {
    path: PathBuf,
    issues: Mutex<HashMap<String, Issue>>,
}

impl Tracker {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let issues = if path.exists() {
            let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self { path, issues: Mutex::new(issues) })
    }

    pub fn save(&self) -> Result<()> {
        let issues = self.issues.lock().expect("tracker mutex poisoned");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&*issues).context("serialize fixer tracker")?;
        fs::write(&tmp, text).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    pub fn get(&self, signature: &str) -> Option<Issue> {
        self.issues.lock().expect("tracker mutex poisoned").get(signature).cloned()
    }

    pub fn list(&self) -> Vec<Issue> {
        self.issues.lock().expect("tracker mutex poisoned").values().cloned().collect()
    }

    pub fn list_by_status(&self, status: IssueStatus) -> Vec<Issue> {
        self.issues
            .lock()
            .expect("tracker mutex poisoned")
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect()
    }

    pub fn update<F: FnOnce(&mut Issue)>(&self, signature: &str, f: F) {
        if let Some(issue) = self.issues.lock().expect("tracker mutex poisoned").get_mut(signature) {
            f(issue);
        }
    }

    /// Merges one scan's triage findings into the map: existing issues get
    /// `lastSeenAt`/`seenCount` bumped, unseen findings are inserted `new`,
    /// and tracked issues absent from this scan's findings (but not already
    /// terminal) transition to `resolved`-equivalent (`Closed`).
    pub fn reconcile(&self, findings: &[TriageFinding], mut new_id_fn: impl FnMut() -> String) -> ReconcileReport {
        let mut issues = self.issues.lock().expect("tracker mutex poisoned");
        let now = now_rfc3339();
        let mut seen_signatures = std::collections::HashSet::new();
        let mut report = ReconcileReport::default();

        for finding in findings {
            let category = IssueCategory::from_str_or_unknown(&finding.category);
            let signature = compute_signature(category, finding.file.as_deref(), &finding.summary);
            if !seen_signatures.insert(signature.clone()) {
                continue; // duplicate signature within this scan: collapse
            }

            if let Some(issue) = issues.get_mut(&signature) {
                issue.last_seen_at = now.clone();
                issue.seen_count += 1;
                report.updated.push(signature);
            } else {
                let id = new_id_fn();
                issues.insert(
                    signature.clone(),
                    Issue {
                        id,
                        signature: signature.clone(),
                        category,
                        job: finding.job.clone(),
                        file: finding.file.clone(),
                        line: finding.line,
                        summary: finding.summary.clone(),
                        details: finding.details.clone(),
                        status: IssueStatus::New,
                        first_seen_at: now.clone(),
                        last_seen_at: now.clone(),
                        seen_count: 1,
                        fix_branch: None,
                        pr_number: None,
                        attempts: Vec::new(),
                    },
                );
                report.new.push(signature);
            }
        }

        for (signature, issue) in issues.iter_mut() {
            if seen_signatures.contains(signature) {
                continue;
            }
            if !matches!(issue.status, IssueStatus::Closed | IssueStatus::WontFix | IssueStatus::FixMerged | IssueStatus::Verified) {
                issue.status = IssueStatus::Closed;
                report.resolved.push(signature.clone());
            }
        }

        report
    }
}

pub fn default_tracker_path(repo_root: &Path) -> PathBuf {
    repo_root.join(".fixer").join("issues.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(category: &str, job: &str, file: &str, line: u32, summary: &str) -> TriageFinding {
        TriageFinding {
            category: category.to_string(),
            job: job.to_string(),
            file: Some(file.to_string()),
            line: Some(line),
            summary: summary.to_string(),
            details: String::new(),
        }
    }

    #[test]
    fn dedups_same_signature_across_two_scans() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::load(dir.path().join("issues.json")).unwrap();
        let mut counter = 0u64;
        let mut next_id = || {
            counter += 1;
            format!("issue-{counter}")
        };

        let scan_a = vec![finding("lint", "lint-go", "main.go", 10, "unused variable x")];
        let report_a = tracker.reconcile(&scan_a, &mut next_id);
        assert_eq!(report_a.new.len(), 1);

        let scan_b = vec![finding("lint", "lint-go-2", "main.go", 20, "unused variable x")];
        let report_b = tracker.reconcile(&scan_b, &mut next_id);
        assert_eq!(report_b.new.len(), 0);
        assert_eq!(report_b.updated.len(), 1);

        let issues = tracker.list();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].seen_count, 2);
    }

    #[test]
    fn missing_issue_is_closed_on_next_scan() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::load(dir.path().join("issues.json")).unwrap();
        let mut counter = 0u64;
        let mut next_id = || {
            counter += 1;
            format!("issue-{counter}")
        };

        tracker.reconcile(&[finding("build", "build", "a.rs", 1, "error one")], &mut next_id);
        let report = tracker.reconcile(&[], &mut next_id);
        assert_eq!(report.resolved.len(), 1);
    }

    #[test]
    fn save_and_reload_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("issues.json");
        let tracker = Tracker::load(&path).unwrap();
        let mut counter = 0u64;
        let mut next_id = || {
            counter += 1;
            format!("issue-{counter}")
        };
        tracker.reconcile(&[finding("test", "t", "b.rs", 2, "boom")], &mut next_id);
        tracker.save().unwrap();

        let reloaded = Tracker::load(&path).unwrap();
        assert_eq!(reloaded.list().len(), 1);
    }
}
