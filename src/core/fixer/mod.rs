//! Fixer Pipeline (C8): scans CI failures, triages them into tracked issues,
//! dispatches fix attempts as ephemeral builder sessions, and merges approved
//! fixes back in.
//!
//! Grounded on `core::review_store` for the file-per-record persistence
//! shape (directory of JSON files, atomic-ish write-then-read) generalized
//! here into a single tracker file via `session_store`'s stricter
//! write-temp-then-rename, and on `core::git_manager::merge_branch` for the
//! merge step.

pub mod dispatch;
pub mod merge;
pub mod scan;
pub mod tracker;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Lint,
    Test,
    Build,
    Typecheck,
    Unknown,
}

impl IssueCategory {
    pub fn from_str_or_unknown(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "lint" => IssueCategory::Lint,
            "test" => IssueCategory::Test,
            "build" => IssueCategory::Build,
            "typecheck" => IssueCategory::Typecheck,
            _ => IssueCategory::Unknown,
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            IssueCategory::Lint => "lint",
            IssueCategory::Test => "test",
            IssueCategory::Build => "build",
            IssueCategory::Typecheck => "typecheck",
            IssueCategory::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    New,
    InProgress,
    FixPending,
    FixApproved,
    FixMerged,
    Verified,
    Closed,
    WontFix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub signature: String,
    pub category: IssueCategory,
    pub job: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub summary: String,
    pub details: String,
    pub status: IssueStatus,
    pub first_seen_at: String,
    pub last_seen_at: String,
    pub seen_count: u32,
    pub fix_branch: Option<String>,
    pub pr_number: Option<u64>,
    pub attempts: Vec<FixAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAttempt {
    pub started_at: String,
    pub completed_at: Option<String>,
    pub session_id: Option<String>,
    pub branch: String,
    pub success: bool,
    pub cost_usd: f64,
    pub notes: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageFinding {
    pub category: String,
    pub job: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    pub summary: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub new: Vec<String>,
    pub updated: Vec<String>,
    pub resolved: Vec<String>,
}

struct SignatureRegexes {
    line_col: Regex,
    hex_run: Regex,
    iso8601: Regex,
}

static SIGNATURE_REGEXES: OnceLock<SignatureRegexes> = OnceLock::new();

fn signature_regexes() -> &'static SignatureRegexes {
    SIGNATURE_REGEXES.get_or_init(|| SignatureRegexes {
        line_col: Regex::new(r":\d+:\d+").unwrap(),
        hex_run: Regex::new(r"\b[0-9a-fA-F]{7,40}\b").unwrap(),
        iso8601: Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?").unwrap(),
    })
}

/// Normalizes a triage summary so that line/column numbers, commit-ish hex
/// runs, and timestamps never affect dedup, then derives a dedup signature
/// from `(category, file, normalizedSummary)` — deliberately job-independent
/// (spec §8 testable property 6) so the same failure reported against two
/// different job names in the same run still collapses to one issue.
pub fn compute_signature(category: IssueCategory, file: Option<&str>, summary: &str) -> String {
    let re = signature_regexes();
    let mut normalized = re.line_col.replace_all(summary, "").to_string();
    normalized = re.hex_run.replace_all(&normalized, "<hex>").to_string();
    normalized = re.iso8601.replace_all(&normalized, "<ts>").to_string();
    let normalized: String = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{}:{}:{}", category.slug(), file.unwrap_or(""), normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_job_independent() {
        let sig1 = compute_signature(IssueCategory::Lint, Some("main.go"), "unused variable x");
        let sig2 = compute_signature(IssueCategory::Lint, Some("main.go"), "unused variable x");
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn signature_ignores_line_col_hex_and_timestamps() {
        let a = compute_signature(IssueCategory::Test, Some("pkg/foo.rs"), "assertion failed at foo.rs:10:5 commit abcdef1 at 2026-01-02T03:04:05Z");
        let b = compute_signature(IssueCategory::Test, Some("pkg/foo.rs"), "assertion failed at foo.rs:99:1 commit 0123456789abcdef0123456789abcdef01234567 at 2027-06-07T08:09:10.123Z");
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_category_string_maps_to_unknown() {
        assert_eq!(IssueCategory::from_str_or_unknown("flaky"), IssueCategory::Unknown);
        assert_eq!(IssueCategory::from_str_or_unknown("Lint"), IssueCategory::Lint);
    }
}
