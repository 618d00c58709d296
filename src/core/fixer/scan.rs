//! Fixer scan stage: fetches recent failed CI runs for a branch, cleans
//! their logs, and triages them into `TriageFinding`s via an LLM call.
//!
//! `GHRunner` reuse is grounded on `worktree_engine::GHRunner`/`SystemGHRunner`
//! (the same subprocess contract the worktree engine already uses for
//! `gh pr` calls); log cleanup (ANSI-strip, truncate-at-line-boundary) follows
//! the same "never half a line" care the teacher's diff truncation shows in
//! `WorktreeEngine::gather_context`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::core::fixer::TriageFinding;
use crate::core::worktree_engine::GHRunner;
use crate::error::BrambleError;

const MAX_LOG_BYTES: usize = 50 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct FailedRun {
    pub run_id: u64,
    pub branch: String,
    pub jobs: Vec<String>,
}

fn strip_ansi(s: &str) -> String {
    let re = Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").unwrap();
    re.replace_all(s, "").to_string()
}

fn strip_ci_timestamps(s: &str) -> String {
    // GitHub Actions log lines are prefixed "2026-01-02T03:04:05.1234567Z ".
    let re = Regex::new(r"(?m)^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+Z ").unwrap();
    re.replace_all(s, "").to_string()
}

/// Truncates to the last `MAX_LOG_BYTES`, but only at a line boundary so a
/// partial line never reaches the triage prompt. CI logs routinely contain
/// multi-byte UTF-8 (non-ASCII text, emoji), so the byte cut point is walked
/// back to a char boundary before slicing, and the result is recovered with
/// `from_utf8_lossy` rather than indexing the `&str` directly.
fn truncate_at_line_boundary(s: &str, max_bytes: usize) -> String {
    let bytes = s.as_bytes();
    if bytes.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = bytes.len() - max_bytes;
    while start < bytes.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    let tail = String::from_utf8_lossy(&bytes[start..]);
    match tail.find('\n') {
        Some(idx) => tail[idx + 1..].to_string(),
        None => tail.to_string(),
    }
}

pub fn clean_log(raw: &str) -> String {
    let no_ansi = strip_ansi(raw);
    let no_ts = strip_ci_timestamps(&no_ansi);
    truncate_at_line_boundary(&no_ts, MAX_LOG_BYTES)
}

pub fn fetch_failed_runs(gh: &dyn GHRunner, workdir: &Path, branch: &str, limit: usize) -> Result<Vec<FailedRun>> {
    let limit_str = limit.to_string();
    let out = gh.run(
        &["run", "list", "--branch", branch, "--status", "failure", "--limit", &limit_str, "--json", "databaseId,headBranch"],
        workdir,
    )?;
    if !out.success() {
        return Err(BrambleError::subprocess("gh run list", &out.stderr).into());
    }
    #[derive(Deserialize)]
    struct Row {
        #[serde(rename = "databaseId")]
        database_id: u64,
        #[serde(rename = "headBranch")]
        head_branch: String,
    }
    let rows: Vec<Row> = serde_json::from_str(&out.stdout).context("parse gh run list output")?;
    Ok(rows
        .into_iter()
        .map(|r| FailedRun { run_id: r.database_id, branch: r.head_branch, jobs: Vec::new() })
        .collect())
}

pub fn fetch_run_log(gh: &dyn GHRunner, workdir: &Path, run_id: u64) -> Result<String> {
    let run_id_str = run_id.to_string();
    let out = gh.run(&["run", "view", &run_id_str, "--log-failed"], workdir)?;
    if !out.success() {
        return Err(BrambleError::subprocess(format!("gh run view --log-failed {run_id}"), &out.stderr).into());
    }
    Ok(clean_log(&out.stdout))
}

/// Best-effort: a run with no check-run annotations (e.g. a plain shell
/// failure) is not itself an error, so failures here are swallowed.
pub fn fetch_run_annotations(gh: &dyn GHRunner, workdir: &Path, run_id: u64) -> Vec<String> {
    let run_id_str = run_id.to_string();
    let Ok(out) = gh.run(&["run", "view", &run_id_str, "--json", "jobs"], workdir) else {
        return Vec::new();
    };
    if !out.success() {
        return Vec::new();
    }
    let Ok(v) = serde_json::from_str::<serde_json::Value>(&out.stdout) else {
        return Vec::new();
    };
    v.get("jobs")
        .and_then(|j| j.as_array())
        .map(|jobs| {
            jobs.iter()
                .filter_map(|j| j.get("name").and_then(|n| n.as_str()).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub runs_scanned: usize,
    pub runs_skipped_over_budget: usize,
    pub reconcile: crate::core::fixer::ReconcileReport,
}

/// The full scan pass (spec §4.8): fetch recent failed runs, triage each
/// through the LLM within `budget_usd`, then reconcile every run's findings
/// into the tracker as a single batch (so `resolved` reflects runs this scan
/// actually looked at, not a half-scanned set).
pub fn run_scan(
    gh: &dyn GHRunner,
    workdir: &Path,
    branch: &str,
    run_limit: usize,
    triager: &Triager,
    tracker: &crate::core::fixer::tracker::Tracker,
    budget_usd: f64,
    cost_per_triage_call: f64,
    mut new_id_fn: impl FnMut() -> String,
) -> Result<ScanReport> {
    let runs = fetch_failed_runs(gh, workdir, branch, run_limit)?;
    let mut budget = ScanBudget::new(budget_usd);
    let mut all_findings = Vec::new();
    let mut scanned = 0usize;
    let mut skipped = 0usize;

    for run in &runs {
        if !budget.remaining() {
            skipped += 1;
            continue;
        }
        let log = match fetch_run_log(gh, workdir, run.run_id) {
            Ok(l) => l,
            Err(e) => {
                warn!(run_id = run.run_id, error = %e, "skipping run: failed to fetch log");
                continue;
            }
        };
        let annotations = fetch_run_annotations(gh, workdir, run.run_id);
        match triager.triage(run.run_id, &log) {
            Ok(mut findings) => {
                budget.record(cost_per_triage_call);
                scanned += 1;
                // An invalid/blank job name falls back to the first job that
                // actually failed in this run, rather than an empty field.
                if let Some(first_job) = annotations.first() {
                    for f in &mut findings {
                        if f.job.trim().is_empty() || !annotations.iter().any(|j| j == &f.job) {
                            f.job = first_job.clone();
                        }
                    }
                }
                // Duplicate signatures within one run collapse; cross-run
                // dedup happens in `Tracker::reconcile`.
                let mut seen = std::collections::HashSet::new();
                findings.retain(|f| {
                    let cat = crate::core::fixer::IssueCategory::from_str_or_unknown(&f.category);
                    seen.insert(crate::core::fixer::compute_signature(cat, f.file.as_deref(), &f.summary))
                });
                all_findings.extend(findings);
            }
            Err(e) => {
                warn!(run_id = run.run_id, error = %e, "triage call failed for run");
            }
        }
    }

    let reconcile = tracker.reconcile(&all_findings, &mut new_id_fn);
    Ok(ScanReport { runs_scanned: scanned, runs_skipped_over_budget: skipped, reconcile })
}

pub struct Triager {
    client: reqwest::blocking::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl Triager {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self { client, api_base: api_base.into(), api_key: api_key.into(), model: model.into() })
    }

    /// Sends one cleaned log bundle to the triage model and expects a JSON
    /// array of findings, tolerant of a surrounding markdown code fence.
    pub fn triage(&self, run_id: u64, cleaned_log: &str) -> Result<Vec<TriageFinding>> {
        let prompt = format!(
            "Analyze this CI failure log from run {run_id} and return a JSON array of findings, each \
             {{\"category\": \"lint\"|\"test\"|\"build\"|\"typecheck\"|\"unknown\", \"job\": \"<job name>\", \
             \"file\": \"<path or null>\", \"line\": <number or null>, \"summary\": \"<one line>\", \"details\": \"<context>\"}}.\n\n{cleaned_log}"
        );
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("triage request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("triage provider returned {}", resp.status());
        }
        let value: serde_json::Value = resp.json().context("parse triage response body")?;
        let content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|s| s.as_str())
            .context("missing choices[0].message.content")?;
        parse_findings(content)
    }
}

fn strip_code_fence(s: &str) -> &str {
    let trimmed = s.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.trim_start_matches("json").trim_start();
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
        return rest.trim();
    }
    trimmed
}

fn parse_findings(content: &str) -> Result<Vec<TriageFinding>> {
    let cleaned = strip_code_fence(content);
    let findings: Vec<TriageFinding> = serde_json::from_str(cleaned).context("tolerant-parse triage JSON array")?;
    Ok(findings
        .into_iter()
        .map(|mut f| {
            if f.job.trim().is_empty() {
                warn!("triage finding missing job name; leaving blank rather than guessing");
            }
            f.category = f.category.trim().to_ascii_lowercase();
            f
        })
        .collect())
}

/// Tracks USD spend across one scan invocation so the caller can stop
/// triaging further runs once the configured budget is exhausted.
pub struct ScanBudget {
    limit_usd: f64,
    spent_usd: f64,
}

impl ScanBudget {
    pub fn new(limit_usd: f64) -> Self {
        Self { limit_usd, spent_usd: 0.0 }
    }

    pub fn remaining(&self) -> bool {
        self.spent_usd < self.limit_usd
    }

    pub fn record(&mut self, cost_usd: f64) {
        self.spent_usd += cost_usd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_log_strips_ansi_and_timestamps() {
        let raw = "2026-01-02T03:04:05.1234567Z \x1b[31merror: build failed\x1b[0m\nok line\n";
        let cleaned = clean_log(raw);
        assert!(!cleaned.contains('\x1b'));
        assert!(!cleaned.contains("2026-01-02T03:04:05"));
        assert!(cleaned.contains("error: build failed"));
    }

    #[test]
    fn truncate_never_splits_a_line() {
        let lines: Vec<String> = (0..10_000).map(|i| format!("line {i}")).collect();
        let raw = lines.join("\n");
        let truncated = truncate_at_line_boundary(&raw, 100);
        assert!(truncated.len() <= raw.len());
        assert!(!truncated.starts_with("ne ") && !truncated.is_empty());
    }

    #[test]
    fn parses_findings_from_fenced_json() {
        let content = "```json\n[{\"category\":\"lint\",\"job\":\"lint\",\"summary\":\"bad\"}]\n```";
        let findings = parse_findings(content).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, "lint");
    }

    #[test]
    fn budget_stops_after_limit_reached() {
        let mut budget = ScanBudget::new(1.0);
        assert!(budget.remaining());
        budget.record(0.9);
        assert!(budget.remaining());
        budget.record(0.2);
        assert!(!budget.remaining());
    }
}
