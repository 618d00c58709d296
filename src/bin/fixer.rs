//! `fixer`: CI-failure remediation CLI driving the scan/dispatch/merge
//! pipeline (spec §4.8, §6) outside of a live `bramble` session.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bramble::core::fixer::dispatch::{dispatch_fixes, DEFAULT_PARALLELISM};
use bramble::core::fixer::merge::run_merge_approved;
use bramble::core::fixer::scan::{run_scan, Triager};
use bramble::core::fixer::tracker::{default_tracker_path, Tracker};
use bramble::core::fixer::IssueStatus;
use bramble::core::ids::new_id;
use bramble::core::session_manager::SessionManager;
use bramble::core::session_store::SessionStore;
use bramble::core::worktree_engine::{SystemGHRunner, SystemGitRunner, WorktreeEngine};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fixer", about = "Scan CI failures, dispatch fixes, merge approved PRs")]
struct Cli {
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
    #[arg(long)]
    tracker: Option<PathBuf>,
    #[arg(long)]
    session_dir: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch recent failed CI runs and triage them into tracked issues.
    Scan {
        branch: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 5.0)]
        budget_usd: f64,
        #[arg(long, default_value_t = 0.05)]
        cost_per_triage_call: f64,
        #[arg(long, env = "FIXER_API_BASE", default_value = "https://api.openai.com/v1")]
        api_base: String,
        #[arg(long, env = "FIXER_API_KEY", default_value = "")]
        api_key: String,
        #[arg(long, default_value = "gpt-4o-mini")]
        model: String,
    },
    /// Dispatch ephemeral builder sessions for actionable issues.
    Fix {
        scan_branch: String,
        #[arg(long, default_value_t = DEFAULT_PARALLELISM)]
        parallelism: usize,
    },
    /// Refresh PR status and merge approved fixes.
    Merge,
    /// Print a summary of tracked issues by status.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
    let repo_root = cli.repo_root.canonicalize().unwrap_or(cli.repo_root.clone());
    let repo_name = repo_root.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "repo".to_string());
    let wt_root = repo_root.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    let tracker_path = cli.tracker.clone().unwrap_or_else(|| default_tracker_path(&repo_root));
    let tracker = Arc::new(Tracker::load(&tracker_path)?);
    let engine = Arc::new(WorktreeEngine::with_runners(wt_root, repo_name.clone(), Arc::new(SystemGitRunner), Arc::new(SystemGHRunner)));

    match cli.command {
        Command::Scan { branch, limit, budget_usd, cost_per_triage_call, api_base, api_key, model } => {
            let triager = Triager::new(api_base, api_key, model)?;
            let report = run_scan(&SystemGHRunner, &repo_root, &branch, limit, &triager, &tracker, budget_usd, cost_per_triage_call, || new_id("issue"))?;
            tracker.save()?;
            println!(
                "scanned {} run(s), skipped {} over budget; {} new, {} updated, {} resolved",
                report.runs_scanned,
                report.runs_skipped_over_budget,
                report.reconcile.new.len(),
                report.reconcile.updated.len(),
                report.reconcile.resolved.len(),
            );
        }
        Command::Fix { scan_branch, parallelism } => {
            if cli.dry_run {
                let actionable: Vec<_> = tracker.list().into_iter().filter(|i| i.status == IssueStatus::New).collect();
                println!("{} issue(s) would be dispatched", actionable.len());
                return Ok(());
            }
            let session_dir = cli.session_dir.clone().unwrap_or_else(|| repo_root.join(".fixer").join("sessions"));
            let store = Arc::new(SessionStore::new(session_dir));
            let agents = Arc::new(std::sync::Mutex::new(bramble::core::provider::AgentRegistry::detect()));
            let (session_manager, _event_rx) = SessionManager::new(store, engine.clone(), agents, repo_name);
            let cost = dispatch_fixes(&tracker, &engine, &session_manager, &scan_branch, parallelism)?;
            println!("dispatched; total cost ${cost:.2}");
        }
        Command::Merge => {
            if cli.dry_run {
                let pending = tracker.list_by_status(IssueStatus::FixPending);
                println!("{} issue(s) awaiting approval", pending.len());
                return Ok(());
            }
            let report = run_merge_approved(&tracker, &engine)?;
            println!("merged {}, still pending {}, failed {}", report.merged.len(), report.still_pending.len(), report.failed.len());
            for (sig, reason) in &report.failed {
                eprintln!("FAILED {sig}: {reason}");
            }
        }
        Command::Status => {
            let mut by_status: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
            for issue in tracker.list() {
                *by_status.entry(format!("{:?}", issue.status)).or_insert(0) += 1;
            }
            for (status, count) in &by_status {
                println!("{status}\t{count}");
            }
        }
    }

    Ok(())
}
