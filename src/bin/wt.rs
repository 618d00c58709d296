//! `wt`: the worktree-tool CLI (spec §6). Directory-changing subcommands emit
//! a `__WT_CD__:<path>` line for the shell-function wrapper installed by
//! `wt shellenv` to `cd` into.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bramble::core::worktree_engine::{MergeOptions, MergeStrategy, WorktreeEngine};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "wt", about = "Manage git worktrees for concurrent AI-agent sessions")]
struct Cli {
    /// Repository name under WT_ROOT; defaults to the current directory's name.
    #[arg(long, global = true)]
    repo: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Clone `url` into WT_ROOT/<repo> as a bare repo with a default worktree.
    Init { url: String },
    /// Create a new worktree on `branch`, atomically, from `--from` (default base branch).
    New {
        branch: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long, default_value = "")]
        goal: String,
    },
    /// Open an existing branch's worktree, creating it if the branch already exists upstream.
    Open {
        branch: String,
        #[arg(long, default_value = "")]
        goal: String,
    },
    /// List worktrees.
    Ls {
        #[arg(short, long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Remove a worktree.
    Rm {
        name: String,
        #[arg(short = 'D', long = "delete-branch")]
        delete_branch: bool,
    },
    /// Print git/PR status for worktrees.
    Status {
        #[arg(short, long)]
        all: bool,
    },
    /// Cascade a topological rebase across worktrees (or just `branch`).
    Sync {
        branch: Option<String>,
        #[arg(short, long)]
        all: bool,
    },
    /// Merge the current worktree's branch's PR.
    Merge {
        branch: String,
        #[arg(long)]
        keep: bool,
        #[arg(long)]
        squash: bool,
        #[arg(long)]
        rebase: bool,
        #[arg(long)]
        merge: bool,
    },
    /// Create a PR for a branch.
    Pr {
        branch: String,
        #[arg(short = 't', long)]
        title: Option<String>,
        #[arg(short = 'b', long)]
        body: Option<String>,
        #[arg(long)]
        base: Option<String>,
        #[arg(long)]
        draft: bool,
        #[arg(long)]
        no_push: bool,
    },
    /// Print the worktree path for `branch` (or the current one) for the shell wrapper to `cd` into.
    Cd { branch: Option<String> },
    /// Print or set the current worktree's goal text.
    Goal { text: Option<String> },
    /// List (or, with -n, remove) worktrees with no tracked parent past a staleness threshold.
    Prune {
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
    },
    /// Print the shell function that wraps this binary to intercept `__WT_CD__:` lines.
    Shellenv,
}

fn wt_root() -> PathBuf {
    std::env::var_os("WT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| dirs_home().join("worktrees"))
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

fn repo_name(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::current_dir().ok().and_then(|d| d.file_name().map(|n| n.to_string_lossy().to_string())))
        .unwrap_or_else(|| "repo".to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();
    let engine = WorktreeEngine::new(wt_root(), repo_name(cli.repo));

    match cli.command {
        Command::Init { url } => {
            let path = engine.init(&url)?;
            println!("__WT_CD__:{}", path.display());
        }
        Command::New { branch, from, goal } => {
            let base = match from {
                Some(b) => b,
                None => engine.default_base_branch()?,
            };
            let path = engine.new_atomic(&branch, &base, &goal)?;
            println!("__WT_CD__:{}", path.display());
        }
        Command::Open { branch, goal } => {
            let path = engine.open(&branch, &goal)?;
            println!("__WT_CD__:{}", path.display());
        }
        Command::Ls { all, json } => {
            let worktrees = engine.list()?;
            let shown: Vec<_> = if all { worktrees } else { worktrees.into_iter().filter(|w| !w.detached).collect() };
            if json {
                println!("{}", serde_json::to_string_pretty(&shown)?);
            } else {
                for w in &shown {
                    println!("{}\t{}\t{}", w.branch, w.commit, w.path);
                }
            }
        }
        Command::Rm { name, delete_branch } => {
            engine.remove(&name, delete_branch)?;
        }
        Command::Status { all } => {
            let worktrees = engine.list()?;
            let shown: Vec<_> = if all { worktrees } else { worktrees.into_iter().filter(|w| !w.detached).collect() };
            let statuses = engine.fetch_all_pr_info(&shown)?;
            for w in &shown {
                let status = statuses.get(&w.branch);
                let pr = status.and_then(|s| s.pr_number).map(|n| format!("#{n}")).unwrap_or_else(|| "-".to_string());
                let dirty = status.map(|s| s.is_dirty).unwrap_or(false);
                println!("{}\t{}\t{}dirty", w.branch, pr, if dirty { "" } else { "not-" });
            }
        }
        Command::Sync { branch, all } => {
            let target = if all { None } else { branch.as_deref() };
            let report = engine.sync(target)?;
            println!("rebased: {:?}", report.rebased);
            if !report.skipped.is_empty() {
                println!("skipped: {:?}", report.skipped);
            }
            for failure in &report.failed {
                eprintln!("FAILED {} ({}): {}\n  {}", failure.branch, failure.path, failure.error, failure.remediation);
            }
            if !report.failed.is_empty() {
                std::process::exit(1);
            }
        }
        Command::Merge { branch, keep, squash, rebase, merge } => {
            let strategy = if squash {
                MergeStrategy::Squash
            } else if rebase {
                MergeStrategy::Rebase
            } else if merge {
                MergeStrategy::Merge
            } else {
                MergeStrategy::Squash
            };
            let result = engine.merge_pr_for_branch(&branch, &MergeOptions { strategy, keep_branch: keep })?;
            for m in &result.messages {
                println!("{m}");
            }
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Pr { branch, title, body, base, draft, no_push } => {
            let base = match base {
                Some(b) => b,
                None => engine.parent_of(&branch).unwrap_or(engine.default_base_branch()?),
            };
            let title = title.unwrap_or_else(|| branch.clone());
            let body = body.unwrap_or_default();
            match engine.create_pr_with_push(&branch, &base, &title, &body, draft, !no_push)? {
                Some((number, url)) => println!("#{number} {url}"),
                None => println!("no changes to submit"),
            }
        }
        Command::Cd { branch } => {
            let branch = match branch {
                Some(b) => b,
                None => current_branch_name()?,
            };
            let path = engine.list()?.into_iter().find(|w| w.branch == branch).context("no such worktree")?.path;
            println!("__WT_CD__:{path}");
        }
        Command::Goal { text } => match text {
            Some(t) => {
                let branch = current_branch_name()?;
                engine.set_goal(&branch, &t)?;
            }
            None => {
                let branch = current_branch_name()?;
                println!("{}", engine.goal_of(&branch).unwrap_or_default());
            }
        },
        Command::Prune { dry_run } => {
            let orphans = engine.detect_orphans(std::time::Duration::from_secs(14 * 24 * 3600))?;
            for (wt, age_secs) in &orphans {
                println!("{}\t{}d old", wt.branch, age_secs / 86_400);
                if !dry_run {
                    engine.remove(&wt.branch, false)?;
                }
            }
        }
        Command::Shellenv => {
            print!("{SHELL_WRAPPER}");
        }
    }
    Ok(())
}

fn current_branch_name() -> Result<String> {
    let out = std::process::Command::new("git").args(["rev-parse", "--abbrev-ref", "HEAD"]).output().context("git rev-parse")?;
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

const SHELL_WRAPPER: &str = r#"wt() {
  local out
  out="$(command wt "$@")" || return $?
  case "$out" in
    __WT_CD__:*)
      cd "${out#__WT_CD__:}" || return 1
      ;;
    *)
      [ -n "$out" ] && printf '%s\n' "$out"
      ;;
  esac
}
"#;
