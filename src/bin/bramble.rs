//! `bramble`: the orchestrator entry point (spec §6). `bramble` on its own
//! runs a local interactive session against a repo under `WT_ROOT`; `bramble
//! serve` instead exposes the same session/worktree/task-router surface over
//! the RPC listener for remote clients to attach to.
//!
//! The interactive TUI itself is glue outside this crate's core scope; this
//! binary wires the core components together and, in local mode, drives a
//! minimal line-oriented front end sufficient to issue prompts and observe
//! output without a terminal UI library.

use std::io::{BufRead, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bramble::core::broadcaster::Broadcaster;
use bramble::core::provider::AgentRegistry;
use bramble::core::rpc::{generate_token, RpcServer};
use bramble::core::session_manager::{SessionManager, SessionType, StartSessionOptions};
use bramble::core::session_store::SessionStore;
use bramble::core::task_router::TaskRouter;
use bramble::core::worktree_engine::{SystemGHRunner, SystemGitRunner, WorktreeEngine};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bramble", about = "Concurrent AI-coding agent orchestrator over a tree of git worktrees")]
struct Cli {
    #[arg(long)]
    repo: Option<String>,
    #[arg(long, env = "EDITOR", default_value = "vi")]
    editor: String,
    #[arg(long, default_value = "auto")]
    session_mode: String,
    #[arg(long)]
    yolo: bool,
    #[arg(long, env = "BRAMBLE_PROTOCOL_LOG_DIR")]
    protocol_log_dir: Option<PathBuf>,
    #[arg(long)]
    remote: Option<String>,
    #[arg(long, env = "BRAMBLE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run headless, exposing the RPC surface for remote clients.
    Serve {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "127.0.0.1")]
        addr: String,
        #[arg(long, default_value_t = 4747)]
        port: u16,
        #[arg(long)]
        yolo: bool,
        #[arg(long, default_value = "auto")]
        session_mode: String,
        #[arg(long, env = "BRAMBLE_TOKEN")]
        token: Option<String>,
    },
}

fn wt_root() -> PathBuf {
    std::env::var_os("WT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")).join("worktrees"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Serve { repo, addr, port, yolo, session_mode, token }) => serve(repo, addr, port, yolo, session_mode, token),
        None => run_local(cli),
    }
}

fn build_components(repo_name: &str) -> Result<(Arc<WorktreeEngine>, Arc<SessionManager>, Arc<Broadcaster>)> {
    let root = wt_root();
    let engine = Arc::new(WorktreeEngine::with_runners(root.clone(), repo_name.to_string(), Arc::new(SystemGitRunner), Arc::new(SystemGHRunner)));
    let store = Arc::new(SessionStore::new(root.join(repo_name).join(".bramble").join("sessions")));
    let agents = Arc::new(std::sync::Mutex::new(AgentRegistry::detect()));
    let (session_manager, event_rx) = SessionManager::new(store, engine.clone(), agents, repo_name.to_string());
    let broadcaster = Broadcaster::new();
    broadcaster.spawn(event_rx);
    Ok((engine, session_manager, broadcaster))
}

fn serve(repo: String, addr: String, port: u16, yolo: bool, session_mode: String, token: Option<String>) -> Result<()> {
    let _ = (yolo, session_mode);
    let (engine, session_manager, broadcaster) = build_components(&repo)?;

    let task_router = std::env::var("BRAMBLE_ROUTER_API_KEY").ok().map(|key| {
        Arc::new(
            TaskRouter::new(
                std::env::var("BRAMBLE_ROUTER_API_BASE").unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                Some(key),
                std::env::var("BRAMBLE_ROUTER_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                "main",
            )
            .expect("build task router http client"),
        )
    });

    let token = token.unwrap_or_else(|| {
        let t = generate_token();
        println!("{t}");
        t
    });

    let server = Arc::new(RpcServer::new(token, session_manager, engine, broadcaster, task_router));
    let bind_addr = format!("{addr}:{port}");
    info!(%bind_addr, "bramble serve starting");
    server.serve(&bind_addr)
}

/// A minimal line-oriented loop: `new <branch> <prompt>` starts a builder
/// session, `say <id> <message>` sends a follow-up, `quit` exits. This is
/// intentionally not a terminal UI — just enough to drive the core state
/// machine interactively without one.
fn run_local(cli: Cli) -> Result<()> {
    let repo_name = cli.repo.unwrap_or_else(|| {
        std::env::current_dir().ok().and_then(|d| d.file_name().map(|n| n.to_string_lossy().to_string())).unwrap_or_else(|| "repo".to_string())
    });

    if let Some(remote) = &cli.remote {
        let token = cli.token.clone().unwrap_or_default();
        return run_remote(remote, &token);
    }

    let (_engine, session_manager, broadcaster) = build_components(&repo_name)?;
    let _ = (cli.editor, cli.session_mode, cli.yolo, cli.protocol_log_dir);
    let (sub_id, events) = broadcaster.subscribe(256);

    println!("bramble local session ({repo_name}). Commands: new <branch> <prompt> | say <id> <msg> | quit");
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        print!("> ");
        stdout.flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        if let Some(rest) = line.strip_prefix("new ") {
            let mut parts = rest.splitn(2, ' ');
            let branch = parts.next().unwrap_or_default();
            let prompt = parts.next().unwrap_or_default();
            match session_manager.start_session(SessionType::Builder, branch, prompt, StartSessionOptions::default()) {
                Ok(id) => println!("started session {id}"),
                Err(e) => eprintln!("error: {e:#}"),
            }
        } else if let Some(rest) = line.strip_prefix("say ") {
            let mut parts = rest.splitn(2, ' ');
            let id = parts.next().unwrap_or_default();
            let msg = parts.next().unwrap_or_default();
            if let Err(e) = session_manager.send_follow_up(id, msg) {
                eprintln!("error: {e:#}");
            }
        } else {
            eprintln!("unrecognized command");
        }

        while let Some(event) = events.try_recv() {
            println!("{event:?}");
        }
    }

    broadcaster.unsubscribe(sub_id);
    session_manager.shutdown();
    Ok(())
}

fn run_remote(addr: &str, token: &str) -> Result<()> {
    let client = bramble::core::rpc::RpcClient::new(addr, token);
    let sessions = client.get_all_sessions().context("connect to remote bramble server")?;
    println!("connected to {addr}; {} session(s) known", sessions.len());
    Ok(())
}
