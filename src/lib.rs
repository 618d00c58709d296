//! bramble: a concurrent AI-coding-agent orchestrator over a tree of git
//! worktrees. See `core` for the component breakdown (worktree engine,
//! provider abstraction, session store/manager, event broadcaster, RPC
//! surface, task router, fixer pipeline).

pub mod core;
pub mod error;

pub use error::{BrambleError, Result};
