//! Crate-wide error taxonomy (spec §7).

use std::fmt;

/// The stable set of error kinds every core component surfaces to its callers.
///
/// Leaf-level I/O and parsing keep using `anyhow::Context` for ad-hoc detail;
/// call sites convert into one of these variants at the component boundary
/// where the taxonomy actually matters to the caller (routing, retry, exit code).
#[derive(Debug, thiserror::Error)]
pub enum BrambleError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("subprocess `{cmd}` failed: {stderr_tail}")]
    Subprocess { cmd: String, stderr_tail: String },

    #[error("network/rpc error: {0}")]
    Network(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("cancelled")]
    Cancelled,

    #[error("hook failed (non-fatal): {0}")]
    HookFailure(String),
}

impl BrambleError {
    pub fn subprocess(cmd: impl fmt::Display, stderr: &str) -> Self {
        let tail: String = stderr.chars().rev().take(2000).collect::<Vec<_>>().into_iter().rev().collect();
        BrambleError::Subprocess {
            cmd: cmd.to_string(),
            stderr_tail: tail,
        }
    }

    /// Whether this kind is, per §7's propagation policy, safe to retry automatically.
    /// Only idempotent read operations are retried, and only by the specific callers
    /// named in the spec (e.g. GitHub status queries during MergeApproved refresh) —
    /// this is a classification helper, not a generic retry trigger.
    pub fn is_transient_network(&self) -> bool {
        matches!(self, BrambleError::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, BrambleError>;
