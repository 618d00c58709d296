//! Task Router (C7): routes a free-form prompt to an existing worktree or
//! proposes a new one, via an LLM call with a deterministic offline fallback.
//!
//! The HTTP call shape (short explicit timeout, `reqwest::blocking::Client`,
//! provider-specific auth header, tolerant JSON-shape parsing) is grounded on
//! `core::settings::validate_provider_key`/`list_provider_models` — the
//! teacher's only other code that speaks to a provider's HTTP API directly.

use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::worktree_engine::{PrState, WorktreeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    UseExisting,
    CreateNew,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub prompt: String,
    pub worktrees: Vec<WorktreeStatus>,
    pub current_worktree: Option<String>,
    pub repo_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteProposal {
    pub action: RouteAction,
    pub worktree: String,
    pub parent: Option<String>,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RawProposal {
    action: String,
    worktree: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    reasoning: String,
}

pub struct TaskRouter {
    client: reqwest::blocking::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    default_base_branch: String,
}

impl TaskRouter {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>, model: impl Into<String>, default_base_branch: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(12))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            api_key,
            model: model.into(),
            default_base_branch: default_base_branch.into(),
        })
    }

    pub fn route(&self, req: &RouteRequest) -> RouteProposal {
        match self.route_via_llm(req) {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!(error = %e, "task router falling back to heuristic");
                self.heuristic_route(req)
            }
        }
    }

    fn render_prompt(&self, req: &RouteRequest) -> String {
        let mut lines = vec![
            format!("Repository: {}", req.repo_name),
            "Existing worktrees:".to_string(),
        ];
        for w in &req.worktrees {
            let pr = match w.pr_state {
                Some(PrState::Open) => "open PR",
                Some(PrState::Merged) => "merged PR",
                Some(PrState::Closed) => "closed PR",
                None => "no PR",
            };
            lines.push(format!(
                "- {} (dirty={}, ahead={}, behind={}, {})",
                w.worktree.branch, w.is_dirty, w.ahead, w.behind, pr
            ));
        }
        if let Some(cur) = &req.current_worktree {
            lines.push(format!("Current worktree: {cur}"));
        }
        lines.push(String::new());
        lines.push(format!("User request: {}", req.prompt));
        lines.push(String::new());
        lines.push(
            "Respond with a single JSON object: {\"action\": \"use_existing\"|\"create_new\", \"worktree\": \"<name>\", \"parent\": \"<branch or null>\", \"reasoning\": \"<short>\"}."
                .to_string(),
        );
        lines.join("\n")
    }

    fn route_via_llm(&self, req: &RouteRequest) -> Result<RouteProposal> {
        let api_key = self.api_key.as_deref().context("no task router API key configured")?;
        let prompt = self.render_prompt(req);

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .context("task router request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("task router provider returned {}", resp.status());
        }

        let value: serde_json::Value = resp.json().context("parse task router response body")?;
        let content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|s| s.as_str())
            .context("missing choices[0].message.content")?;

        parse_proposal(content, &self.default_base_branch)
    }

    fn heuristic_route(&self, req: &RouteRequest) -> RouteProposal {
        let words = significant_words(&req.prompt, 4);
        let name = if words.is_empty() {
            "feature-untitled".to_string()
        } else {
            format!("feature-{}", words.join("-"))
        };
        RouteProposal {
            action: RouteAction::CreateNew,
            worktree: name,
            parent: Some(self.default_base_branch.clone()),
            reasoning: "offline heuristic: provider unavailable, derived worktree name from prompt keywords".to_string(),
        }
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

fn parse_proposal(content: &str, default_base_branch: &str) -> Result<RouteProposal> {
    let cleaned = strip_code_fence(content);
    let raw: RawProposal = serde_json::from_str(cleaned).context("tolerant-parse task router JSON body")?;

    let action = match raw.action.as_str() {
        "use_existing" => RouteAction::UseExisting,
        "create_new" => RouteAction::CreateNew,
        other => anyhow::bail!("unexpected action `{other}` from task router response"),
    };

    let worktree = raw.worktree.trim();
    if worktree.is_empty() {
        anyhow::bail!("task router response had an empty worktree name");
    }

    let parent = match action {
        RouteAction::CreateNew => match raw.parent.filter(|p| !p.trim().is_empty()) {
            Some(p) => Some(p),
            None => Some(default_base_branch.to_string()),
        },
        RouteAction::UseExisting => raw.parent.filter(|p| !p.trim().is_empty()),
    };

    Ok(RouteProposal {
        action,
        worktree: worktree.to_string(),
        parent,
        reasoning: raw.reasoning,
    })
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "to", "for", "of", "and", "or", "is", "are", "in", "on", "with", "please",
    "can", "you", "i", "want", "need", "that", "this", "it", "be",
];

fn significant_words(prompt: &str, max: usize) -> Vec<String> {
    let word_re = Regex::new(r"[A-Za-z0-9]+").unwrap();
    word_re
        .find_iter(prompt)
        .map(|m| m.as_str().to_ascii_lowercase())
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(&w.as_str()))
        .take(max)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_code_fence() {
        let raw = "```json\n{\"action\":\"use_existing\",\"worktree\":\"feature-x\",\"parent\":null,\"reasoning\":\"matches\"}\n```";
        let proposal = parse_proposal(raw, "main").unwrap();
        assert_eq!(proposal.action, RouteAction::UseExisting);
        assert_eq!(proposal.worktree, "feature-x");
    }

    #[test]
    fn create_new_with_empty_parent_defaults_to_base_branch() {
        let raw = r#"{"action":"create_new","worktree":"feature-y","parent":"","reasoning":"new feature"}"#;
        let proposal = parse_proposal(raw, "main").unwrap();
        assert_eq!(proposal.parent.as_deref(), Some("main"));
    }

    #[test]
    fn rejects_unknown_action() {
        let raw = r#"{"action":"delete_everything","worktree":"x"}"#;
        assert!(parse_proposal(raw, "main").is_err());
    }

    #[test]
    fn heuristic_extracts_significant_words() {
        let words = significant_words("Please add a dark mode toggle to the settings page", 4);
        assert_eq!(words, vec!["add", "dark", "mode", "toggle"]);
    }
}
