//! Per-repo `.wt.yaml` configuration (spec §6).
//!
//! Parsed with `serde_yaml`, following the same disk-schema-plus-`#[serde(default)]`
//! convention the teacher applies to its own JSON config sections in `core::settings`,
//! collapsed to a single schema here since there is no separate view shape to keep
//! in sync for a headless config file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct WtConfig {
    #[serde(default)]
    pub default_base: Option<String>,
    #[serde(default)]
    pub post_create: Vec<String>,
    #[serde(default)]
    pub post_remove: Vec<String>,
    #[serde(default)]
    pub on_worktree_create: Vec<String>,
    #[serde(default)]
    pub on_worktree_delete: Vec<String>,
}

impl WtConfig {
    pub fn load(worktree_path: &Path) -> Result<Self> {
        let path = worktree_path.join(".wt.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WtConfig::load(dir.path()).unwrap();
        assert!(cfg.post_create.is_empty());
        assert_eq!(cfg.default_base, None);
    }

    #[test]
    fn parses_hooks_and_default_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".wt.yaml"),
            "default_base: develop\npost_create:\n  - echo hi\non_worktree_create:\n  - npm install\n",
        )
        .unwrap();
        let cfg = WtConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.default_base.as_deref(), Some("develop"));
        assert_eq!(cfg.post_create, vec!["echo hi".to_string()]);
        assert_eq!(cfg.on_worktree_create, vec!["npm install".to_string()]);
    }
}
