//! Healer configuration.
//!
//! Loaded from TOML (every field optional, defaults below) and then
//! overridden by CLI flags. Durations are milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{HealError, Result};

/// External program used as the fix-generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAgentConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_fix_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_fix_timeout_ms() -> u64 {
    300_000
}

/// Settings for the git/gh backed repository host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoHostConfig {
    #[serde(default = "default_clone_base_url")]
    pub clone_base_url: String,
    #[serde(default)]
    pub git_author_name: Option<String>,
    #[serde(default)]
    pub git_author_email: Option<String>,
}

fn default_clone_base_url() -> String {
    "https://github.com".to_string()
}

impl Default for RepoHostConfig {
    fn default() -> Self {
        Self {
            clone_base_url: default_clone_base_url(),
            git_author_name: None,
            git_author_email: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    /// Root for `workspaces/`, `locks/`, `history.jsonl`, `throttle.json`.
    pub base_dir: PathBuf,
    /// Single concurrency budget: the batch width.
    pub concurrency: usize,

    pub cooldown_ms: u64,
    pub max_attempts_per_error: u32,
    pub attempt_window_ms: u64,
    pub blocklist: Vec<String>,

    pub lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub lock_stale_after_ms: u64,
    pub workspace_max_age_ms: u64,

    pub clone_retries: u32,
    pub clone_backoff_base_ms: u64,

    pub auto_merge: bool,
    pub ci_wait_timeout_ms: u64,
    pub ci_poll_interval_ms: u64,
    pub open_issue_on_failure: bool,
    pub base_branch_fallback: String,

    pub fix_agent: Option<FixAgentConfig>,
    pub repo_host: Option<RepoHostConfig>,
    pub webhook_url: Option<String>,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".autoheal"),
            concurrency: 3,
            cooldown_ms: 300_000,
            max_attempts_per_error: 3,
            attempt_window_ms: 86_400_000,
            blocklist: Vec::new(),
            lock_timeout_ms: 30_000,
            lock_poll_interval_ms: 500,
            lock_stale_after_ms: 600_000,
            workspace_max_age_ms: 3_600_000,
            clone_retries: 3,
            clone_backoff_base_ms: 1_000,
            auto_merge: false,
            ci_wait_timeout_ms: 240_000,
            ci_poll_interval_ms: 15_000,
            open_issue_on_failure: false,
            base_branch_fallback: "main".to_string(),
            fix_agent: None,
            repo_host: None,
            webhook_url: None,
        }
    }
}

impl HealerConfig {
    /// Parse a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| HealError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(HealError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.lock_poll_interval_ms == 0 || self.ci_poll_interval_ms == 0 {
            return Err(HealError::InvalidConfig(
                "poll intervals must be non-zero".to_string(),
            ));
        }
        if self.max_attempts_per_error == 0 {
            return Err(HealError::InvalidConfig(
                "max_attempts_per_error must be at least 1".to_string(),
            ));
        }
        if let Some(agent) = &self.fix_agent {
            if agent.program.trim().is_empty() {
                return Err(HealError::InvalidConfig(
                    "fix_agent.program must not be empty".to_string(),
                ));
            }
        }
        let held = self.longest_lock_hold_ms();
        if held >= self.lock_stale_after_ms {
            return Err(HealError::InvalidConfig(format!(
                "lock_stale_after_ms ({}) must exceed the time a job can hold its lock ({held}ms: fix agent timeout plus CI wait when auto_merge is set)",
                self.lock_stale_after_ms
            )));
        }
        Ok(())
    }

    /// Upper bound of the bounded steps a job runs while holding its lease.
    /// Leases are never renewed, so this must stay below the stale threshold.
    pub fn longest_lock_hold_ms(&self) -> u64 {
        let fix = self.fix_agent.as_ref().map_or(0, |a| a.timeout_ms);
        let ci = if self.auto_merge {
            self.ci_wait_timeout_ms
        } else {
            0
        };
        fix.saturating_add(ci)
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.base_dir.join("workspaces")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.base_dir.join("locks")
    }

    pub fn history_path(&self) -> PathBuf {
        self.base_dir.join("history.jsonl")
    }

    pub fn throttle_path(&self) -> PathBuf {
        self.base_dir.join("throttle.json")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn workspace_max_age(&self) -> Duration {
        Duration::from_millis(self.workspace_max_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = HealerConfig::default();
        assert_eq!(cfg.cooldown_ms, 300_000);
        assert_eq!(cfg.max_attempts_per_error, 3);
        assert_eq!(cfg.lock_poll_interval_ms, 500);
        assert_eq!(cfg.lock_stale_after_ms, 600_000);
        assert_eq!(cfg.clone_retries, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = HealerConfig::from_toml_str(
            r#"
            concurrency = 5
            blocklist = ["org/legacy"]

            [fix_agent]
            program = "fixer"
            args = ["--json"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.concurrency, 5);
        assert_eq!(cfg.blocklist, vec!["org/legacy".to_string()]);
        assert_eq!(cfg.cooldown_ms, 300_000);
        let agent = cfg.fix_agent.unwrap();
        assert_eq!(agent.program, "fixer");
        assert_eq!(agent.timeout_ms, 300_000);
    }

    #[test]
    fn defaults_with_agent_and_auto_merge_fit_the_stale_threshold() {
        let cfg = HealerConfig::from_toml_str(
            r#"
            auto_merge = true

            [fix_agent]
            program = "fixer"
            "#,
        )
        .unwrap();
        assert!(cfg.longest_lock_hold_ms() < cfg.lock_stale_after_ms);
    }

    #[test]
    fn stale_threshold_shorter_than_job_steps_is_rejected() {
        let err = HealerConfig::from_toml_str(
            r#"
            auto_merge = true
            ci_wait_timeout_ms = 600000

            [fix_agent]
            program = "fixer"
            timeout_ms = 900000
            "#,
        )
        .unwrap_err();
        match err {
            HealError::InvalidConfig(msg) => assert!(msg.contains("lock_stale_after_ms"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }

        // Same steps with a longer threshold are fine.
        let cfg = HealerConfig::from_toml_str(
            r#"
            auto_merge = true
            ci_wait_timeout_ms = 600000
            lock_stale_after_ms = 1800000

            [fix_agent]
            program = "fixer"
            timeout_ms = 900000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.longest_lock_hold_ms(), 1_500_000);
    }

    #[test]
    fn ci_wait_only_counts_with_auto_merge() {
        let cfg = HealerConfig {
            ci_wait_timeout_ms: 3_600_000,
            ..HealerConfig::default()
        };
        assert_eq!(cfg.longest_lock_hold_ms(), 0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = HealerConfig::from_toml_str("concurrency = 0").unwrap_err();
        assert!(matches!(err, HealError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_toml_is_invalid_config() {
        let err = HealerConfig::from_toml_str("concurrency = \"many\"").unwrap_err();
        assert!(matches!(err, HealError::InvalidConfig(_)));
    }

    #[test]
    fn paths_hang_off_base_dir() {
        let cfg = HealerConfig {
            base_dir: PathBuf::from("/srv/heal"),
            ..Default::default()
        };
        assert_eq!(cfg.history_path(), PathBuf::from("/srv/heal/history.jsonl"));
        assert_eq!(cfg.locks_dir(), PathBuf::from("/srv/heal/locks"));
    }
}
