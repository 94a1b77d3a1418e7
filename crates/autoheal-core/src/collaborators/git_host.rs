//! Repository host backed by the `git` and `gh` command-line tools.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use super::{CollaboratorError, CollaboratorResult, PullRequest, PullRequestSpec, RepoHost};
use crate::config::RepoHostConfig;

/// `gh pr checks` exit status while checks are still running.
const GH_CHECKS_PENDING: i32 = 8;

pub struct GitCliHost {
    clone_base_url: String,
    author_name: String,
    author_email: String,
    poll_interval: Duration,
}

impl GitCliHost {
    pub fn new(config: &RepoHostConfig, poll_interval: Duration) -> Self {
        Self {
            clone_base_url: config.clone_base_url.trim_end_matches('/').to_string(),
            author_name: config
                .git_author_name
                .clone()
                .unwrap_or_else(|| "autoheal".to_string()),
            author_email: config
                .git_author_email
                .clone()
                .unwrap_or_else(|| "autoheal@localhost".to_string()),
            poll_interval,
        }
    }

    /// Clone URL for a repository key. Keys that are already URLs or
    /// absolute paths are used as-is.
    pub fn clone_url(&self, repo_key: &str) -> String {
        if repo_key.contains("://") || repo_key.starts_with('/') || repo_key.starts_with("git@") {
            repo_key.to_string()
        } else {
            format!("{}/{}.git", self.clone_base_url, repo_key)
        }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> CollaboratorResult<String> {
        let identity = [
            "-c".to_string(),
            format!("user.name={}", self.author_name),
            "-c".to_string(),
            format!("user.email={}", self.author_email),
        ];
        let mut cmd = Command::new("git");
        cmd.args(&identity).args(args).current_dir(cwd);
        run(cmd, "git").await
    }

    async fn gh(&self, args: &[&str]) -> CollaboratorResult<String> {
        let mut cmd = Command::new("gh");
        cmd.args(args);
        run(cmd, "gh").await
    }
}

async fn run(mut cmd: Command, program: &str) -> CollaboratorResult<String> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| CollaboratorError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(CollaboratorError::CommandFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `gh` prints the created resource URL as its last line.
fn last_url(stdout: &str) -> CollaboratorResult<String> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with("http"))
        .map(str::to_string)
        .ok_or_else(|| CollaboratorError::InvalidResponse(format!("no URL in output: {stdout}")))
}

/// Trailing numeric path segment of a pull request URL.
fn pr_number(url: &str) -> CollaboratorResult<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| CollaboratorError::InvalidResponse(format!("no PR number in {url}")))
}

#[async_trait]
impl RepoHost for GitCliHost {
    async fn clone_repo(
        &self,
        repo_key: &str,
        branch: &str,
        dest: &Path,
    ) -> CollaboratorResult<()> {
        let url = self.clone_url(repo_key);
        let dest_str = dest.to_string_lossy();
        let parent = dest.parent().unwrap_or(dest);
        // A failed attempt may leave a partial checkout behind.
        if tokio::fs::metadata(dest).await.is_ok() {
            tokio::fs::remove_dir_all(dest).await?;
        }
        debug!(repo_key = %repo_key, branch = %branch, "cloning");
        self.git(
            parent,
            &["clone", "--depth", "1", "--branch", branch, &url, &dest_str],
        )
        .await?;
        Ok(())
    }

    async fn create_branch(&self, workspace: &Path, branch: &str) -> CollaboratorResult<()> {
        self.git(workspace, &["checkout", "-b", branch]).await?;
        Ok(())
    }

    async fn commit(&self, workspace: &Path, message: &str) -> CollaboratorResult<()> {
        self.git(workspace, &["add", "-A"]).await?;
        self.git(workspace, &["commit", "-m", message]).await?;
        Ok(())
    }

    async fn push(&self, workspace: &Path, branch: &str) -> CollaboratorResult<()> {
        self.git(workspace, &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    async fn create_pull_request(
        &self,
        repo_key: &str,
        spec: &PullRequestSpec,
    ) -> CollaboratorResult<PullRequest> {
        let out = self
            .gh(&[
                "pr", "create", "--repo", repo_key, "--head", &spec.head, "--base", &spec.base,
                "--title", &spec.title, "--body", &spec.body,
            ])
            .await?;
        let url = last_url(&out)?;
        Ok(PullRequest {
            number: pr_number(&url)?,
            url,
        })
    }

    async fn poll_checks(
        &self,
        repo_key: &str,
        git_ref: &str,
        timeout: Duration,
    ) -> CollaboratorResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let output = Command::new("gh")
                .args(["pr", "checks", git_ref, "--repo", repo_key])
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|source| CollaboratorError::Spawn {
                    program: "gh".to_string(),
                    source,
                })?;

            match output.status.code() {
                Some(0) => return Ok(true),
                Some(GH_CHECKS_PENDING) => {}
                _ => return Ok(false),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(repo_key = %repo_key, git_ref = %git_ref, "checks still pending at deadline");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn merge(&self, repo_key: &str, pr: &PullRequest) -> CollaboratorResult<()> {
        let number = pr.number.to_string();
        self.gh(&["pr", "merge", &number, "--repo", repo_key, "--squash", "--delete-branch"])
            .await?;
        Ok(())
    }

    async fn create_issue(
        &self,
        repo_key: &str,
        title: &str,
        body: &str,
    ) -> CollaboratorResult<String> {
        let out = self
            .gh(&["issue", "create", "--repo", repo_key, "--title", title, "--body", body])
            .await?;
        last_url(&out)
    }
}
