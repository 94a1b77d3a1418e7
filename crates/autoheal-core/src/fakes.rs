//! Scripted collaborators (testing only)
//!
//! `ScriptedFixAgent`, `RecordingRepoHost` and `RecordingNotifier` satisfy
//! the collaborator traits in memory and record every call.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::collaborators::{
    CollaboratorError, CollaboratorResult, FixAgent, FixRequest, FixResponse, Notifier,
    PullRequest, PullRequestSpec, RepoHost,
};
use crate::events::HealingEvent;

// ---------------------------------------------------------------------------
// ScriptedFixAgent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Script {
    Respond(FixResponse),
    Fail(String),
    Panic,
}

/// Fix agent that answers every request the same way.
#[derive(Debug)]
pub struct ScriptedFixAgent {
    script: Script,
    delay: Option<Duration>,
    requests: Mutex<Vec<FixRequest>>,
}

impl ScriptedFixAgent {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Writes each file into the workspace and reports them changed.
    pub fn changes(strategy: &str, files: &[&str]) -> Self {
        Self::with_script(Script::Respond(FixResponse {
            success: true,
            strategy: strategy.to_string(),
            files_changed: files.iter().map(|f| f.to_string()).collect(),
            message: None,
        }))
    }

    /// Succeeds without touching anything.
    pub fn no_changes() -> Self {
        Self::with_script(Script::Respond(FixResponse {
            success: true,
            strategy: "inspect".to_string(),
            files_changed: Vec::new(),
            message: Some("nothing to fix".to_string()),
        }))
    }

    /// Every call errors, like an unreachable agent.
    pub fn failing(message: &str) -> Self {
        Self::with_script(Script::Fail(message.to_string()))
    }

    pub fn panicking() -> Self {
        Self::with_script(Script::Panic)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<FixRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FixAgent for ScriptedFixAgent {
    async fn request_fix(&self, request: &FixRequest) -> CollaboratorResult<FixResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.script {
            Script::Respond(resp) => {
                for file in &resp.files_changed {
                    let path = request.workspace_path.join(file);
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&path, b"patched\n").await?;
                }
                Ok(resp.clone())
            }
            Script::Fail(msg) => Err(CollaboratorError::InvalidResponse(msg.clone())),
            Script::Panic => panic!("scripted agent panic"),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingRepoHost
// ---------------------------------------------------------------------------

/// Repository host that records calls instead of talking to a server.
#[derive(Debug)]
pub struct RecordingRepoHost {
    calls: Mutex<Vec<String>>,
    clones: Mutex<Vec<PathBuf>>,
    clone_failures: AtomicU32,
    fail_push: bool,
    checks_pass: bool,
}

impl Default for RecordingRepoHost {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            clones: Mutex::new(Vec::new()),
            clone_failures: AtomicU32::new(0),
            fail_push: false,
            checks_pass: true,
        }
    }
}

impl RecordingRepoHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` clone calls fail.
    pub fn failing_clones(self, n: u32) -> Self {
        self.clone_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_push(mut self) -> Self {
        self.fail_push = true;
        self
    }

    pub fn with_checks(mut self, pass: bool) -> Self {
        self.checks_pass = pass;
        self
    }

    /// Operation names in call order (`clone`, `branch`, `commit`, ...).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == op).count()
    }

    /// Destinations of successful clones.
    pub fn clone_destinations(&self) -> Vec<PathBuf> {
        self.clones.lock().unwrap().clone()
    }

    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }
}

fn pr_url(repo_key: &str) -> String {
    format!("https://git.example.test/{repo_key}/pull/1")
}

#[async_trait]
impl RepoHost for RecordingRepoHost {
    async fn clone_repo(
        &self,
        _repo_key: &str,
        _branch: &str,
        dest: &Path,
    ) -> CollaboratorResult<()> {
        self.record("clone");
        let remaining = self.clone_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.clone_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CollaboratorError::CommandFailed {
                program: "git".to_string(),
                status: "exit status: 128".to_string(),
                stderr: "could not resolve host".to_string(),
            });
        }
        tokio::fs::create_dir_all(dest).await?;
        self.clones.lock().unwrap().push(dest.to_path_buf());
        Ok(())
    }

    async fn create_branch(&self, _workspace: &Path, _branch: &str) -> CollaboratorResult<()> {
        self.record("branch");
        Ok(())
    }

    async fn commit(&self, _workspace: &Path, _message: &str) -> CollaboratorResult<()> {
        self.record("commit");
        Ok(())
    }

    async fn push(&self, _workspace: &Path, _branch: &str) -> CollaboratorResult<()> {
        self.record("push");
        if self.fail_push {
            return Err(CollaboratorError::CommandFailed {
                program: "git".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "permission denied".to_string(),
            });
        }
        Ok(())
    }

    async fn create_pull_request(
        &self,
        repo_key: &str,
        _spec: &PullRequestSpec,
    ) -> CollaboratorResult<PullRequest> {
        self.record("pull_request");
        Ok(PullRequest {
            number: 1,
            url: pr_url(repo_key),
        })
    }

    async fn poll_checks(
        &self,
        _repo_key: &str,
        _git_ref: &str,
        _timeout: Duration,
    ) -> CollaboratorResult<bool> {
        self.record("checks");
        Ok(self.checks_pass)
    }

    async fn merge(&self, _repo_key: &str, _pr: &PullRequest) -> CollaboratorResult<()> {
        self.record("merge");
        Ok(())
    }

    async fn create_issue(
        &self,
        repo_key: &str,
        _title: &str,
        _body: &str,
    ) -> CollaboratorResult<String> {
        self.record("issue");
        Ok(format!("https://git.example.test/{repo_key}/issues/1"))
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<HealingEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HealingEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &HealingEvent) -> CollaboratorResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
