//! Fix agent backed by an external program.
//!
//! The program runs inside the job workspace, receives the [`FixRequest`]
//! as JSON on stdin, and must print a [`FixResponse`] JSON object on
//! stdout (either the whole output or its last non-empty line).

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{CollaboratorError, CollaboratorResult, FixAgent, FixRequest, FixResponse};
use crate::config::FixAgentConfig;

pub struct CommandFixAgent {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandFixAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &FixAgentConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }
}

#[async_trait]
impl FixAgent for CommandFixAgent {
    async fn request_fix(&self, request: &FixRequest) -> CollaboratorResult<FixResponse> {
        let start = Instant::now();
        let payload = serde_json::to_vec(request)
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&request.workspace_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CollaboratorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // Agent exited without reading its input; its exit status decides.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CollaboratorError::Timeout {
                program: self.program.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        debug!(
            program = %self.program,
            duration_ms = start.elapsed().as_millis() as u64,
            "fix agent finished"
        );

        if !output.status.success() {
            return Err(CollaboratorError::CommandFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_response(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_response(stdout: &str) -> CollaboratorResult<FixResponse> {
    let trimmed = stdout.trim();
    if let Ok(resp) = serde_json::from_str::<FixResponse>(trimmed) {
        return Ok(resp);
    }
    let last = trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| CollaboratorError::InvalidResponse("empty agent output".to_string()))?;
    serde_json::from_str(last).map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))
}
