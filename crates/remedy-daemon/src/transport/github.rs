//! GitHub Actions dispatch transport over the `gh` CLI.
//!
//! Triggers the remediation workflow with `gh workflow run` and resolves
//! the run identifier with `gh run list`. Every subprocess is bounded by
//! the caller-supplied timeout; a deadline kills the child and reports
//! [`DispatchError::Timeout`] so the engine's retry policy takes over.
//!
//! # Authentication
//!
//! The `gh` CLI natively supports `GH_TOKEN`. [`gh_command`] resolves a
//! token from `GITHUB_TOKEN` then `GH_TOKEN` and injects it only when
//! present; with no token, `gh` falls back to its ambient auth state.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use wait_timeout::ChildExt;

use remedy_core::dispatch::{DispatchContext, DispatchTransport};
use remedy_core::error::DispatchError;

/// Bound on captured subprocess output.
const MAX_OUTPUT_BYTES: u64 = 64 * 1024;

/// Builds a `gh` [`Command`] configured for non-interactive, token-based
/// use: update notifier, color, and prompts suppressed, `GH_TOKEN`
/// injected from the environment when available.
#[must_use]
pub fn gh_command() -> Command {
    let mut cmd = Command::new("gh");
    cmd.env("GH_NO_UPDATE_NOTIFIER", "1");
    cmd.env("NO_COLOR", "1");
    cmd.env("GH_PROMPT_DISABLED", "1");
    if let Some(token) = resolve_github_token() {
        cmd.env("GH_TOKEN", token.expose_secret());
    }
    cmd
}

/// Resolves a GitHub token from the environment, `GITHUB_TOKEN` first.
/// Empty values count as absent; no synthetic placeholder is ever
/// produced.
fn resolve_github_token() -> Option<SecretString> {
    ["GITHUB_TOKEN", "GH_TOKEN"]
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .filter(|token| !token.trim().is_empty())
        .map(SecretString::from)
}

/// Dispatch transport that triggers a GitHub Actions workflow.
#[derive(Debug, Clone)]
pub struct GithubDispatchTransport {
    workflow_file: String,
}

impl GithubDispatchTransport {
    /// Creates a transport dispatching the given workflow file (e.g.
    /// `remediate.yml`).
    #[must_use]
    pub fn new(workflow_file: impl Into<String>) -> Self {
        Self {
            workflow_file: workflow_file.into(),
        }
    }
}

impl DispatchTransport for GithubDispatchTransport {
    fn dispatch(
        &self,
        repository: &str,
        context: &DispatchContext,
        timeout: Duration,
    ) -> Result<String, DispatchError> {
        let mut trigger = gh_command();
        trigger.args(workflow_run_args(&self.workflow_file, repository, context));
        let output = run_bounded(trigger, timeout, repository)?;
        if !output.success {
            return Err(DispatchError::Transport(format!(
                "gh workflow run failed for {repository}: {}",
                output.stderr.trim()
            )));
        }
        debug!(repository, workflow = %self.workflow_file, "workflow run accepted");

        // `gh workflow run` is fire-and-forget; the run id comes from a
        // follow-up listing of the newest run for this workflow.
        let mut list = gh_command();
        list.args([
            "run",
            "list",
            "--repo",
            repository,
            "--workflow",
            &self.workflow_file,
            "--limit",
            "1",
            "--json",
            "databaseId",
        ]);
        let output = run_bounded(list, timeout, repository)?;
        if !output.success {
            return Err(DispatchError::Transport(format!(
                "gh run list failed for {repository}: {}",
                output.stderr.trim()
            )));
        }
        parse_run_id(&output.stdout).ok_or_else(|| {
            DispatchError::Transport(format!(
                "no run visible yet for workflow {} in {repository}",
                self.workflow_file
            ))
        })
    }
}

fn workflow_run_args(
    workflow_file: &str,
    repository: &str,
    context: &DispatchContext,
) -> Vec<String> {
    vec![
        "workflow".to_string(),
        "run".to_string(),
        workflow_file.to_string(),
        "--repo".to_string(),
        repository.to_string(),
        "--ref".to_string(),
        context.branch.clone(),
        "-f".to_string(),
        format!("incident_id={}", context.incident_id),
        "-f".to_string(),
        format!("service_name={}", context.service_name),
        "-f".to_string(),
        format!("error_message={}", context.error_message),
        "-f".to_string(),
        format!("severity={}", context.severity),
    ]
}

/// Extracts the run id from `gh run list --json databaseId` output.
fn parse_run_id(stdout: &str) -> Option<String> {
    let runs: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let id = runs.as_array()?.first()?.get("databaseId")?;
    match id {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

#[derive(Debug)]
struct BoundedOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Runs the command with the deadline; on expiry the child is killed and
/// reaped.
fn run_bounded(
    mut cmd: Command,
    timeout: Duration,
    repository: &str,
) -> Result<BoundedOutput, DispatchError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| DispatchError::Transport(format!("failed to spawn gh: {e}")))?;

    let status = child
        .wait_timeout(timeout)
        .map_err(|e| DispatchError::Transport(format!("failed to wait on gh: {e}")))?;
    let Some(status) = status else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(DispatchError::Timeout {
            repository: repository.to_string(),
            timeout_secs: timeout.as_secs(),
        });
    };

    let stdout = read_bounded(child.stdout.take());
    let stderr = read_bounded(child.stderr.take());
    Ok(BoundedOutput {
        success: status.success(),
        stdout,
        stderr,
    })
}

fn read_bounded(stream: Option<impl Read>) -> String {
    let mut text = String::new();
    if let Some(stream) = stream {
        let _ = stream.take(MAX_OUTPUT_BYTES).read_to_string(&mut text);
    }
    text
}
