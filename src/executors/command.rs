//! Capability executor backed by external shell commands.
//!
//! Each invocation runs `sh -c <command>` in the project directory with the
//! JSON-encoded [`CapabilityRequest`] on stdin and `GATEWORK_CAPABILITY` set.
//! The command answers with an [`ExecutionResult`] as JSON on stdout; log lines
//! before the final JSON line are ignored.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::capability::{Capability, CapabilityRequest, ExecutionResult};
use crate::config::ExecutorsConfig;
use crate::error::ExecutorError;

pub struct CommandExecutor {
    commands: ExecutorsConfig,
    workdir: PathBuf,
    timeout: Duration,
    bootstrap: OnceCell<Result<(), String>>,
}

impl CommandExecutor {
    pub fn new(commands: ExecutorsConfig, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            commands,
            workdir: workdir.into(),
            timeout,
            bootstrap: OnceCell::new(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.commands.command_for(capability).is_some()
    }

    /// Run the bootstrap procedure once per executor. Failure is an environment error.
    async fn ensure_environment(&self) -> Result<(), ExecutorError> {
        let Some(cmd) = self.commands.bootstrap.as_deref() else {
            return Ok(());
        };
        let outcome = self
            .bootstrap
            .get_or_init(|| async {
                info!(command = cmd, "starting verification environment");
                match self.spawn(cmd, None, &[]).await {
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;
        outcome.clone().map_err(ExecutorError::Environment)
    }

    pub async fn run(&self, request: &CapabilityRequest) -> Result<ExecutionResult, ExecutorError> {
        let capability = request.capability();
        let cmd = self
            .commands
            .command_for(capability)
            .ok_or(ExecutorError::Unsupported(capability))?;

        if capability == Capability::Verify {
            self.ensure_environment().await?;
        }

        let payload = serde_json::to_vec(request)
            .map_err(|e| ExecutorError::Failed(format!("failed to encode request: {e}")))?;
        debug!(%capability, command = cmd, "invoking command executor");
        let stdout = self
            .spawn(cmd, Some(&payload), &[("GATEWORK_CAPABILITY", capability.as_str())])
            .await?;
        parse_output(&stdout)
    }

    async fn spawn(
        &self,
        cmd: &str,
        stdin: Option<&[u8]>,
        envs: &[(&str, &str)],
    ) -> Result<Vec<u8>, ExecutorError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.workdir)
            .envs(envs.iter().copied())
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Failed(format!("failed to spawn `{cmd}`: {e}")))?;

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // A command that never reads stdin closes the pipe early; that is fine.
            if let Err(e) = pipe.write_all(payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(ExecutorError::Failed(format!("failed to write request: {e}")));
                }
            }
            drop(pipe);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutorError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| ExecutorError::Failed(format!("`{cmd}` did not complete: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(command = cmd, status = %output.status, "command executor failed");
            return Err(ExecutorError::Failed(format!(
                "`{cmd}` exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Parse the result JSON: the whole output, or else its last JSON object line.
fn parse_output(stdout: &[u8]) -> Result<ExecutionResult, ExecutorError> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(ExecutionResult::default());
    }
    if let Ok(result) = serde_json::from_str(trimmed) {
        return Ok(result);
    }
    let last = trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| ExecutorError::Failed("command output contains no JSON result".into()))?;
    serde_json::from_str(last)
        .map_err(|e| ExecutorError::Failed(format!("malformed command result: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{NotifyRequest, VerifyPurpose, VerifyRequest};
    use tempfile::TempDir;

    fn executor(tmp: &TempDir, commands: ExecutorsConfig) -> CommandExecutor {
        CommandExecutor::new(commands, tmp.path(), Duration::from_secs(10))
    }

    fn notify() -> CapabilityRequest {
        CapabilityRequest::Notify(NotifyRequest { text: "hello".into() })
    }

    fn verify() -> CapabilityRequest {
        CapabilityRequest::Verify(VerifyRequest {
            purpose: VerifyPurpose::Baseline,
            targets: vec![],
        })
    }

    #[test]
    fn parse_output_accepts_trailing_json_line() {
        let out = b"starting browser\nchecking F-1\n{\"evidence\":[\"shot.png\"]}\n";
        let result = parse_output(out).unwrap();
        assert_eq!(result.evidence, vec!["shot.png"]);
    }

    #[test]
    fn parse_output_rejects_garbage() {
        assert!(parse_output(b"no json here").is_err());
        assert_eq!(parse_output(b"   ").unwrap(), ExecutionResult::default());
    }

    #[tokio::test]
    async fn request_is_sent_on_stdin_and_result_parsed() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(
            &tmp,
            ExecutorsConfig {
                notify: Some(
                    "cat > request.json; echo \"{\\\"summary\\\":\\\"$GATEWORK_CAPABILITY\\\"}\"".into(),
                ),
                ..Default::default()
            },
        );

        let result = exec.run(&notify()).await.unwrap();
        assert_eq!(result.summary, "notify");

        let sent = std::fs::read_to_string(tmp.path().join("request.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(value["capability"], "notify");
        assert_eq!(value["request"]["text"], "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(
            &tmp,
            ExecutorsConfig {
                notify: Some("echo boom >&2; exit 3".into()),
                ..Default::default()
            },
        );
        let err = exec.run(&notify()).await.unwrap_err();
        match err {
            ExecutorError::Failed(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_command_is_unsupported() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(&tmp, ExecutorsConfig::default());
        assert!(!exec.supports(Capability::Notify));
        assert_eq!(
            exec.run(&notify()).await.unwrap_err(),
            ExecutorError::Unsupported(Capability::Notify)
        );
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let tmp = TempDir::new().unwrap();
        let exec = CommandExecutor::new(
            ExecutorsConfig {
                notify: Some("sleep 5".into()),
                ..Default::default()
            },
            tmp.path(),
            Duration::from_millis(200),
        );
        assert!(matches!(
            exec.run(&notify()).await.unwrap_err(),
            ExecutorError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn bootstrap_runs_once_before_verify() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(
            &tmp,
            ExecutorsConfig {
                verify: Some("echo '{\"evidence\":[\"a.png\"]}'".into()),
                bootstrap: Some("echo started >> bootstrap.log".into()),
                ..Default::default()
            },
        );

        exec.run(&verify()).await.unwrap();
        exec.run(&verify()).await.unwrap();

        let log = std::fs::read_to_string(tmp.path().join("bootstrap.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[tokio::test]
    async fn bootstrap_failure_is_an_environment_error() {
        let tmp = TempDir::new().unwrap();
        let exec = executor(
            &tmp,
            ExecutorsConfig {
                verify: Some("echo '{}'".into()),
                bootstrap: Some("exit 1".into()),
                ..Default::default()
            },
        );
        let err = exec.run(&verify()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Environment(_)));
        // Not retried within the session.
        assert!(matches!(
            exec.run(&verify()).await.unwrap_err(),
            ExecutorError::Environment(_)
        ));
    }
}
