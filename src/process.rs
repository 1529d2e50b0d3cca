use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("`{program}` timed out after {secs}s", secs = .after.as_secs())]
    TimedOut { program: String, after: Duration },
    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

/// Exit status plus everything the child wrote.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut out = String::new();
        out.push_str(self.stdout.trim_end());
        if !self.stderr.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(self.stderr.trim_end());
        }
        out
    }
}

/// Run `cmd` to completion with stdout/stderr captured.
///
/// When `timeout` elapses the child is killed and `TimedOut` is returned.
pub async fn run_captured(
    mut cmd: Command,
    timeout: Option<Duration>,
) -> Result<CapturedOutput, ProcessError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

    let output = match timeout {
        Some(after) => tokio::time::timeout(after, child.wait_with_output())
            .await
            .map_err(|_| ProcessError::TimedOut {
                program: program.clone(),
                after,
            })?,
        None => child.wait_with_output().await,
    }
    .map_err(|source| ProcessError::Wait { program, source })?;

    Ok(CapturedOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_both_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let output = run_captured(cmd, None).await.unwrap();
        assert!(output.success());
        assert_eq!(output.combined(), "out\nerr");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let output = run_captured(cmd, None).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.combined(), "boom");
    }

    #[tokio::test]
    async fn slow_child_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_captured(cmd, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let cmd = Command::new("chartgate-definitely-not-a-program");
        let err = run_captured(cmd, None).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
