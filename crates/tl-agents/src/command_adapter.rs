//! [`WorkerAdapter`] that runs an external program once per step.
//!
//! The program receives `{"task": ..., "step": ..., "attempt": ...}` as JSON
//! on stdin and must print a [`StepResult`] as JSON on stdout.

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tl_core::config::AdapterConfig;
use tl_core::types::Task;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::adapter::{AdapterError, StepResult, WorkerAdapter};

#[derive(Serialize)]
struct StepRequest<'a> {
    task: &'a Task,
    step: &'a str,
    attempt: u32,
}

#[derive(Debug, Clone)]
pub struct CommandAdapter {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAdapter {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &AdapterConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone(), config.timeout())
    }
}

/// The last non-empty stdout line is the result; earlier lines are chatter.
fn parse_output(stdout: &[u8]) -> Result<StepResult, AdapterError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| AdapterError::Protocol("adapter produced no output".to_string()))?;
    serde_json::from_str(line.trim())
        .map_err(|e| AdapterError::Protocol(format!("invalid step result: {e}")))
}

#[async_trait::async_trait]
impl WorkerAdapter for CommandAdapter {
    async fn run_step(
        &self,
        task: &Task,
        step: &str,
        attempt: u32,
    ) -> Result<StepResult, AdapterError> {
        let request = serde_json::to_vec(&StepRequest {
            task,
            step,
            attempt,
        })
        .map_err(|e| AdapterError::Protocol(e.to_string()))?;

        debug!(task_id = %task.id, step, attempt, command = %self.command, "spawning adapter");
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while collecting output so neither pipe can stall the
        // other, and keep both under the timeout.
        let stdin = child.stdin.take();
        let task_id = task.id;
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A worker that exits without reading stdin is not an error
                // here; its exit status decides.
                if let Err(e) = stdin.write_all(&request).await {
                    warn!(task_id = %task_id, step, error = %e, "failed to write adapter stdin");
                }
            }
        };
        let exchange = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        // Dropping the exchange on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(output) => output?,
            Err(_) => return Err(AdapterError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            return Err(AdapterError::Process {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_output(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tl_core::types::{StepStatus, TaskType};

    fn sh(script: &str, timeout: Duration) -> CommandAdapter {
        CommandAdapter::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[test]
    fn parse_output_uses_last_line() {
        let out = b"warming up\n{\"status\":\"error\",\"summary\":\"nope\"}\n\n";
        let result = parse_output(out).unwrap();
        assert_eq!(result.status, StepStatus::Error);
        assert_eq!(result.summary, "nope");
    }

    #[test]
    fn parse_output_rejects_empty() {
        assert!(matches!(parse_output(b"  \n"), Err(AdapterError::Protocol(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_request_on_stdin() {
        // Echo the step name from the request back as the summary.
        let adapter = sh(
            r#"step=$(cat | sed -n 's/.*"step":"\([a-z_]*\)".*/\1/p'); printf '{"status":"ok","summary":"%s"}\n' "$step""#,
            Duration::from_secs(10),
        );
        let task = Task::new("echo", TaskType::Chore);
        let result = adapter.run_step(&task, "verify", 1).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(result.summary, "verify");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_process_error() {
        let adapter = sh("cat >/dev/null; echo broken >&2; exit 3", Duration::from_secs(10));
        let task = Task::new("fail", TaskType::Chore);
        match adapter.run_step(&task, "implement", 1).await {
            Err(AdapterError::Process { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected process error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let adapter = sh("sleep 5", Duration::from_millis(100));
        let task = Task::new("slow", TaskType::Chore);
        assert!(matches!(
            adapter.run_step(&task, "implement", 1).await,
            Err(AdapterError::Timeout(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_ignoring_large_request_still_times_out() {
        // Far larger than a pipe buffer, so the write can only finish if the
        // worker reads it.
        let adapter = sh("sleep 5", Duration::from_millis(100));
        let mut task = Task::new("huge", TaskType::Feature);
        task.description = Some("x".repeat(1024 * 1024));

        let started = std::time::Instant::now();
        let result = adapter.run_step(&task, "implement", 1).await;
        assert!(matches!(result, Err(AdapterError::Timeout(_))), "got {result:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let adapter = CommandAdapter::new(
            "definitely-not-a-taskloom-worker",
            vec![],
            Duration::from_secs(1),
        );
        let task = Task::new("missing", TaskType::Chore);
        assert!(matches!(
            adapter.run_step(&task, "plan", 1).await,
            Err(AdapterError::Io(_))
        ));
    }
}
