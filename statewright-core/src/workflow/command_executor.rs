//! Run-to-completion command jobs
//!
//! Stands in for container jobs: the task input carries a `command` override
//! (a shell string, or an argument array appended to the configured program)
//! and an optional `env` map. Callback-mode dispatches start the job in the
//! background with the task token in `TASK_TOKEN`; the job reports back
//! through the completion API.

use crate::workflow::executor::{TaskError, TaskExecutor, TaskInput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment variable carrying the task token to callback jobs
pub const TASK_TOKEN_ENV: &str = "TASK_TOKEN";
/// Environment variable carrying the completion API base URL
pub const CALLBACK_URL_ENV: &str = "STATEWRIGHT_CALLBACK_URL";

/// Executes commands as child processes
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    /// Entry point that array commands are appended to
    program: Option<String>,
    callback_url: Option<String>,
}

/// Finished job
#[derive(Debug, Clone)]
struct JobOutput {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CommandExecutor {
    /// Run `command` strings through `bash -c`; array commands name their own program
    pub fn new() -> Self {
        Self::default()
    }

    /// Run array commands as arguments of `program`, like a container entry point
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: Some(program.into()),
            callback_url: None,
        }
    }

    /// Base URL handed to callback jobs so they can report their result
    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    fn build_command(&self, payload: &Value) -> Result<Command, TaskError> {
        let spec = match payload {
            Value::Object(map) => map.get("command").unwrap_or(&Value::Null),
            other => other,
        };
        let mut command = match spec {
            Value::String(script) => match &self.program {
                Some(program) => {
                    let mut command = Command::new(program);
                    command.arg(script);
                    command
                }
                None => {
                    let mut command = Command::new("bash");
                    command.arg("-c").arg(script);
                    command
                }
            },
            Value::Array(items) => {
                let args = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>();
                match (&self.program, args.split_first()) {
                    (Some(program), _) => {
                        let mut command = Command::new(program);
                        command.args(&args);
                        command
                    }
                    (None, Some((program, rest))) => {
                        let mut command = Command::new(program);
                        command.args(rest);
                        command
                    }
                    (None, None) => return Err(TaskError::failed("command array is empty")),
                }
            }
            Value::Null if self.program.is_some() => {
                Command::new(self.program.as_deref().unwrap_or_default())
            }
            other => {
                return Err(TaskError::failed(format!(
                    "command must be a string or an array, got {}",
                    other
                )))
            }
        };

        if let Some(env) = payload.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                command.env(key, value);
            }
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }

    async fn run(mut command: Command) -> Result<JobOutput> {
        let mut child = command.spawn().context("Failed to spawn job process")?;

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let stderr = child.stderr.take().context("Failed to get stderr")?;

        let stdout_task = tokio::spawn(collect_lines(stdout, "stdout"));
        let stderr_task = tokio::spawn(collect_lines(stderr, "stderr"));

        let status = child.wait().await.context("Failed to wait for job process")?;

        Ok(JobOutput {
            exit_code: status.code(),
            stdout: stdout_task.await.unwrap_or_default(),
            stderr: stderr_task.await.unwrap_or_default(),
        })
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{}: {}", stream, line);
        if !collected.is_empty() {
            collected.push('\n');
        }
        collected.push_str(&line);
    }
    collected
}

/// Structured stdout when the job printed JSON, raw text otherwise
fn parse_stdout(stdout: &str) -> Value {
    serde_json::from_str(stdout.trim()).unwrap_or_else(|_| Value::String(stdout.to_string()))
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn invoke(&self, input: TaskInput) -> Result<Value, TaskError> {
        let command = self.build_command(&input.payload)?;
        debug!(
            execution_id = %input.execution_id,
            state = %input.state_name,
            attempt = input.attempt,
            "Running job {:?}",
            command.as_std()
        );

        let output = Self::run(command).await?;
        match output.exit_code {
            Some(0) => Ok(json!({
                "exit_code": 0,
                "stdout": parse_stdout(&output.stdout),
                "stderr": output.stderr,
            })),
            code => Err(TaskError::failed(format!(
                "job exited with code {}{}",
                code.map(|c| c.to_string())
                    .unwrap_or_else(|| "none (killed by signal)".to_string()),
                if output.stderr.is_empty() {
                    String::new()
                } else {
                    format!(": {}", output.stderr)
                }
            ))),
        }
    }

    async fn invoke_async(&self, input: TaskInput, token: String) -> Result<(), TaskError> {
        let mut command = self.build_command(&input.payload)?;
        command.env(TASK_TOKEN_ENV, &token);
        if let Some(url) = &self.callback_url {
            command.env(CALLBACK_URL_ENV, url);
        }

        let execution_id = input.execution_id;
        let state = input.state_name.clone();
        info!(%execution_id, state = %state, "Dispatching callback job");

        tokio::spawn(async move {
            match Self::run(command).await {
                Ok(output) if output.exit_code == Some(0) => {
                    debug!(%execution_id, state = %state, "Callback job exited cleanly")
                }
                Ok(output) => warn!(
                    %execution_id,
                    state = %state,
                    exit_code = ?output.exit_code,
                    "Callback job exited with failure; waiting for completion or timeout"
                ),
                Err(e) => warn!(%execution_id, state = %state, "Callback job failed to run: {:#}", e),
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::execution::BranchPath;
    use uuid::Uuid;

    fn input(payload: Value) -> TaskInput {
        TaskInput {
            execution_id: Uuid::new_v4(),
            state_name: "Job".to_string(),
            branch: BranchPath::root(),
            resource: "command".to_string(),
            payload,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_shell_command_success() {
        let executor = CommandExecutor::new();
        let result = executor
            .invoke(input(json!({"command": "echo '{\"n\": 3}'"})))
            .await
            .unwrap();
        assert_eq!(result["exit_code"], json!(0));
        assert_eq!(result["stdout"], json!({"n": 3}));
    }

    #[tokio::test]
    async fn test_array_command_with_env() {
        let executor = CommandExecutor::new();
        let result = executor
            .invoke(input(json!({
                "command": ["bash", "-c", "echo $GREETING"],
                "env": {"GREETING": "hello"}
            })))
            .await
            .unwrap();
        assert_eq!(result["stdout"], json!("hello"));
    }

    #[tokio::test]
    async fn test_program_with_override_args() {
        let executor = CommandExecutor::with_program("echo");
        let result = executor
            .invoke(input(json!({"command": ["-n", "overridden"]})))
            .await
            .unwrap();
        assert_eq!(result["stdout"], json!("overridden"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_task_failure() {
        let executor = CommandExecutor::new();
        let err = executor
            .invoke(input(json!({"command": "echo broken >&2; exit 3"})))
            .await
            .unwrap_err();
        assert_eq!(err.error, "TaskFailed");
        assert!(err.cause.contains("code 3"));
        assert!(err.cause.contains("broken"));
    }

    #[tokio::test]
    async fn test_rejects_bad_command_shape() {
        let executor = CommandExecutor::new();
        assert!(executor.invoke(input(json!({"command": 42}))).await.is_err());
        assert!(executor.invoke(input(json!({"command": []}))).await.is_err());
    }

    #[tokio::test]
    async fn test_callback_job_sees_token() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("token.txt");
        let executor = CommandExecutor::new();
        executor
            .invoke_async(
                input(json!({"command": format!("echo -n $TASK_TOKEN > {}", marker.display())})),
                "tok-123".to_string(),
            )
            .await
            .unwrap();

        for _ in 0..50 {
            if let Ok(content) = std::fs::read_to_string(&marker) {
                if content == "tok-123" {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("callback job never wrote the token");
    }
}
