//! The LLM capability boundary.
//!
//! Everything that talks to a model goes through [`LlmInvoker`]: given a
//! prompt and a deadline, return the model's textual reply. Implementations:
//!
//! - [`SubprocessInvoker`] — runs an external command, feeding the prompt
//!   on stdin or through a temp file, with a hard per-call timeout.
//! - [`MockInvoker`] — scripted replies for tests; records every prompt.
//!
//! The loop controller's replay mode never needs an invoker at all — it
//! reproduces answers from a recorded trace.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("llm call timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("llm process exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
    #[error("i/o talking to llm process: {0}")]
    Io(#[from] std::io::Error),
    #[error("mock invoker ran out of scripted replies")]
    ScriptExhausted,
}

pub type Result<T> = std::result::Result<T, InvokeError>;

#[async_trait]
pub trait LlmInvoker: Send + Sync {
    /// Send `prompt`, return the model's full reply within `timeout`.
    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<String>;
}

/// How the prompt reaches the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Piped to the child's stdin.
    Stdin,
    /// Written to a temp file whose path is appended to the argv.
    TempFile,
}

/// Invokes an external command per call. The command is expected to print
/// its answer to stdout and exit.
pub struct SubprocessInvoker {
    command: String,
    args: Vec<String>,
    mode: InputMode,
}

impl SubprocessInvoker {
    pub fn new(command: impl Into<String>, args: Vec<String>, mode: InputMode) -> Self {
        Self {
            command: command.into(),
            args,
            mode,
        }
    }
}

#[async_trait]
impl LlmInvoker for SubprocessInvoker {
    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<String> {
        // Temp file lives until the call finishes on every exit path.
        let mut prompt_file = None;
        let mut command = Command::new(&self.command);
        command.args(&self.args);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        // A timed-out child must not outlive the call.
        command.kill_on_drop(true);

        match self.mode {
            InputMode::Stdin => {
                command.stdin(Stdio::piped());
            }
            InputMode::TempFile => {
                let file = tempfile_for_prompt(prompt)?;
                command.arg(file.path());
                command.stdin(Stdio::null());
                prompt_file = Some(file);
            }
        }

        let mut child = command.spawn().map_err(|source| InvokeError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        if self.mode == InputMode::Stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await?;
            }
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                // wait_with_output consumed the child; the timeout branch
                // can only log — the process is reaped by the runtime.
                warn!(command = %self.command, ?timeout, "llm subprocess timed out");
                return Err(InvokeError::Timeout(timeout));
            }
        };
        drop(prompt_file);

        if !output.status.success() {
            return Err(InvokeError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let reply = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(bytes = reply.len(), "llm subprocess replied");
        Ok(reply)
    }
}

fn tempfile_for_prompt(prompt: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    std::io::Write::write_all(&mut file, prompt.as_bytes())?;
    Ok(file)
}

/// Scripted invoker for tests: replies pop in order, prompts are recorded.
#[derive(Default)]
pub struct MockInvoker {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl MockInvoker {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts seen so far, in call order.
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmInvoker for MockInvoker {
    async fn invoke(&self, prompt: &str, _timeout: Duration) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let mut replies = self.replies.lock().map_err(|_| InvokeError::ScriptExhausted)?;
        replies.pop_front().ok_or(InvokeError::ScriptExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_pops_replies_in_order() {
        let mock = MockInvoker::new(vec!["first".to_string(), "second".to_string()]);
        assert_eq!(mock.invoke("p1", DEFAULT_TIMEOUT).await.expect("first"), "first");
        assert_eq!(mock.invoke("p2", DEFAULT_TIMEOUT).await.expect("second"), "second");
        assert!(matches!(
            mock.invoke("p3", DEFAULT_TIMEOUT).await,
            Err(InvokeError::ScriptExhausted)
        ));
        assert_eq!(mock.recorded_prompts(), vec!["p1".to_string(), "p2".to_string(), "p3".to_string()]);
    }

    #[tokio::test]
    async fn subprocess_stdin_round_trip() {
        // `cat` echoes the prompt back.
        let invoker = SubprocessInvoker::new("cat", vec![], InputMode::Stdin);
        let reply = invoker.invoke("hello from stdin", DEFAULT_TIMEOUT).await.expect("cat");
        assert_eq!(reply, "hello from stdin");
    }

    #[tokio::test]
    async fn subprocess_temp_file_round_trip() {
        let invoker = SubprocessInvoker::new("cat", vec![], InputMode::TempFile);
        let reply = invoker
            .invoke("hello from a file", DEFAULT_TIMEOUT)
            .await
            .expect("cat");
        assert_eq!(reply, "hello from a file");
    }

    #[tokio::test]
    async fn subprocess_timeout_is_reported() {
        let invoker = SubprocessInvoker::new("sleep", vec!["5".to_string()], InputMode::Stdin);
        let err = invoker
            .invoke("", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout(_)));
    }

    #[tokio::test]
    async fn missing_command_is_a_spawn_error() {
        let invoker =
            SubprocessInvoker::new("definitely-not-a-real-binary", vec![], InputMode::Stdin);
        let err = invoker.invoke("x", DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, InvokeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let invoker = SubprocessInvoker::new(
            "sh",
            vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()],
            InputMode::Stdin,
        );
        let err = invoker.invoke("", DEFAULT_TIMEOUT).await.unwrap_err();
        match err {
            InvokeError::NonZeroExit { status, stderr } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
