//! Subprocess transport for CLI-driven providers.
//!
//! A connector runs shell commands on the host; the caller decides what
//! commands to run. The Modal adapter drives its vendor tooling through one.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::error::{DriverResult, SandboxError};
use crate::types::{ChunkStream, ProcessChunk};

/// Result from a command execution on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Trait for connectors that run shell commands.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run a command and return the buffered result.
    async fn run(&self, command: &str) -> DriverResult<ShellResult>;

    /// Run a command and stream its output.
    async fn run_stream(&self, command: &str) -> DriverResult<ChunkStream>;

    fn name(&self) -> &str;
}

/// A connector that shells out with `sh -c`.
pub struct ShellConnector {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: std::time::Duration,
}

impl ShellConnector {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            env: Vec::new(),
            timeout: std::time::Duration::from_secs(600),
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", command]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

impl Default for ShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for ShellConnector {
    async fn run(&self, command: &str) -> DriverResult<ShellResult> {
        debug!(command, "running host command");

        let output = tokio::time::timeout(self.timeout, self.command(command).output())
            .await
            .map_err(|_| {
                SandboxError::timeout(format!(
                    "command did not finish within {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| SandboxError::network(format!("failed to run command: {e}")))?;

        Ok(ShellResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_stream(&self, command: &str) -> DriverResult<ChunkStream> {
        debug!(command, "streaming host command");

        let mut child = self
            .command(command)
            .spawn()
            .map_err(|e| SandboxError::network(format!("failed to spawn: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::provider("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::provider("failed to capture stderr"))?;

        let stdout_stream = tokio_stream::wrappers::LinesStream::new(
            BufReader::new(stdout).lines(),
        )
        .map(|line| ProcessChunk::stdout(format!("{}\n", line.unwrap_or_default()).into_bytes()));

        let stderr_stream = tokio_stream::wrappers::LinesStream::new(
            BufReader::new(stderr).lines(),
        )
        .map(|line| ProcessChunk::stderr(format!("{}\n", line.unwrap_or_default()).into_bytes()));

        let combined = futures::stream::select(stdout_stream, stderr_stream);

        Ok(Box::pin(combined))
    }

    fn name(&self) -> &str {
        "shell"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkChannel;

    #[tokio::test]
    async fn run_captures_exit_code_and_output() {
        let connector = ShellConnector::new();
        let result = connector.run("echo out; echo err 1>&2; exit 3").await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[tokio::test]
    async fn run_times_out() {
        let connector =
            ShellConnector::new().with_timeout(std::time::Duration::from_millis(100));
        let err = connector.run("sleep 5").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn stream_tags_channels() {
        use futures::StreamExt;

        let connector = ShellConnector::new();
        let mut stream = connector.run_stream("echo out; echo err 1>&2").await.unwrap();
        let mut saw_out = false;
        let mut saw_err = false;
        while let Some(chunk) = stream.next().await {
            match chunk.channel {
                ChunkChannel::Stdout => saw_out = true,
                ChunkChannel::Stderr => saw_err = true,
            }
        }
        assert!(saw_out && saw_err);
    }

    #[tokio::test]
    async fn env_is_injected() {
        let connector = ShellConnector::new().with_env("CONNECTOR_PROBE", "42");
        let result = connector.run("printenv CONNECTOR_PROBE").await.unwrap();
        assert_eq!(result.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn working_dir_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ShellConnector::new().with_working_dir(dir.path().to_path_buf());
        let result = connector.run("pwd").await.unwrap();
        assert_eq!(
            std::fs::canonicalize(result.stdout.trim()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }
}
