//! Remote command execution contract.
//!
//! The engine never talks to a transport directly: it is handed an
//! implementation of [`RemoteExecutor`] that runs one command on one node and
//! reports exit code and output, or a transport failure. Each call carries
//! its own timeout.
//!
//! Implementations:
//! - [`SshExecutor`]: the system `ssh` client in batch mode
//! - [`LocalExecutor`]: `sh -c` on the controller itself (co-located nodes)

mod local;
mod ssh;

pub use local::LocalExecutor;
pub use ssh::{SshExecutor, SshSettings};

use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::models::HostRef;

/// One shell script to run on a node.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub script: String,
    /// Payload piped to the script's stdin (archive uploads).
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl RemoteCommand {
    pub fn new(script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            script: script.into(),
            stdin: None,
            timeout,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Command execution result
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("failed to spawn transport: {0}")]
    Spawn(String),
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, host: &HostRef, command: &RemoteCommand) -> Result<CommandOutput, TransportError>;
}

/// Runs a prepared process with the command's stdin payload and timeout.
/// The child is killed if the timeout fires.
pub(crate) async fn run_process(mut process: AsyncCommand, command: &RemoteCommand) -> Result<CommandOutput, TransportError> {
    let start_time = Instant::now();

    process
        .stdin(if command.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = process.spawn().map_err(|e| TransportError::Spawn(e.to_string()))?;

    if let Some(payload) = &command.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let payload = payload.clone();
            // Written from a separate task so a large payload cannot deadlock
            // against a child that fills its stdout pipe first.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("stdin write interrupted: {}", e);
                }
            });
        }
    }

    let output = tokio::time::timeout(command.timeout, child.wait_with_output())
        .await
        .map_err(|_| TransportError::Timeout(command.timeout))?
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        execution_time_ms: start_time.elapsed().as_millis(),
    })
}
