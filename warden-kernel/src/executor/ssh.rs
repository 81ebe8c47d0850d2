use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use super::{run_process, CommandOutput, RemoteCommand, RemoteExecutor, TransportError};
use crate::models::HostRef;

/// `ssh` exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Path of the ssh client binary.
    pub binary: String,
    pub connect_timeout_secs: u64,
    /// Extra options, e.g. `["-i", "/etc/warden/id_ed25519"]`.
    pub extra_args: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout_secs: 10,
            extra_args: Vec::new(),
        }
    }
}

/// Runs commands through the system ssh client. Key material, agent
/// forwarding and host keys are whatever the controller's ssh config says.
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    settings: SshSettings,
}

impl SshExecutor {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn build_args(&self, host: &HostRef, script: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            "-p".to_string(),
            host.port.to_string(),
        ];
        args.extend(self.settings.extra_args.iter().cloned());
        args.push(host.destination());
        args.push("--".to_string());
        args.push(format!("sh -c {}", shell_words::quote(script)));
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, host: &HostRef, command: &RemoteCommand) -> Result<CommandOutput, TransportError> {
        debug!("ssh {} (timeout: {:?})", host.destination(), command.timeout);

        let mut process = AsyncCommand::new(&self.settings.binary);
        process.args(self.build_args(host, &command.script));

        let output = run_process(process, command).await?;
        if output.exit_code == SSH_CONNECTION_FAILURE {
            return Err(TransportError::Connection(output.stderr.trim().to_string()));
        }
        Ok(output)
    }
}
