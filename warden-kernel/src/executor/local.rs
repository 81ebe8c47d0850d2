use async_trait::async_trait;
use tokio::process::Command as AsyncCommand;

use super::{run_process, CommandOutput, RemoteCommand, RemoteExecutor, TransportError};
use crate::models::HostRef;

/// Runs scripts with `sh -c` on the controller host, ignoring the host reference.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(&self, _host: &HostRef, command: &RemoteCommand) -> Result<CommandOutput, TransportError> {
        let mut process = AsyncCommand::new("sh");
        process.arg("-c").arg(&command.script);
        run_process(process, command).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn localhost() -> HostRef {
        HostRef::new("localhost", "warden")
    }

    #[tokio::test]
    async fn test_shell_command_execution() {
        let command = RemoteCommand::new("echo 'Hello World'; exit 3", Duration::from_secs(5));
        let output = LocalExecutor.execute(&localhost(), &command).await.unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(output.stdout.contains("Hello World"));
    }

    #[tokio::test]
    async fn test_stdin_payload_is_piped() {
        let command = RemoteCommand::new("wc -c", Duration::from_secs(5)).with_stdin(vec![b'x'; 4096]);
        let output = LocalExecutor.execute(&localhost(), &command).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "4096");
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let command = RemoteCommand::new("sleep 10", Duration::from_millis(200));
        let err = LocalExecutor.execute(&localhost(), &command).await.unwrap_err();

        assert!(matches!(err, TransportError::Timeout(_)));
    }
}
