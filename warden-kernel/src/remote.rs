//! Typed node boundary.
//!
//! [`NodeControl`] is everything the engine is allowed to ask of a node. The
//! production implementation, [`ShellControl`], renders each request as a
//! small POSIX shell script, runs it through a [`RemoteExecutor`] and parses
//! the output back into structured evidence.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::archive::{self, ConfigTree};
use crate::config::{ProgramProfile, Timeouts};
use crate::error::RemoteError;
use crate::executor::{CommandOutput, RemoteCommand, RemoteExecutor, TransportError};
use crate::models::{Node, ResourceMetrics};

/// Marker printed when a file or directory does not exist. Not valid base64.
const ABSENT: &str = "__absent__";

/// Non-interactive shells miss the usual npm / pipx install prefixes.
const PATH_PREAMBLE: &str = r#"export PATH="$HOME/.npm-global/bin:$HOME/.local/bin:/usr/local/bin:$PATH""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Active,
    Activating,
    Inactive,
    Failed,
    Unknown,
}

impl ServiceState {
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "active" | "reloading" => ServiceState::Active,
            "activating" => ServiceState::Activating,
            "inactive" | "deactivating" => ServiceState::Inactive,
            "failed" => ServiceState::Failed,
            _ => ServiceState::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ServiceState::Active)
    }
}

/// Outcome of one best-effort disk cleanup command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub command: String,
    pub ok: bool,
    pub detail: String,
}

#[async_trait]
pub trait NodeControl: Send + Sync {
    /// Fails with [`RemoteError::Transport`] when the node cannot be reached.
    async fn ping(&self, node: &Node) -> Result<(), RemoteError>;
    async fn program_present(&self, node: &Node) -> Result<bool, RemoteError>;
    async fn program_version(&self, node: &Node) -> Result<Option<String>, RemoteError>;
    async fn service_state(&self, node: &Node) -> Result<ServiceState, RemoteError>;
    async fn port_bound(&self, node: &Node) -> Result<bool, RemoteError>;
    async fn resources(&self, node: &Node) -> Result<ResourceMetrics, RemoteError>;
    async fn recent_service_logs(&self, node: &Node) -> Result<String, RemoteError>;
    /// Main configuration file, `None` when it does not exist.
    async fn read_config_file(&self, node: &Node) -> Result<Option<Vec<u8>>, RemoteError>;
    /// Whole configuration directory; empty when the directory is missing.
    async fn read_config_tree(&self, node: &Node) -> Result<ConfigTree, RemoteError>;
    /// Replaces the configuration directory in one swap.
    async fn write_config_tree(&self, node: &Node, tree: &ConfigTree) -> Result<(), RemoteError>;
    async fn fix_permissions(&self, node: &Node) -> Result<(), RemoteError>;
    async fn stop_service(&self, node: &Node) -> Result<(), RemoteError>;
    async fn start_service(&self, node: &Node) -> Result<(), RemoteError>;
    /// `force` also reloads unit files and clears a failed state first.
    async fn restart_service(&self, node: &Node, force: bool) -> Result<(), RemoteError>;
    async fn reinstall_program(&self, node: &Node) -> Result<(), RemoteError>;
    async fn free_disk_space(&self, node: &Node) -> Result<Vec<CleanupOutcome>, RemoteError>;
}

pub struct ShellControl<E> {
    executor: E,
    program: ProgramProfile,
    timeouts: Timeouts,
}

impl<E: RemoteExecutor> ShellControl<E> {
    pub fn new(executor: E, program: ProgramProfile, timeouts: Timeouts) -> Self {
        Self {
            executor,
            program,
            timeouts,
        }
    }

    async fn exec(&self, node: &Node, command: RemoteCommand) -> Result<CommandOutput, RemoteError> {
        let script = command.script.clone();
        match self.executor.execute(&node.host, &command).await {
            Ok(output) => {
                debug!("{}: `{}` -> {} ({}ms)", node.id, first_line(&script), output.exit_code, output.execution_time_ms);
                Ok(output)
            }
            Err(TransportError::Timeout(after)) => Err(RemoteError::Transport(format!("`{}` timed out after {:?}", first_line(&script), after))),
            Err(e) => Err(RemoteError::Transport(e.to_string())),
        }
    }

    async fn run(&self, node: &Node, script: String, timeout: Duration) -> Result<CommandOutput, RemoteError> {
        self.exec(node, RemoteCommand::new(script, timeout)).await
    }

    /// Like [`Self::run`] but a non-zero exit is an error.
    async fn run_checked(&self, node: &Node, script: String, timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let output = self.run(node, script.clone(), timeout).await?;
        check_exit(&script, output)
    }

    fn systemctl(&self) -> String {
        if self.program.user_service {
            r#"XDG_RUNTIME_DIR="/run/user/$(id -u)" systemctl --user"#.to_string()
        } else {
            "sudo -n systemctl".to_string()
        }
    }

    fn journalctl(&self) -> String {
        if self.program.user_service {
            "journalctl --user".to_string()
        } else {
            "sudo -n journalctl".to_string()
        }
    }

    fn service(&self) -> String {
        shell_words::quote(&self.program.service).into_owned()
    }

    fn config_dir(&self) -> String {
        remote_path(&self.program.config_dir)
    }

    fn config_file(&self) -> String {
        remote_path(&join_remote(&self.program.config_dir, &self.program.config_file))
    }
}

#[async_trait]
impl<E: RemoteExecutor> NodeControl for ShellControl<E> {
    async fn ping(&self, node: &Node) -> Result<(), RemoteError> {
        let output = self.run(node, "echo warden-ok".to_string(), self.timeouts.probe()).await?;
        if output.stdout.contains("warden-ok") {
            Ok(())
        } else {
            Err(RemoteError::Transport(format!("no echo from {}: {}", node.host.destination(), output.stderr.trim())))
        }
    }

    async fn program_present(&self, node: &Node) -> Result<bool, RemoteError> {
        let script = format!(
            "{PATH_PREAMBLE}; command -v {} >/dev/null 2>&1 && echo present || echo absent",
            shell_words::quote(&self.program.binary)
        );
        let output = self.run_checked(node, script, self.timeouts.probe()).await?;
        Ok(output.stdout.trim() == "present")
    }

    async fn program_version(&self, node: &Node) -> Result<Option<String>, RemoteError> {
        let script = format!(
            "{PATH_PREAMBLE}; {} --version 2>/dev/null | head -n1; true",
            shell_words::quote(&self.program.binary)
        );
        let output = self.run(node, script, self.timeouts.probe()).await?;
        let version = output.stdout.trim();
        Ok((!version.is_empty()).then(|| version.to_string()))
    }

    async fn service_state(&self, node: &Node) -> Result<ServiceState, RemoteError> {
        // is-active exits non-zero for anything but "active"; the text is what matters.
        let script = format!("{} is-active {} 2>/dev/null; true", self.systemctl(), self.service());
        let output = self.run(node, script, self.timeouts.probe()).await?;
        Ok(ServiceState::parse(output.stdout.lines().next().unwrap_or_default()))
    }

    async fn port_bound(&self, node: &Node) -> Result<bool, RemoteError> {
        let script = format!(
            "ss -ltnH 'sport = :{}' 2>/dev/null | grep -q . && echo bound || echo free",
            self.program.listen_port
        );
        let output = self.run_checked(node, script, self.timeouts.probe()).await?;
        Ok(output.stdout.trim() == "bound")
    }

    async fn resources(&self, node: &Node) -> Result<ResourceMetrics, RemoteError> {
        let script = concat!(
            "echo cpu=$(vmstat 1 2 | tail -n1 | awk '{print 100 - $15}'); ",
            "echo mem=$(free | awk '/^Mem:/ {printf \"%.1f\", $3 / $2 * 100}'); ",
            "echo disk=$(df -P \"$HOME\" | awk 'NR==2 {gsub(\"%\", \"\", $5); print $5}')"
        );
        let output = self.run_checked(node, script.to_string(), self.timeouts.probe()).await?;
        parse_resources(&output.stdout)
    }

    async fn recent_service_logs(&self, node: &Node) -> Result<String, RemoteError> {
        let script = format!(
            "{} -u {} --since '{} min ago' -n 50 --no-pager 2>&1; true",
            self.journalctl(),
            self.service(),
            self.program.log_window_minutes
        );
        let output = self.run(node, script, self.timeouts.probe()).await?;
        Ok(output.stdout)
    }

    async fn read_config_file(&self, node: &Node) -> Result<Option<Vec<u8>>, RemoteError> {
        let script = format!(
            "f={}; if [ -f \"$f\" ]; then base64 -w0 < \"$f\"; else echo {ABSENT}; fi",
            self.config_file()
        );
        let output = self.run_checked(node, script, self.timeouts.probe()).await?;
        decode_payload(&output.stdout)
    }

    async fn read_config_tree(&self, node: &Node) -> Result<ConfigTree, RemoteError> {
        let script = format!(
            "d={}; if [ -d \"$d\" ]; then cd \"$d\" && tar -czhf - . | base64 -w0; else echo {ABSENT}; fi",
            self.config_dir()
        );
        let output = self.run_checked(node, script, self.timeouts.transfer()).await?;
        match decode_payload(&output.stdout)? {
            Some(bytes) => archive::unpack(&bytes).map_err(|e| RemoteError::Malformed(e.to_string())),
            None => Ok(ConfigTree::new()),
        }
    }

    async fn write_config_tree(&self, node: &Node, tree: &ConfigTree) -> Result<(), RemoteError> {
        let payload = archive::pack(tree).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        // Extract into a staging directory, then swap, so a half-written tree never becomes live.
        let script = format!(
            concat!(
                "set -e; d={}; new=\"$d.warden-new\"; old=\"$d.warden-old\"; ",
                "rm -rf \"$new\" \"$old\"; mkdir -p \"$new\"; ",
                "tar -xzf - -C \"$new\"; ",
                "if [ -d \"$d\" ]; then mv \"$d\" \"$old\"; fi; ",
                "mv \"$new\" \"$d\"; rm -rf \"$old\""
            ),
            self.config_dir()
        );
        let command = RemoteCommand::new(script.clone(), self.timeouts.transfer()).with_stdin(payload);
        let output = self.exec(node, command).await?;
        check_exit(&script, output).map(|_| ())
    }

    async fn fix_permissions(&self, node: &Node) -> Result<(), RemoteError> {
        let mut script = format!("d={}; chmod 700 \"$d\"", self.config_dir());
        for file in &self.program.private_files {
            let quoted = shell_words::quote(file);
            script.push_str(&format!("; if [ -f \"$d\"/{quoted} ]; then chmod 600 \"$d\"/{quoted}; fi"));
        }
        self.run_checked(node, script, self.timeouts.command()).await.map(|_| ())
    }

    async fn stop_service(&self, node: &Node) -> Result<(), RemoteError> {
        let script = format!("{} stop {}", self.systemctl(), self.service());
        self.run_checked(node, script, self.timeouts.command()).await.map(|_| ())
    }

    async fn start_service(&self, node: &Node) -> Result<(), RemoteError> {
        let script = format!("{} start {}", self.systemctl(), self.service());
        self.run_checked(node, script, self.timeouts.command()).await.map(|_| ())
    }

    async fn restart_service(&self, node: &Node, force: bool) -> Result<(), RemoteError> {
        let systemctl = self.systemctl();
        let service = self.service();
        let script = if force {
            format!("{systemctl} daemon-reload; {systemctl} reset-failed {service} 2>/dev/null; {systemctl} restart {service}")
        } else {
            format!("{systemctl} restart {service}")
        };
        self.run_checked(node, script, self.timeouts.command()).await.map(|_| ())
    }

    async fn reinstall_program(&self, node: &Node) -> Result<(), RemoteError> {
        let script = format!("{PATH_PREAMBLE}; {}", self.program.install_command);
        self.run_checked(node, script, self.timeouts.transfer()).await.map(|_| ())
    }

    async fn free_disk_space(&self, node: &Node) -> Result<Vec<CleanupOutcome>, RemoteError> {
        let mut outcomes = Vec::with_capacity(self.program.cleanup_commands.len());
        for command in &self.program.cleanup_commands {
            let output = self.run(node, command.clone(), self.timeouts.command()).await?;
            if !output.success() {
                warn!("{}: cleanup `{}` exited with {}", node.id, command, output.exit_code);
            }
            outcomes.push(CleanupOutcome {
                command: command.clone(),
                ok: output.success(),
                detail: if output.success() { output.stdout.trim().to_string() } else { output.stderr.trim().to_string() },
            });
        }
        Ok(outcomes)
    }
}

fn check_exit(script: &str, output: CommandOutput) -> Result<CommandOutput, RemoteError> {
    if output.success() {
        Ok(output)
    } else {
        Err(RemoteError::Command {
            command: first_line(script).to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

fn first_line(script: &str) -> &str {
    let line = script.lines().next().unwrap_or_default();
    match line.char_indices().nth(80) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Quotes a node-side path, leaving a leading `~/` for the node's shell to expand.
pub fn remote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) if rest.is_empty() => "\"$HOME\"".to_string(),
        Some(rest) => format!("\"$HOME\"/{}", shell_words::quote(rest)),
        None if path == "~" => "\"$HOME\"".to_string(),
        None => shell_words::quote(path).into_owned(),
    }
}

fn join_remote(dir: &str, file: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), file.trim_start_matches('/'))
}

fn decode_payload(stdout: &str) -> Result<Option<Vec<u8>>, RemoteError> {
    let text = stdout.trim();
    if text == ABSENT {
        return Ok(None);
    }
    STANDARD
        .decode(text)
        .map(Some)
        .map_err(|e| RemoteError::Malformed(format!("invalid base64 payload: {e}")))
}

/// Parses `cpu=`, `mem=` and `disk=` lines. Missing values read as 0.
pub fn parse_resources(text: &str) -> Result<ResourceMetrics, RemoteError> {
    let mut metrics = ResourceMetrics::default();
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let parsed: f32 = value
            .parse()
            .map_err(|_| RemoteError::Malformed(format!("bad {key} value '{value}'")))?;
        match key {
            "cpu" => metrics.cpu_percent = parsed,
            "mem" => metrics.memory_percent = parsed,
            "disk" => metrics.disk_percent = parsed,
            _ => {}
        }
    }
    Ok(metrics)
}
