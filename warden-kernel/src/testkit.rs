//! In-memory doubles for the node boundary.
//!
//! [`FakeFleet`] implements [`NodeControl`] over simulated nodes whose service
//! only comes up when the program is installed and its main config parses.
//! [`ScriptedExecutor`] implements [`RemoteExecutor`] with canned responses,
//! for exercising [`crate::remote::ShellControl`] without a network.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::archive::ConfigTree;
use crate::error::RemoteError;
use crate::executor::{CommandOutput, RemoteCommand, RemoteExecutor, TransportError};
use crate::models::{HostRef, Node, ResourceMetrics};
use crate::remote::{CleanupOutcome, NodeControl, ServiceState};
use crate::state::{new_state, Shared};

const MUTATING_CALLS: &[&str] = &[
    "write_config_tree",
    "fix_permissions",
    "stop_service",
    "start_service",
    "restart_service",
    "reinstall_program",
    "free_disk_space",
];

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub reachable: bool,
    pub program_installed: bool,
    pub version: String,
    pub service: ServiceState,
    /// The service crashes on every start regardless of configuration.
    pub start_blocked: bool,
    pub metrics: ResourceMetrics,
    pub logs: String,
    pub tree: ConfigTree,
}

impl FakeNode {
    /// Installed, running, with a valid `openclaw.json`.
    pub fn healthy() -> Self {
        Self {
            reachable: true,
            program_installed: true,
            version: "2026.2.1".to_string(),
            service: ServiceState::Active,
            start_blocked: false,
            metrics: ResourceMetrics {
                cpu_percent: 12.0,
                memory_percent: 41.0,
                disk_percent: 55.0,
            },
            logs: String::new(),
            tree: ConfigTree::new()
                .with_file("openclaw.json", br#"{"gateway":{"port":18789,"mode":"local"}}"#.to_vec())
                .with_file("auth-profiles.json", br#"{"profiles":{}}"#.to_vec()),
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn without_program(mut self) -> Self {
        self.program_installed = false;
        self.service = ServiceState::Failed;
        self
    }

    pub fn with_service(mut self, service: ServiceState) -> Self {
        self.service = service;
        self
    }

    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }

    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.tree.insert(path, contents);
        self
    }

    pub fn with_tree(mut self, tree: ConfigTree) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_disk(mut self, percent: f32) -> Self {
        self.metrics.disk_percent = percent;
        self
    }

    pub fn start_blocked(mut self) -> Self {
        self.start_blocked = true;
        self
    }
}

#[derive(Default)]
struct FleetState {
    nodes: HashMap<String, FakeNode>,
    calls: HashMap<String, Vec<String>>,
    failures: HashMap<(String, String), RemoteError>,
}

#[derive(Clone)]
pub struct FakeFleet {
    config_file: String,
    state: Shared<FleetState>,
}

impl FakeFleet {
    pub fn new(config_file: impl Into<String>) -> Self {
        Self {
            config_file: config_file.into(),
            state: new_state(FleetState::default()),
        }
    }

    pub fn add_node(&self, node_id: &str, node: FakeNode) {
        self.state.lock().nodes.insert(node_id.to_string(), node);
    }

    pub fn update_node(&self, node_id: &str, update: impl FnOnce(&mut FakeNode)) {
        if let Some(node) = self.state.lock().nodes.get_mut(node_id) {
            update(node);
        }
    }

    pub fn node(&self, node_id: &str) -> Option<FakeNode> {
        self.state.lock().nodes.get(node_id).cloned()
    }

    pub fn tree(&self, node_id: &str) -> ConfigTree {
        self.node(node_id).map(|n| n.tree).unwrap_or_default()
    }

    /// Every call made against a node, in order.
    pub fn calls(&self, node_id: &str) -> Vec<String> {
        self.state.lock().calls.get(node_id).cloned().unwrap_or_default()
    }

    /// Calls that change something on the node.
    pub fn mutations(&self, node_id: &str) -> Vec<String> {
        self.calls(node_id)
            .into_iter()
            .filter(|c| MUTATING_CALLS.contains(&c.as_str()))
            .collect()
    }

    pub fn clear_calls(&self, node_id: &str) {
        self.state.lock().calls.remove(node_id);
    }

    /// The next `operation` call on the node fails with `error`.
    pub fn fail_next(&self, node_id: &str, operation: &str, error: RemoteError) {
        self.state
            .lock()
            .failures
            .insert((node_id.to_string(), operation.to_string()), error);
    }

    fn with_node<T>(&self, node: &Node, operation: &str, f: impl FnOnce(&mut FakeNode) -> T) -> Result<T, RemoteError> {
        let mut state = self.state.lock();
        state.calls.entry(node.id.clone()).or_default().push(operation.to_string());
        if let Some(error) = state.failures.remove(&(node.id.clone(), operation.to_string())) {
            return Err(error);
        }
        let fake = state
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| RemoteError::Transport(format!("no route to {}", node.host.host)))?;
        if !fake.reachable {
            return Err(RemoteError::Transport(format!("ssh: connect to host {} port 22: No route to host", node.host.host)));
        }
        Ok(f(fake))
    }

    fn start(config_file: &str, fake: &mut FakeNode) {
        let config_ok = fake
            .tree
            .get(config_file)
            .map(|f| serde_json::from_slice::<serde_json::Value>(&f.contents).is_ok())
            .unwrap_or(false);
        if !fake.program_installed {
            fake.service = ServiceState::Failed;
            fake.logs = "openclaw-gateway.service: Main process exited, code=exited, status=203/EXEC".to_string();
        } else if !config_ok {
            fake.service = ServiceState::Failed;
            fake.logs = format!("SyntaxError: Unexpected end of JSON input while reading {config_file}");
        } else if fake.start_blocked {
            fake.service = ServiceState::Failed;
            fake.logs = "Main process exited, code=killed, status=11/SEGV".to_string();
        } else {
            fake.service = ServiceState::Active;
        }
    }
}

#[async_trait]
impl NodeControl for FakeFleet {
    async fn ping(&self, node: &Node) -> Result<(), RemoteError> {
        self.with_node(node, "ping", |_| ())
    }

    async fn program_present(&self, node: &Node) -> Result<bool, RemoteError> {
        self.with_node(node, "program_present", |n| n.program_installed)
    }

    async fn program_version(&self, node: &Node) -> Result<Option<String>, RemoteError> {
        self.with_node(node, "program_version", |n| n.program_installed.then(|| n.version.clone()))
    }

    async fn service_state(&self, node: &Node) -> Result<ServiceState, RemoteError> {
        self.with_node(node, "service_state", |n| n.service)
    }

    async fn port_bound(&self, node: &Node) -> Result<bool, RemoteError> {
        self.with_node(node, "port_bound", |n| n.service.is_active())
    }

    async fn resources(&self, node: &Node) -> Result<ResourceMetrics, RemoteError> {
        self.with_node(node, "resources", |n| n.metrics)
    }

    async fn recent_service_logs(&self, node: &Node) -> Result<String, RemoteError> {
        self.with_node(node, "recent_service_logs", |n| n.logs.clone())
    }

    async fn read_config_file(&self, node: &Node) -> Result<Option<Vec<u8>>, RemoteError> {
        let config_file = self.config_file.clone();
        self.with_node(node, "read_config_file", |n| n.tree.get(&config_file).map(|f| f.contents.clone()))
    }

    async fn read_config_tree(&self, node: &Node) -> Result<ConfigTree, RemoteError> {
        self.with_node(node, "read_config_tree", |n| n.tree.clone())
    }

    async fn write_config_tree(&self, node: &Node, tree: &ConfigTree) -> Result<(), RemoteError> {
        self.with_node(node, "write_config_tree", |n| n.tree = tree.clone())
    }

    async fn fix_permissions(&self, node: &Node) -> Result<(), RemoteError> {
        self.with_node(node, "fix_permissions", |_| ())
    }

    async fn stop_service(&self, node: &Node) -> Result<(), RemoteError> {
        self.with_node(node, "stop_service", |n| n.service = ServiceState::Inactive)
    }

    async fn start_service(&self, node: &Node) -> Result<(), RemoteError> {
        let config_file = self.config_file.clone();
        self.with_node(node, "start_service", |n| Self::start(&config_file, n))
    }

    async fn restart_service(&self, node: &Node, _force: bool) -> Result<(), RemoteError> {
        let config_file = self.config_file.clone();
        self.with_node(node, "restart_service", |n| Self::start(&config_file, n))
    }

    async fn reinstall_program(&self, node: &Node) -> Result<(), RemoteError> {
        self.with_node(node, "reinstall_program", |n| n.program_installed = true)
    }

    async fn free_disk_space(&self, node: &Node) -> Result<Vec<CleanupOutcome>, RemoteError> {
        self.with_node(node, "free_disk_space", |n| {
            n.metrics.disk_percent = n.metrics.disk_percent.min(40.0);
            vec![CleanupOutcome {
                command: "journalctl --user --vacuum-size=100M".to_string(),
                ok: true,
                detail: "Vacuuming done".to_string(),
            }]
        })
    }
}

struct Rule {
    pattern: String,
    response: Result<CommandOutput, TransportError>,
}

#[derive(Default)]
struct ScriptState {
    rules: Vec<Rule>,
    calls: Vec<String>,
    stdins: Vec<Option<Vec<u8>>>,
    unreachable: bool,
}

/// Answers commands by substring match; the most recently added rule wins.
/// Unmatched commands succeed with empty output.
#[derive(Clone)]
pub struct ScriptedExecutor {
    state: Shared<ScriptState>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        execution_time_ms: 1,
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        let executor = Self {
            state: new_state(ScriptState::default()),
        };
        executor.on("echo warden-ok", 0, "warden-ok\n")
    }

    pub fn on(self, pattern: &str, exit_code: i32, stdout: &str) -> Self {
        self.push(pattern, Ok(output(exit_code, stdout, "")))
    }

    pub fn on_failure(self, pattern: &str, exit_code: i32, stderr: &str) -> Self {
        self.push(pattern, Ok(output(exit_code, "", stderr)))
    }

    pub fn on_transport_error(self, pattern: &str, error: TransportError) -> Self {
        self.push(pattern, Err(error))
    }

    /// Every command fails at the transport level.
    pub fn unreachable(self) -> Self {
        self.state.lock().unreachable = true;
        self
    }

    fn push(self, pattern: &str, response: Result<CommandOutput, TransportError>) -> Self {
        self.state.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            response,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn last_stdin(&self) -> Option<Vec<u8>> {
        self.state.lock().stdins.iter().rev().flatten().next().cloned()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, host: &HostRef, command: &RemoteCommand) -> Result<CommandOutput, TransportError> {
        let mut state = self.state.lock();
        state.calls.push(command.script.clone());
        state.stdins.push(command.stdin.clone());
        if state.unreachable {
            return Err(TransportError::Connection(format!("ssh: connect to host {} port {}: Connection refused", host.host, host.port)));
        }
        state
            .rules
            .iter()
            .rev()
            .find(|rule| command.script.contains(&rule.pattern))
            .map(|rule| rule.response.clone())
            .unwrap_or_else(|| Ok(output(0, "", "")))
    }
}
