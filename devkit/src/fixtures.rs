/*!
Fake nodes in the states the engine has to tell apart.

Each fixture starts from a healthy node and breaks exactly one thing, so a
scenario can assert on the one failure it is about.
*/

use warden_kernel::archive::ConfigTree;
use warden_kernel::remote::ServiceState;
use warden_kernel::testkit::FakeNode;

pub const CONFIG_FILE: &str = "openclaw.json";

/// Main config with the given gateway port and a private auth profile file.
pub fn config_tree(port: u16) -> ConfigTree {
    let main = serde_json::json!({
        "gateway": { "port": port, "mode": "local", "bind": "loopback" },
        "agents": { "defaults": { "model": "primary" } },
    });
    ConfigTree::new()
        .with_file(CONFIG_FILE, main.to_string().into_bytes())
        .with_file("auth-profiles.json", br#"{"profiles":{"default":{"provider":"local"}}}"#.to_vec())
        .with_file("agents/main/memory.md", b"# notes\n".to_vec())
}

pub fn healthy() -> FakeNode {
    FakeNode::healthy().with_tree(config_tree(18789))
}

/// Service stopped with nothing recognizable in its logs.
pub fn crashed_service() -> FakeNode {
    healthy().with_service(ServiceState::Inactive)
}

/// Main config truncated mid-object; the service refuses to start.
pub fn broken_config() -> FakeNode {
    healthy()
        .with_file(CONFIG_FILE, br#"{"gateway":{"port":18789,"#.to_vec())
        .with_service(ServiceState::Failed)
        .with_logs("SyntaxError: Unexpected end of JSON input")
}

pub fn missing_program() -> FakeNode {
    healthy().without_program()
}

/// Service running, disk above the critical threshold.
pub fn disk_full() -> FakeNode {
    healthy().with_disk(97.0)
}

pub fn permission_denied() -> FakeNode {
    healthy()
        .with_service(ServiceState::Failed)
        .with_logs("Error: EACCES: permission denied, open '/home/openclaw/.openclaw/auth-profiles.json'")
}

/// Crashes on every start whatever its configuration.
pub fn crash_looping() -> FakeNode {
    healthy()
        .with_service(ServiceState::Failed)
        .with_logs("Main process exited, code=killed, status=11/SEGV")
        .start_blocked()
}

pub fn offline() -> FakeNode {
    healthy().unreachable()
}
