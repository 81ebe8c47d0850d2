//! Failure diagnosis.
//!
//! An ordered decision tree over evidence gathered from the node, cheapest
//! and most specific signal first. The first decisive signal wins.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::HealthPolicy;
use crate::error::RemoteError;
use crate::models::Node;
use crate::remote::NodeControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    ProgramMissing,
    ServiceCrash,
    ConfigError,
    PermissionError,
    DiskFull,
    NetworkError,
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::ProgramMissing => "PROGRAM_MISSING",
            FailureType::ServiceCrash => "SERVICE_CRASH",
            FailureType::ConfigError => "CONFIG_ERROR",
            FailureType::PermissionError => "PERMISSION_ERROR",
            FailureType::DiskFull => "DISK_FULL",
            FailureType::NetworkError => "NETWORK_ERROR",
            FailureType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub failure: FailureType,
    pub evidence: Vec<String>,
}

impl Diagnosis {
    fn new(failure: FailureType, evidence: Vec<String>) -> Self {
        Self { failure, evidence }
    }
}

const MISSING_FILE: &[&str] = &["enoent", "no such file", "not found", "cannot find module", "status=203/exec"];
const PERMISSION: &[&str] = &["eacces", "permission denied", "eperm", "operation not permitted"];
const DISK_FULL: &[&str] = &["enospc", "no space left"];
const CONFIG_SYNTAX: &[&str] = &[
    "syntaxerror",
    "parse error",
    "failed to parse",
    "invalid config",
    "unexpected token",
    "unexpected end of json",
];

/// Classifies the recent logs of a service that is not running.
/// Returns the failure and the matching log line, if any.
pub fn classify_service_logs(logs: &str) -> (FailureType, Option<String>) {
    let checks: [(&[&str], FailureType); 4] = [
        (MISSING_FILE, FailureType::ProgramMissing),
        (PERMISSION, FailureType::PermissionError),
        (DISK_FULL, FailureType::DiskFull),
        (CONFIG_SYNTAX, FailureType::ConfigError),
    ];
    for (signatures, failure) in checks {
        if let Some(line) = logs.lines().find(|line| {
            let lower = line.to_lowercase();
            signatures.iter().any(|s| lower.contains(s))
        }) {
            return (failure, Some(line.trim().to_string()));
        }
    }
    (FailureType::ServiceCrash, None)
}

pub struct Diagnoser {
    control: Arc<dyn NodeControl>,
    policy: HealthPolicy,
    config_file: String,
}

impl Diagnoser {
    pub fn new(control: Arc<dyn NodeControl>, policy: HealthPolicy, config_file: impl Into<String>) -> Self {
        Self {
            control,
            policy,
            config_file: config_file.into(),
        }
    }

    pub async fn diagnose(&self, node: &Node) -> Diagnosis {
        let diagnosis = match self.walk(node).await {
            Ok(diagnosis) => diagnosis,
            Err(e) if e.is_transport() => Diagnosis::new(FailureType::NetworkError, vec![e.to_string()]),
            // A node that runs commands but answers nonsense is still classified, just without a signal.
            Err(e) => Diagnosis::new(FailureType::Unknown, vec![format!("diagnosis incomplete: {e}")]),
        };
        info!("{}: diagnosed {} ({})", node.id, diagnosis.failure, diagnosis.evidence.join("; "));
        diagnosis
    }

    async fn walk(&self, node: &Node) -> Result<Diagnosis, RemoteError> {
        let mut evidence = Vec::new();

        self.control.ping(node).await?;

        if !self.control.program_present(node).await? {
            evidence.push("program binary not found".to_string());
            return Ok(Diagnosis::new(FailureType::ProgramMissing, evidence));
        }

        let service = self.control.service_state(node).await?;
        if !service.is_active() {
            evidence.push(format!("service is {service:?}").to_lowercase());
            let logs = self.control.recent_service_logs(node).await?;
            let (failure, line) = classify_service_logs(&logs);
            match line {
                Some(line) => evidence.push(format!("log: {line}")),
                None => evidence.push("no known failure signature in recent logs".to_string()),
            }
            return Ok(Diagnosis::new(failure, evidence));
        }
        debug!("{}: service active, checking configuration", node.id);

        match self.control.read_config_file(node).await? {
            None => {
                evidence.push(format!("{} is missing", self.config_file));
                return Ok(Diagnosis::new(FailureType::ConfigError, evidence));
            }
            Some(bytes) => {
                if let Err(e) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                    evidence.push(format!("{} does not parse: {e}", self.config_file));
                    return Ok(Diagnosis::new(FailureType::ConfigError, evidence));
                }
            }
        }

        let metrics = self.control.resources(node).await?;
        if metrics.disk_percent > self.policy.disk_critical_percent {
            evidence.push(format!(
                "disk usage {:.0}% above {:.0}%",
                metrics.disk_percent, self.policy.disk_critical_percent
            ));
            return Ok(Diagnosis::new(FailureType::DiskFull, evidence));
        }

        evidence.push("no decisive signal".to_string());
        Ok(Diagnosis::new(FailureType::Unknown, evidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostRef;
    use crate::remote::ServiceState;
    use crate::testkit::{FakeFleet, FakeNode};

    fn diagnoser(fleet: &FakeFleet) -> Diagnoser {
        Diagnoser::new(Arc::new(fleet.clone()), HealthPolicy::default(), "openclaw.json")
    }

    fn node(id: &str) -> Node {
        Node::new(id, HostRef::new(format!("{id}.lan"), "openclaw"))
    }

    #[test]
    fn test_log_signatures() {
        let cases = [
            ("Error: ENOENT: no such file or directory, open '/usr/lib/node_modules/openclaw'", FailureType::ProgramMissing),
            ("openclaw-gateway.service: Main process exited, code=exited, status=203/EXEC", FailureType::ProgramMissing),
            ("Error: EACCES: permission denied, open 'auth-profiles.json'", FailureType::PermissionError),
            ("Error: ENOSPC: no space left on device, write", FailureType::DiskFull),
            ("SyntaxError: Unexpected token } in JSON at position 42", FailureType::ConfigError),
            ("Main process exited, code=killed, status=11/SEGV", FailureType::ServiceCrash),
            ("", FailureType::ServiceCrash),
        ];
        for (logs, expected) in cases {
            assert_eq!(classify_service_logs(logs).0, expected, "logs: {logs}");
        }
    }

    #[test]
    fn test_missing_file_wins_over_later_signatures() {
        let logs = "SyntaxError: bad\nError: ENOENT: no such file";
        let (failure, line) = classify_service_logs(logs);
        assert_eq!(failure, FailureType::ProgramMissing);
        assert_eq!(line.unwrap(), "Error: ENOENT: no such file");
    }

    #[tokio::test]
    async fn test_missing_program_short_circuits() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy().without_program());
        let diagnosis = diagnoser(&fleet).diagnose(&node("pc-a")).await;
        assert_eq!(diagnosis.failure, FailureType::ProgramMissing);
        assert!(!fleet.calls("pc-a").contains(&"service_state".to_string()));
    }

    #[tokio::test]
    async fn test_inactive_service_without_signature_is_crash() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy().with_service(ServiceState::Failed).with_logs("Main process exited, code=killed"));
        let diagnosis = diagnoser(&fleet).diagnose(&node("pc-a")).await;
        assert_eq!(diagnosis.failure, FailureType::ServiceCrash);
    }

    #[tokio::test]
    async fn test_active_service_with_broken_config() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy().with_file("openclaw.json", "{\"gateway\": "));
        let diagnosis = diagnoser(&fleet).diagnose(&node("pc-a")).await;
        assert_eq!(diagnosis.failure, FailureType::ConfigError);
    }

    #[tokio::test]
    async fn test_disk_pressure_and_unknown() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("full", FakeNode::healthy().with_disk(96.0));
        fleet.add_node("fine", FakeNode::healthy());
        let diagnoser = diagnoser(&fleet);
        assert_eq!(diagnoser.diagnose(&node("full")).await.failure, FailureType::DiskFull);
        assert_eq!(diagnoser.diagnose(&node("fine")).await.failure, FailureType::Unknown);
    }

    #[tokio::test]
    async fn test_unreachable_is_network_error() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy().unreachable());
        let diagnosis = diagnoser(&fleet).diagnose(&node("pc-a")).await;
        assert_eq!(diagnosis.failure, FailureType::NetworkError);
    }

    #[tokio::test]
    async fn test_diagnosis_is_deterministic() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy().with_service(ServiceState::Inactive).with_logs("EACCES: permission denied"));
        let diagnoser = diagnoser(&fleet);
        let first = diagnoser.diagnose(&node("pc-a")).await;
        let second = diagnoser.diagnose(&node("pc-a")).await;
        assert_eq!(first, second);
        assert_eq!(first.failure, FailureType::PermissionError);
    }
}
