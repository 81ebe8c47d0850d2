//! Health monitoring: probes, scoring, classification and readiness.
//!
//! Four core probes are worth 25 points each. Resource usage and the program
//! version are sampled alongside but never change the score.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::config::{HealthPolicy, MonitorSettings};
use crate::error::{RemoteError, Result};
use crate::models::{Node, NodeStatus, ResourceMetrics};
use crate::remote::{NodeControl, ServiceState};
use crate::state::{NodeGuard, NodeLocks};

pub const PROBE_WEIGHT: u8 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Connectivity,
    ProgramPresent,
    ServiceActive,
    PortBound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbeResult {
    pub probe: ProbeKind,
    pub passed: bool,
    pub evidence: Vec<String>,
}

impl HealthProbeResult {
    fn new(probe: ProbeKind, passed: bool, evidence: impl Into<String>) -> Self {
        Self {
            probe,
            passed,
            evidence: vec![evidence.into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub node_id: String,
    pub score: u8,
    pub status: NodeStatus,
    pub reachable: bool,
    pub probes: Vec<HealthProbeResult>,
    pub metrics: Option<ResourceMetrics>,
    pub program_version: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub node_id: String,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub score: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Result of the reduced post-change probe set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub passed: bool,
    pub attempts: u32,
    pub score: u8,
    pub service: ServiceState,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub node_id: String,
    pub ready: bool,
    pub status: NodeStatus,
    pub score: u8,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemNode {
    pub node_id: String,
    pub status: NodeStatus,
    pub score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetReport {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Share of healthy nodes, 0.0 - 1.0.
    pub health_rate: f32,
    pub problem_nodes: Vec<ProblemNode>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub checked: Vec<HealthResult>,
    /// Nodes skipped because another operation held them.
    pub busy: Vec<String>,
    /// Nodes whose check could not complete, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Sum of the weights of the passing probes.
pub fn score(probes: &[HealthProbeResult]) -> u8 {
    let total: u32 = probes.iter().filter(|p| p.passed).map(|_| PROBE_WEIGHT as u32).sum();
    total.min(100) as u8
}

/// Status as a pure function of score and connectivity.
pub fn classify(score: u8, reachable: bool, policy: &HealthPolicy) -> NodeStatus {
    if !reachable {
        NodeStatus::Offline
    } else if score >= policy.healthy_min {
        NodeStatus::Healthy
    } else if score >= policy.warning_min {
        NodeStatus::Warning
    } else if score >= policy.unstable_min {
        NodeStatus::Unstable
    } else {
        NodeStatus::Degraded
    }
}

pub struct HealthMonitor {
    control: Arc<dyn NodeControl>,
    catalog: Catalog,
    locks: NodeLocks,
    policy: HealthPolicy,
    settings: MonitorSettings,
    events: broadcast::Sender<StatusTransition>,
}

impl HealthMonitor {
    pub fn new(
        control: Arc<dyn NodeControl>,
        catalog: Catalog,
        locks: NodeLocks,
        policy: HealthPolicy,
        settings: MonitorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            control,
            catalog,
            locks,
            policy,
            settings,
            events,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusTransition> {
        self.events.subscribe()
    }

    /// Checks one node, waiting for its lock.
    pub async fn check_node(&self, node_id: &str) -> Result<HealthResult> {
        let guard = self.locks.acquire(node_id).await;
        self.check_locked(&guard).await
    }

    /// Checks a node the caller already holds.
    pub async fn check_locked(&self, guard: &NodeGuard) -> Result<HealthResult> {
        let node = self.catalog.require_node(guard.node_id()).await?;
        let result = self.probe(&node).await;
        self.record(&result).await?;
        Ok(result)
    }

    /// Runs the full probe battery without touching the catalog.
    pub async fn probe(&self, node: &Node) -> HealthResult {
        let checked_at = OffsetDateTime::now_utc();
        let mut probes = Vec::with_capacity(4);

        if let Err(e) = self.control.ping(node).await {
            debug!("{}: unreachable: {}", node.id, e);
            return self.unreachable(node, probes, e, checked_at);
        }
        probes.push(HealthProbeResult::new(ProbeKind::Connectivity, true, "responds to commands"));

        match self.control.program_present(node).await {
            Ok(present) => probes.push(HealthProbeResult::new(
                ProbeKind::ProgramPresent,
                present,
                if present { "binary found on PATH" } else { "binary not found on PATH" },
            )),
            Err(e) if e.is_transport() => return self.unreachable(node, probes, e, checked_at),
            Err(e) => probes.push(HealthProbeResult::new(ProbeKind::ProgramPresent, false, e.to_string())),
        }

        match self.control.service_state(node).await {
            Ok(state) => probes.push(HealthProbeResult::new(
                ProbeKind::ServiceActive,
                state.is_active(),
                format!("service is {state:?}").to_lowercase(),
            )),
            Err(e) if e.is_transport() => return self.unreachable(node, probes, e, checked_at),
            Err(e) => probes.push(HealthProbeResult::new(ProbeKind::ServiceActive, false, e.to_string())),
        }

        match self.control.port_bound(node).await {
            Ok(bound) => probes.push(HealthProbeResult::new(
                ProbeKind::PortBound,
                bound,
                if bound { "port is listening" } else { "port is not listening" },
            )),
            Err(e) if e.is_transport() => return self.unreachable(node, probes, e, checked_at),
            Err(e) => probes.push(HealthProbeResult::new(ProbeKind::PortBound, false, e.to_string())),
        }

        let metrics = match self.control.resources(node).await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                debug!("{}: resource sampling failed: {}", node.id, e);
                None
            }
        };
        let program_version = self.control.program_version(node).await.ok().flatten();

        let score = score(&probes);
        HealthResult {
            node_id: node.id.clone(),
            score,
            status: classify(score, true, &self.policy),
            reachable: true,
            probes,
            metrics,
            program_version,
            checked_at,
        }
    }

    fn unreachable(
        &self,
        node: &Node,
        mut probes: Vec<HealthProbeResult>,
        error: RemoteError,
        checked_at: OffsetDateTime,
    ) -> HealthResult {
        probes.retain(|p| p.probe != ProbeKind::Connectivity);
        probes.insert(0, HealthProbeResult::new(ProbeKind::Connectivity, false, error.to_string()));
        for probe in [ProbeKind::ProgramPresent, ProbeKind::ServiceActive, ProbeKind::PortBound] {
            if !probes.iter().any(|p| p.probe == probe) {
                probes.push(HealthProbeResult::new(probe, false, "skipped: node unreachable"));
            }
        }
        HealthResult {
            node_id: node.id.clone(),
            score: 0,
            status: NodeStatus::Offline,
            reachable: false,
            probes,
            metrics: None,
            program_version: None,
            checked_at,
        }
    }

    /// Persists a result and publishes the transition if the status changed.
    /// `needs-manual-attention` survives every check.
    pub async fn record(&self, result: &HealthResult) -> Result<NodeStatus> {
        let new_status = result.status;
        let (before, after) = self
            .catalog
            .update_node(&result.node_id, |node| {
                node.last_score = result.score;
                node.last_checked = Some(result.checked_at);
                if result.reachable {
                    node.last_seen = Some(result.checked_at);
                }
                if result.metrics.is_some() {
                    node.metrics = result.metrics;
                }
                if result.program_version.is_some() {
                    node.program_version = result.program_version.clone();
                }
                if node.status != NodeStatus::NeedsManualAttention {
                    node.status = new_status;
                }
            })
            .await?;

        if before.status != after.status {
            self.publish(&after.id, before.status, after.status, after.last_score);
        }
        Ok(after.status)
    }

    /// Forces a status, bypassing classification. Used for
    /// `needs-manual-attention`.
    pub async fn force_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        let (before, after) = self.catalog.update_node(node_id, |node| node.status = status).await?;
        if before.status != after.status {
            self.publish(node_id, before.status, after.status, after.last_score);
        }
        Ok(())
    }

    /// Marks a node whose check could not complete. `needs-manual-attention`
    /// is kept.
    pub async fn mark_error(&self, guard: &NodeGuard) -> Result<NodeStatus> {
        let (before, after) = self
            .catalog
            .update_node(guard.node_id(), |node| {
                if node.status != NodeStatus::NeedsManualAttention {
                    node.status = NodeStatus::Error;
                }
            })
            .await?;
        if before.status != after.status {
            self.publish(&after.id, before.status, after.status, after.last_score);
        }
        Ok(after.status)
    }

    fn publish(&self, node_id: &str, from: NodeStatus, to: NodeStatus, score: u8) {
        info!("node {} status {} -> {} (score {})", node_id, from, to, score);
        let _ = self.events.send(StatusTransition {
            node_id: node_id.to_string(),
            from,
            to,
            score,
            at: OffsetDateTime::now_utc(),
        });
    }

    /// One sweep over the registry. Per-node failures never abort the sweep.
    pub async fn check_all(&self) -> SweepReport {
        let nodes = self.catalog.list_nodes().await;
        let workers = self.settings.workers.max(1);

        let outcomes: Vec<(String, Option<Result<HealthResult>>)> = stream::iter(nodes)
            .map(|node| async move {
                let Some(guard) = self.locks.try_acquire(&node.id) else {
                    return (node.id, None);
                };
                let outcome = self.check_locked(&guard).await;
                if outcome.is_err() {
                    if let Err(mark) = self.mark_error(&guard).await {
                        warn!("{}: could not mark node as error: {}", node.id, mark);
                    }
                }
                (node.id, Some(outcome))
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (node_id, outcome) in outcomes {
            match outcome {
                None => {
                    debug!("{}: busy, skipped this sweep", node_id);
                    report.busy.push(node_id);
                }
                Some(Ok(result)) => report.checked.push(result),
                Some(Err(e)) => {
                    error!("{}: health check failed: {}", node_id, e);
                    report.failed.push((node_id, e.to_string()));
                }
            }
        }
        report.checked.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        report
    }

    /// Reduced probe set after a change, repeated until it passes or attempts
    /// run out. The last attempt is recorded like a regular check.
    pub async fn verify(&self, guard: &NodeGuard) -> Result<Verification> {
        let node = self.catalog.require_node(guard.node_id()).await?;
        let attempts = self.policy.verify_attempts.max(1);

        if self.policy.verify_settle_secs > 0 {
            tokio::time::sleep(Duration::from_secs(self.policy.verify_settle_secs)).await;
        }

        let (mut verification, mut result) = self.verify_once(&node, 1).await;
        for attempt in 2..=attempts {
            if verification.passed {
                break;
            }
            debug!(
                "{}: verification attempt {}/{} failed: score {} service {:?}",
                node.id,
                attempt - 1,
                attempts,
                verification.score,
                verification.service
            );
            if self.policy.verify_interval_secs > 0 {
                tokio::time::sleep(Duration::from_secs(self.policy.verify_interval_secs)).await;
            }
            let mut evidence = std::mem::take(&mut verification.evidence);
            (verification, result) = self.verify_once(&node, attempt).await;
            evidence.append(&mut verification.evidence);
            verification.evidence = evidence;
        }

        self.record(&result).await?;
        Ok(verification)
    }

    async fn verify_once(&self, node: &Node, attempt: u32) -> (Verification, HealthResult) {
        let checked_at = OffsetDateTime::now_utc();
        let mut evidence = Vec::new();
        let mut probes = vec![HealthProbeResult::new(ProbeKind::Connectivity, true, "implied by reduced probe set")];

        let present = self.control.program_present(node).await;
        let service = self.control.service_state(node).await;
        let bound = self.control.port_bound(node).await;

        if let Some(e) = [present.as_ref().err(), service.as_ref().err(), bound.as_ref().err()]
            .into_iter()
            .flatten()
            .find(|e| e.is_transport())
        {
            evidence.push(format!("attempt {attempt}: node unreachable: {e}"));
            let result = self.unreachable(node, Vec::new(), e.clone(), checked_at);
            let verification = Verification {
                passed: false,
                attempts: attempt,
                score: 0,
                service: ServiceState::Unknown,
                evidence,
            };
            return (verification, result);
        }

        let service_state = service.as_ref().copied().unwrap_or(ServiceState::Unknown);
        probes.push(HealthProbeResult::new(ProbeKind::ProgramPresent, matches!(present, Ok(true)), format!("{present:?}")));
        probes.push(HealthProbeResult::new(ProbeKind::ServiceActive, service_state.is_active(), format!("{service:?}")));
        probes.push(HealthProbeResult::new(ProbeKind::PortBound, matches!(bound, Ok(true)), format!("{bound:?}")));

        let score = score(&probes);
        let passed = service_state.is_active() && score >= self.policy.verify_min_score;
        evidence.push(format!(
            "attempt {attempt}: score {score}, service {service_state:?}, program {present:?}, port {bound:?}"
        ));

        let result = HealthResult {
            node_id: node.id.clone(),
            score,
            status: classify(score, true, &self.policy),
            reachable: true,
            probes,
            metrics: None,
            program_version: None,
            checked_at,
        };
        let verification = Verification {
            passed,
            attempts: attempt,
            score,
            service: service_state,
            evidence,
        };
        (verification, result)
    }

    pub fn is_fresh(&self, node: &Node) -> bool {
        match node.last_checked {
            Some(checked) => {
                let age = OffsetDateTime::now_utc() - checked;
                age.whole_seconds() >= 0 && (age.whole_seconds() as u64) < self.settings.stale_after_secs
            }
            None => false,
        }
    }

    /// Whether a node may take new workload.
    pub async fn readiness(&self, node_id: &str) -> Result<Readiness> {
        let node = self.catalog.require_node(node_id).await?;
        let mut reasons = Vec::new();

        if node.status != NodeStatus::Healthy {
            reasons.push(format!("status is {}", node.status));
        }
        if node.last_score < self.policy.ready_min_score {
            reasons.push(format!("score {} below {}", node.last_score, self.policy.ready_min_score));
        }
        if !self.is_fresh(&node) {
            reasons.push(match node.last_checked {
                Some(checked) => format!("health data is stale (last checked {checked})"),
                None => "never checked".to_string(),
            });
        }

        Ok(Readiness {
            node_id: node.id,
            ready: reasons.is_empty(),
            status: node.status,
            score: node.last_score,
            reasons,
        })
    }

    pub async fn fleet_report(&self) -> FleetReport {
        let nodes = self.catalog.list_nodes().await;
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut problem_nodes = Vec::new();

        for node in &nodes {
            *by_status.entry(node.status.to_string()).or_default() += 1;
            if !matches!(node.status, NodeStatus::Healthy | NodeStatus::Warning) {
                problem_nodes.push(ProblemNode {
                    node_id: node.id.clone(),
                    status: node.status,
                    score: node.last_score,
                });
            }
        }

        let healthy = by_status.get(NodeStatus::Healthy.as_str()).copied().unwrap_or(0);
        FleetReport {
            total: nodes.len(),
            health_rate: if nodes.is_empty() { 0.0 } else { healthy as f32 / nodes.len() as f32 },
            by_status,
            problem_nodes,
            generated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Clears `needs-manual-attention` and re-checks the node.
    pub async fn acknowledge(&self, node_id: &str) -> Result<HealthResult> {
        let guard = self.locks.acquire(node_id).await;
        self.catalog
            .update_node(node_id, |node| {
                if node.status == NodeStatus::NeedsManualAttention {
                    node.status = NodeStatus::Unknown;
                }
                node.recovery_attempts = 0;
            })
            .await?;
        info!("node {} acknowledged by operator", node_id);
        self.check_locked(&guard).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostRef;
    use crate::testkit::{FakeFleet, FakeNode};
    use proptest::prelude::*;

    fn probes(connectivity: bool, program: bool, service: bool, port: bool) -> Vec<HealthProbeResult> {
        vec![
            HealthProbeResult::new(ProbeKind::Connectivity, connectivity, ""),
            HealthProbeResult::new(ProbeKind::ProgramPresent, program, ""),
            HealthProbeResult::new(ProbeKind::ServiceActive, service, ""),
            HealthProbeResult::new(ProbeKind::PortBound, port, ""),
        ]
    }

    fn policy() -> HealthPolicy {
        HealthPolicy {
            verify_interval_secs: 0,
            verify_settle_secs: 0,
            ..HealthPolicy::default()
        }
    }

    async fn monitor_with(fleet: &FakeFleet, nodes: &[&str]) -> (HealthMonitor, Catalog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        for id in nodes {
            catalog.register_node(Node::new(*id, HostRef::new(format!("{id}.lan"), "openclaw"))).await.unwrap();
        }
        let monitor = HealthMonitor::new(
            Arc::new(fleet.clone()),
            catalog.clone(),
            NodeLocks::new(),
            policy(),
            MonitorSettings::default(),
        );
        (monitor, catalog, dir)
    }

    proptest! {
        #[test]
        fn score_is_bounded_and_deterministic(c in any::<bool>(), p in any::<bool>(), s in any::<bool>(), b in any::<bool>()) {
            let set = probes(c, p, s, b);
            let first = score(&set);
            prop_assert!(first <= 100);
            prop_assert_eq!(first as usize, [c, p, s, b].iter().filter(|x| **x).count() * 25);
            prop_assert_eq!(classify(first, c, &policy()), classify(score(&set), c, &policy()));
        }

        #[test]
        fn classification_is_monotonic(a in 0u8..=100, b in 0u8..=100) {
            let rank = |s: NodeStatus| match s {
                NodeStatus::Healthy => 3,
                NodeStatus::Warning => 2,
                NodeStatus::Unstable => 1,
                _ => 0,
            };
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(rank(classify(lo, true, &policy())) <= rank(classify(hi, true, &policy())));
        }
    }

    #[test]
    fn test_classification_thresholds() {
        let policy = policy();
        assert_eq!(classify(100, true, &policy), NodeStatus::Healthy);
        assert_eq!(classify(75, true, &policy), NodeStatus::Warning);
        assert_eq!(classify(50, true, &policy), NodeStatus::Unstable);
        assert_eq!(classify(25, true, &policy), NodeStatus::Degraded);
        assert_eq!(classify(0, false, &policy), NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_healthy_node_scores_100() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy());
        let (monitor, catalog, _dir) = monitor_with(&fleet, &["pc-a"]).await;

        let result = monitor.check_node("pc-a").await.unwrap();
        assert_eq!(result.score, 100);
        assert_eq!(result.status, NodeStatus::Healthy);

        let node = catalog.get_node("pc-a").await.unwrap();
        assert_eq!(node.status, NodeStatus::Healthy);
        assert!(node.last_seen.is_some());
        assert!(node.metrics.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_offline_and_short_circuits() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("t440", FakeNode::healthy().unreachable());
        let (monitor, catalog, _dir) = monitor_with(&fleet, &["t440"]).await;

        let result = monitor.check_node("t440").await.unwrap();
        assert_eq!(result.score, 0);
        assert_eq!(result.status, NodeStatus::Offline);
        assert!(!result.reachable);
        assert_eq!(fleet.calls("t440"), vec!["ping"]);
        assert!(catalog.get_node("t440").await.unwrap().last_seen.is_none());
    }

    #[tokio::test]
    async fn test_transition_is_published() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy());
        let (monitor, _catalog, _dir) = monitor_with(&fleet, &["pc-a"]).await;
        let mut events = monitor.subscribe();

        monitor.check_node("pc-a").await.unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.from, NodeStatus::Unknown);
        assert_eq!(event.to, NodeStatus::Healthy);

        monitor.check_node("pc-a").await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manual_attention_is_sticky() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy());
        let (monitor, catalog, _dir) = monitor_with(&fleet, &["pc-a"]).await;
        monitor.force_status("pc-a", NodeStatus::NeedsManualAttention).await.unwrap();

        let result = monitor.check_node("pc-a").await.unwrap();
        assert_eq!(result.score, 100);
        assert_eq!(catalog.get_node("pc-a").await.unwrap().status, NodeStatus::NeedsManualAttention);

        monitor.acknowledge("pc-a").await.unwrap();
        assert_eq!(catalog.get_node("pc-a").await.unwrap().status, NodeStatus::Healthy);
    }

    #[tokio::test]
    async fn test_mark_error_keeps_manual_attention() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy());
        fleet.add_node("t440", FakeNode::healthy());
        let (monitor, catalog, _dir) = monitor_with(&fleet, &["pc-a", "t440"]).await;
        monitor.force_status("pc-a", NodeStatus::NeedsManualAttention).await.unwrap();

        let guard = monitor.locks.acquire("pc-a").await;
        assert_eq!(monitor.mark_error(&guard).await.unwrap(), NodeStatus::NeedsManualAttention);
        drop(guard);
        let guard = monitor.locks.acquire("t440").await;
        assert_eq!(monitor.mark_error(&guard).await.unwrap(), NodeStatus::Error);
        drop(guard);

        assert_eq!(catalog.get_node("pc-a").await.unwrap().status, NodeStatus::NeedsManualAttention);
        assert_eq!(catalog.get_node("t440").await.unwrap().status, NodeStatus::Error);
    }

    #[tokio::test]
    async fn test_failed_sweep_check_keeps_manual_attention() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy());
        let (monitor, catalog, dir) = monitor_with(&fleet, &["pc-a"]).await;
        monitor.force_status("pc-a", NodeStatus::NeedsManualAttention).await.unwrap();

        // Node writes now fail, so the check cannot be recorded.
        std::fs::remove_file(dir.path().join("nodes.json")).unwrap();
        std::fs::create_dir(dir.path().join("nodes.json")).unwrap();

        let report = monitor.check_all().await;
        assert_eq!(report.failed.len(), 1);
        assert!(report.checked.is_empty());
        assert_eq!(catalog.get_node("pc-a").await.unwrap().status, NodeStatus::NeedsManualAttention);
    }

    #[tokio::test]
    async fn test_sweep_skips_busy_nodes() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy());
        fleet.add_node("t440", FakeNode::healthy());
        let (monitor, _catalog, _dir) = monitor_with(&fleet, &["pc-a", "t440"]).await;

        let _held = monitor.locks.acquire("t440").await;
        let report = monitor.check_all().await;
        assert_eq!(report.checked.len(), 1);
        assert_eq!(report.busy, vec!["t440".to_string()]);
    }

    #[tokio::test]
    async fn test_verify_fails_when_service_stays_down() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy().with_service(ServiceState::Failed));
        let (monitor, _catalog, _dir) = monitor_with(&fleet, &["pc-a"]).await;

        let guard = monitor.locks.acquire("pc-a").await;
        let verification = monitor.verify(&guard).await.unwrap();
        assert!(!verification.passed);
        assert_eq!(verification.attempts, 3);
        assert_eq!(verification.score, 50);
    }

    #[tokio::test]
    async fn test_readiness_and_fleet_report() {
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy());
        fleet.add_node("t440", FakeNode::healthy().with_service(ServiceState::Inactive));
        let (monitor, _catalog, _dir) = monitor_with(&fleet, &["pc-a", "t440", "baota"]).await;
        fleet.add_node("baota", FakeNode::healthy());

        monitor.check_node("pc-a").await.unwrap();
        monitor.check_node("t440").await.unwrap();

        assert!(monitor.readiness("pc-a").await.unwrap().ready);
        let not_ready = monitor.readiness("t440").await.unwrap();
        assert!(!not_ready.ready);
        assert_eq!(not_ready.status, NodeStatus::Unstable);
        let never = monitor.readiness("baota").await.unwrap();
        assert!(never.reasons.iter().any(|r| r == "never checked"));

        let report = monitor.fleet_report().await;
        assert_eq!(report.total, 3);
        assert_eq!(report.by_status["healthy"], 1);
        assert_eq!(report.problem_nodes.len(), 2);
        assert!((report.health_rate - 1.0 / 3.0).abs() < f32::EPSILON);
    }
}
