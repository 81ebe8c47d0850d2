//! Background loops: periodic health sweeps, scheduled backups and automatic
//! recovery of nodes that fall into a problem status.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup::BackupEngine;
use crate::catalog::Catalog;
use crate::config::{BackupSettings, MonitorSettings, RecoverySettings};
use crate::health::{HealthMonitor, StatusTransition};
use crate::models::{BackupKind, Node, NodeStatus};
use crate::recovery::RecoveryStrategist;
use crate::state::{new_state, Shared};

pub struct Supervisor {
    catalog: Catalog,
    monitor: Arc<HealthMonitor>,
    backups: Arc<BackupEngine>,
    strategist: Arc<RecoveryStrategist>,
    monitor_settings: MonitorSettings,
    backup_settings: BackupSettings,
    recovery_settings: RecoverySettings,
    recovering: Shared<HashSet<String>>,
}

/// Whether automatic recovery may run now for this node.
pub fn may_auto_recover(node: &Node, settings: &RecoverySettings, now: OffsetDateTime) -> bool {
    if !settings.auto_recover || !node.status.is_problem() {
        return false;
    }
    if node.recovery_attempts >= settings.max_attempts {
        return false;
    }
    match node.last_recovery_at {
        Some(last) => (now - last).whole_seconds() >= settings.cooldown_secs as i64,
        None => true,
    }
}

impl Supervisor {
    pub fn new(
        catalog: Catalog,
        monitor: Arc<HealthMonitor>,
        backups: Arc<BackupEngine>,
        strategist: Arc<RecoveryStrategist>,
        monitor_settings: MonitorSettings,
        backup_settings: BackupSettings,
        recovery_settings: RecoverySettings,
    ) -> Self {
        Self {
            catalog,
            monitor,
            backups,
            strategist,
            monitor_settings,
            backup_settings,
            recovery_settings,
            recovering: new_state(HashSet::new()),
        }
    }

    /// Starts every enabled loop.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.recovery_settings.auto_recover {
            // Subscribe before the first sweep so no transition is missed.
            let events = self.monitor.subscribe();
            let supervisor = self.clone();
            handles.push(tokio::spawn(async move { supervisor.auto_recovery_loop(events).await }));
        }

        if let Some(interval) = self.backup_settings.schedule_interval_secs {
            let supervisor = self.clone();
            handles.push(tokio::spawn(async move { supervisor.backup_loop(Duration::from_secs(interval)).await }));
        }

        let supervisor = self.clone();
        handles.push(tokio::spawn(async move { supervisor.sweep_loop().await }));
        handles
    }

    async fn sweep_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.monitor_settings.interval_secs);
        let backoff = Duration::from_secs(self.monitor_settings.error_backoff_secs);
        info!("health sweeps every {:?}", interval);

        loop {
            let monitor = self.monitor.clone();
            // A panic inside a sweep surfaces here as a JoinError instead of killing the loop.
            match tokio::spawn(async move { monitor.check_all().await }).await {
                Ok(report) => {
                    info!(
                        "sweep: {} checked, {} busy, {} failed",
                        report.checked.len(),
                        report.busy.len(),
                        report.failed.len()
                    );
                    tokio::time::sleep(interval).await;
                }
                Err(e) => {
                    error!("health sweep crashed: {}; retrying in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn backup_loop(self: Arc<Self>, interval: Duration) {
        info!("scheduled backups every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so start-up is not a backup storm.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.run_scheduled_backups().await;
        }
    }

    /// One scheduled backup per reachable node. Failures are logged and skipped.
    pub async fn run_scheduled_backups(&self) -> usize {
        let mut created = 0;
        for node in self.catalog.list_nodes().await {
            if node.status == NodeStatus::Offline {
                debug!("{}: offline, no scheduled backup", node.id);
                continue;
            }
            match self.backups.create_backup(&node.id, BackupKind::Scheduled).await {
                Ok(record) => {
                    debug!("{}: scheduled backup {}", node.id, record.id);
                    created += 1;
                }
                Err(e) => warn!("{}: scheduled backup failed: {}", node.id, e),
            }
        }
        created
    }

    async fn auto_recovery_loop(self: Arc<Self>, mut events: tokio::sync::broadcast::Receiver<StatusTransition>) {
        info!(
            "automatic recovery enabled (max {} attempts, cooldown {}s)",
            self.recovery_settings.max_attempts, self.recovery_settings.cooldown_secs
        );
        loop {
            match events.recv().await {
                Ok(transition) => {
                    self.clone().on_transition(transition).await;
                }
                Err(RecvError::Lagged(skipped)) => warn!("auto-recovery missed {} transitions", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Starts a recovery in the background when the transition warrants one.
    /// Returns the task so callers (tests) can wait for it.
    pub async fn on_transition(self: Arc<Self>, transition: StatusTransition) -> Option<JoinHandle<()>> {
        if !transition.to.is_problem() {
            return None;
        }
        let node = self.catalog.get_node(&transition.node_id).await?;
        if !may_auto_recover(&node, &self.recovery_settings, OffsetDateTime::now_utc()) {
            debug!(
                "{}: not recovering automatically ({} attempts so far)",
                node.id, node.recovery_attempts
            );
            return None;
        }
        if !self.recovering.lock().insert(node.id.clone()) {
            return None;
        }

        info!("{}: {} -> {}, starting automatic recovery", node.id, transition.from, transition.to);
        let supervisor = self.clone();
        Some(tokio::spawn(async move {
            match supervisor.strategist.recover(&node.id, None).await {
                Ok(report) => info!(
                    "{}: automatic recovery finished as {} ({})",
                    node.id, report.final_state, report.strategy
                ),
                Err(e) => error!("{}: automatic recovery failed: {}", node.id, e),
            }
            supervisor.recovering.lock().remove(&node.id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostRef;

    fn settings() -> RecoverySettings {
        RecoverySettings {
            auto_recover: true,
            max_attempts: 3,
            cooldown_secs: 600,
        }
    }

    fn degraded() -> Node {
        let mut node = Node::new("pc-a", HostRef::new("192.168.3.73", "openclaw01"));
        node.status = NodeStatus::Degraded;
        node
    }

    #[test]
    fn test_auto_recover_respects_switch_and_status() {
        let now = OffsetDateTime::now_utc();
        assert!(may_auto_recover(&degraded(), &settings(), now));

        let disabled = RecoverySettings { auto_recover: false, ..settings() };
        assert!(!may_auto_recover(&degraded(), &disabled, now));

        let mut healthy = degraded();
        healthy.status = NodeStatus::Healthy;
        assert!(!may_auto_recover(&healthy, &settings(), now));

        let mut manual = degraded();
        manual.status = NodeStatus::NeedsManualAttention;
        assert!(!may_auto_recover(&manual, &settings(), now));
    }

    #[test]
    fn test_auto_recover_attempt_limit_and_cooldown() {
        let now = OffsetDateTime::now_utc();
        let mut node = degraded();
        node.recovery_attempts = 3;
        assert!(!may_auto_recover(&node, &settings(), now));

        node.recovery_attempts = 1;
        node.last_recovery_at = Some(now - time::Duration::seconds(60));
        assert!(!may_auto_recover(&node, &settings(), now));

        node.last_recovery_at = Some(now - time::Duration::seconds(601));
        assert!(may_auto_recover(&node, &settings(), now));
    }
}
