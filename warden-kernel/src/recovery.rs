//! Strategy selection and the end-to-end recovery pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::{ApplyScope, BackupEngine, RestoreOutcome, RestorePlan, RestoreRequest};
use crate::catalog::Catalog;
use crate::diagnose::{Diagnoser, Diagnosis, FailureType};
use crate::error::{Result, WardenError};
use crate::health::{HealthMonitor, Verification};
use crate::models::{BackupKind, BackupRecord, RestoreAttempt};
use crate::operation::{OperationLog, OperationState, StepRecord};
use crate::state::{NodeGuard, NodeLocks};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    ConfigOnly,
    ServiceRestart,
    Reinstall,
    FullRestore,
    /// Free disk space and force a restart; escalates to a full restore.
    Emergency,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ConfigOnly => "CONFIG_ONLY",
            Strategy::ServiceRestart => "SERVICE_RESTART",
            Strategy::Reinstall => "REINSTALL",
            Strategy::FullRestore => "FULL_RESTORE",
            Strategy::Emergency => "EMERGENCY",
        }
    }

    pub fn plan(&self) -> RestorePlan {
        let (scope, reinstall, force_restart, emergency_first) = match self {
            Strategy::ConfigOnly => (ApplyScope::MainFile, false, false, false),
            Strategy::ServiceRestart => (ApplyScope::MainFile, false, true, false),
            Strategy::Reinstall => (ApplyScope::FullTree, true, false, false),
            Strategy::FullRestore => (ApplyScope::FullTree, false, false, false),
            Strategy::Emergency => (ApplyScope::FullTree, false, false, true),
        };
        RestorePlan {
            strategy: *self,
            scope,
            reinstall,
            force_restart,
            emergency_first,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn determine_strategy(failure: FailureType) -> Strategy {
    match failure {
        FailureType::ConfigError => Strategy::ConfigOnly,
        FailureType::ServiceCrash => Strategy::ServiceRestart,
        FailureType::ProgramMissing => Strategy::Reinstall,
        FailureType::PermissionError | FailureType::Unknown => Strategy::FullRestore,
        FailureType::DiskFull | FailureType::NetworkError => Strategy::Emergency,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub success: bool,
    pub node_id: String,
    pub diagnosis: Option<Diagnosis>,
    pub strategy: Strategy,
    pub final_state: OperationState,
    pub verification: Option<Verification>,
    pub backup_id: Option<String>,
    pub snapshot_backup_id: Option<String>,
    pub restore_attempt_id: String,
    pub error: Option<String>,
    pub log: Vec<StepRecord>,
}

impl From<RestoreOutcome> for RecoveryReport {
    fn from(outcome: RestoreOutcome) -> Self {
        let attempt = outcome.attempt;
        Self {
            success: attempt.status == OperationState::Succeeded,
            node_id: attempt.node_id,
            diagnosis: attempt.diagnosis,
            strategy: attempt.strategy,
            final_state: attempt.status,
            verification: outcome.verification,
            backup_id: attempt.backup_id,
            snapshot_backup_id: attempt.snapshot_backup_id,
            restore_attempt_id: attempt.id,
            error: outcome.abort.map(|e| e.to_string()),
            log: attempt.log,
        }
    }
}

pub struct RecoveryStrategist {
    catalog: Catalog,
    locks: NodeLocks,
    monitor: Arc<HealthMonitor>,
    diagnoser: Diagnoser,
    backups: Arc<BackupEngine>,
}

impl RecoveryStrategist {
    pub fn new(
        catalog: Catalog,
        locks: NodeLocks,
        monitor: Arc<HealthMonitor>,
        diagnoser: Diagnoser,
        backups: Arc<BackupEngine>,
    ) -> Self {
        Self {
            catalog,
            locks,
            monitor,
            diagnoser,
            backups,
        }
    }

    /// Runs one strategy against one backup, without diagnosis.
    pub async fn execute(&self, node_id: &str, backup_id: &str, strategy: Strategy) -> Result<RecoveryReport> {
        let guard = self.locks.acquire(node_id).await;
        let mut log = OperationLog::new();
        transition(&mut log, OperationState::StrategySelected)?;
        log.ok("select strategy", format!("{strategy} requested"));
        let outcome = self
            .backups
            .restore_with(
                &guard,
                RestoreRequest {
                    backup_id,
                    plan: strategy.plan(),
                    diagnosis: None,
                    log,
                },
            )
            .await?;
        Ok(RecoveryReport::from(outcome))
    }

    /// Full pipeline: fresh health data, diagnosis, strategy, restore, verification.
    pub async fn recover(&self, node_id: &str, backup_id: Option<&str>) -> Result<RecoveryReport> {
        let guard = self.locks.acquire(node_id).await;
        let started_at = OffsetDateTime::now_utc();
        let mut log = OperationLog::new();

        let mut node = self.catalog.require_node(node_id).await?;
        if !self.monitor.is_fresh(&node) {
            let result = self.monitor.check_locked(&guard).await?;
            log.ok("refresh health", format!("score {} ({})", result.score, result.status));
            node = self.catalog.require_node(node_id).await?;
        }

        let diagnosis = self.diagnoser.diagnose(&node).await;
        transition(&mut log, OperationState::Diagnosed)?;
        log.ok("diagnose", format!("{}: {}", diagnosis.failure, diagnosis.evidence.join("; ")));

        let strategy = determine_strategy(diagnosis.failure);
        transition(&mut log, OperationState::StrategySelected)?;
        log.ok("select strategy", strategy.as_str());
        info!("{}: {} -> {}", node_id, diagnosis.failure, strategy);

        let backup = match backup_id {
            Some(id) => self.backups.get_backup(id).await.ok(),
            None => self.default_backup(node_id).await,
        };
        let Some(backup) = backup else {
            let error = WardenError::NotFound(match backup_id {
                Some(id) => format!("backup {id}"),
                None => format!("any backup of node {node_id}"),
            });
            let report = self.abort_without_backup(&guard, diagnosis, strategy, log, started_at, error).await?;
            self.bookkeep(node_id, false).await;
            return Ok(report);
        };

        let outcome = self
            .backups
            .restore_with(
                &guard,
                RestoreRequest {
                    backup_id: &backup.id,
                    plan: strategy.plan(),
                    diagnosis: Some(diagnosis),
                    log,
                },
            )
            .await?;
        let report = RecoveryReport::from(outcome);
        self.bookkeep(node_id, report.success).await;
        Ok(report)
    }

    /// Diagnosis only. Reads from the node, changes nothing.
    pub async fn diagnose(&self, node_id: &str) -> Result<Diagnosis> {
        let node = self.catalog.require_node(node_id).await?;
        Ok(self.diagnoser.diagnose(&node).await)
    }

    /// Newest regular backup, or the newest snapshot when there is nothing else.
    pub async fn default_backup(&self, node_id: &str) -> Option<BackupRecord> {
        let backups = self.catalog.backups_for_node(node_id, None).await;
        backups
            .iter()
            .find(|b| b.kind != BackupKind::PreRestore)
            .or_else(|| backups.first())
            .cloned()
    }

    async fn abort_without_backup(
        &self,
        guard: &NodeGuard,
        diagnosis: Diagnosis,
        strategy: Strategy,
        mut log: OperationLog,
        started_at: OffsetDateTime,
        error: WardenError,
    ) -> Result<RecoveryReport> {
        warn!("{}: recovery aborted: {}", guard.node_id(), error);
        log.fail("resolve backup", error.to_string());
        transition(&mut log, OperationState::Aborted)?;

        let attempt = RestoreAttempt {
            id: Uuid::new_v4().to_string(),
            node_id: guard.node_id().to_string(),
            backup_id: None,
            diagnosis: Some(diagnosis.clone()),
            strategy,
            status: OperationState::Aborted,
            rollback_path: None,
            snapshot_backup_id: None,
            log: log.into_steps(),
            started_at,
            finished_at: OffsetDateTime::now_utc(),
        };
        self.catalog.append_restore_attempt(attempt.clone()).await?;

        Ok(RecoveryReport {
            success: false,
            node_id: attempt.node_id,
            diagnosis: Some(diagnosis),
            strategy,
            final_state: OperationState::Aborted,
            verification: None,
            backup_id: None,
            snapshot_backup_id: None,
            restore_attempt_id: attempt.id,
            error: Some(error.to_string()),
            log: attempt.log,
        })
    }

    /// Consecutive-attempt counter used by automatic recovery.
    async fn bookkeep(&self, node_id: &str, success: bool) {
        let updated = self
            .catalog
            .update_node(node_id, |node| {
                node.last_recovery_at = Some(OffsetDateTime::now_utc());
                if success {
                    node.recovery_attempts = 0;
                } else {
                    node.recovery_attempts += 1;
                }
            })
            .await;
        if let Err(e) = updated {
            warn!("{}: could not record recovery attempt: {}", node_id, e);
        }
    }
}

fn transition(log: &mut OperationLog, next: OperationState) -> Result<()> {
    log.transition(next).map_err(|e| WardenError::Config(e.to_string()))
}
