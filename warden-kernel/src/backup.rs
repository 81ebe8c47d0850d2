//! Configuration backups and the restore primitive.
//!
//! A backup is the node's whole configuration directory packed into one
//! archive, never an increment. Restores always run in this order:
//!
//! 1. integrity check of the stored archive (no remote contact on mismatch)
//! 2. pre-restore snapshot of the node's current configuration
//! 3. the plan's mutating steps, then a read-back of the applied tree
//! 4. verification with the reduced probe set
//! 5. rollback to the snapshot when any of the above fails after step 2
//!
//! Every attempt, including aborted ones, ends up in the restore log.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::{self, ConfigTree};
use crate::catalog::Catalog;
use crate::config::RetentionPolicy;
use crate::diagnose::Diagnosis;
use crate::error::{Result, WardenError};
use crate::health::{HealthMonitor, Verification};
use crate::models::{format_size, BackupKind, BackupRecord, Node, NodeStatus, RestoreAttempt};
use crate::operation::{OperationLog, OperationState};
use crate::recovery::Strategy;
use crate::remote::NodeControl;
use crate::state::{NodeGuard, NodeLocks};

/// How much of the backup reaches the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyScope {
    /// Only the main configuration file; the rest of the live tree is kept.
    MainFile,
    FullTree,
}

/// Mutating steps of one restore, derived from a [`Strategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    pub strategy: Strategy,
    pub scope: ApplyScope,
    pub reinstall: bool,
    /// Reload units and clear the failed state instead of a plain start.
    pub force_restart: bool,
    /// Free disk space and force a restart first; apply the archive only if
    /// the node still fails verification afterwards.
    pub emergency_first: bool,
}

/// What a restore produced. `abort` is set when the operation stopped before
/// touching the node.
#[derive(Debug)]
pub struct RestoreOutcome {
    pub attempt: RestoreAttempt,
    pub snapshot: Option<BackupRecord>,
    pub verification: Option<Verification>,
    pub abort: Option<WardenError>,
}

impl RestoreOutcome {
    pub fn succeeded(&self) -> bool {
        self.attempt.status == OperationState::Succeeded
    }

    /// Turns an aborted outcome into its error.
    pub fn into_result(self) -> Result<RestoreOutcome> {
        match self.abort {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Inputs of [`BackupEngine::restore_with`] beyond the locked node.
pub struct RestoreRequest<'a> {
    pub backup_id: &'a str,
    pub plan: RestorePlan,
    pub diagnosis: Option<Diagnosis>,
    pub log: OperationLog,
}

pub struct BackupEngine {
    control: Arc<dyn NodeControl>,
    catalog: Catalog,
    locks: NodeLocks,
    monitor: Arc<HealthMonitor>,
    backup_dir: PathBuf,
    retention: RetentionPolicy,
    config_file: String,
    list_limit: usize,
}

impl BackupEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<dyn NodeControl>,
        catalog: Catalog,
        locks: NodeLocks,
        monitor: Arc<HealthMonitor>,
        backup_dir: impl Into<PathBuf>,
        retention: RetentionPolicy,
        config_file: impl Into<String>,
        list_limit: usize,
    ) -> Self {
        Self {
            control,
            catalog,
            locks,
            monitor,
            backup_dir: backup_dir.into(),
            retention,
            config_file: config_file.into(),
            list_limit,
        }
    }

    // --- backups ---

    pub async fn create_backup(&self, node_id: &str, kind: BackupKind) -> Result<BackupRecord> {
        let guard = self.locks.acquire(node_id).await;
        self.create_locked(&guard, kind).await
    }

    pub async fn create_locked(&self, guard: &NodeGuard, kind: BackupKind) -> Result<BackupRecord> {
        let node = self.catalog.require_node(guard.node_id()).await?;
        let tree = self
            .control
            .read_config_tree(&node)
            .await
            .map_err(|e| WardenError::remote(&node.id, "read configuration", e))?;
        if tree.is_empty() {
            warn!("{}: configuration directory is empty or missing", node.id);
        }
        let log = vec![format!("read {} files ({}) from {}", tree.len(), format_size(tree.total_bytes()), node.host.destination())];
        self.store(&node, &tree, kind, log).await
    }

    /// Writes the archive atomically, checksums the finished file and catalogs it.
    async fn store(&self, node: &Node, tree: &ConfigTree, kind: BackupKind, mut log: Vec<String>) -> Result<BackupRecord> {
        let created_at = OffsetDateTime::now_utc();
        let id = Uuid::new_v4().to_string();
        let stamp = created_at
            .format(format_description!("[year][month][day]-[hour][minute][second]"))
            .map_err(|e| WardenError::Config(format!("timestamp formatting: {e}")))?;

        let dir = self.backup_dir.join(&node.id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}-{}-{}.tar.gz", node.id, stamp, &id[..8]));

        let bytes = archive::pack(tree).map_err(|source| WardenError::Archive {
            path: Some(path.clone()),
            source,
        })?;
        let tmp = path.with_extension("gz.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let checksum = archive::checksum_file(&path).await?;
        let size_bytes = tokio::fs::metadata(&path).await?.len();
        log.push(format!("wrote {} ({})", path.display(), format_size(size_bytes)));
        log.push(format!("sha256 {checksum}"));

        let record = BackupRecord {
            id,
            node_id: node.id.clone(),
            path,
            checksum,
            size_bytes,
            created_at,
            kind,
            file_count: tree.len(),
            log,
        };
        self.catalog.insert_backup(record.clone()).await?;
        info!("{}: {} backup {} ({})", node.id, kind.as_str(), record.id, format_size(size_bytes));
        Ok(record)
    }

    /// Newest first, capped at `limit` or the configured display cap.
    pub async fn list_backups(&self, node_id: &str, limit: Option<usize>) -> Vec<BackupRecord> {
        self.catalog
            .backups_for_node(node_id, Some(limit.unwrap_or(self.list_limit)))
            .await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        self.catalog
            .get_backup(backup_id)
            .await
            .ok_or_else(|| WardenError::NotFound(format!("backup {backup_id}")))
    }

    /// Recomputes the archive checksum and compares it to the catalog.
    pub async fn verify_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        let record = self.get_backup(backup_id).await?;
        self.load_verified(&record).await?;
        Ok(record)
    }

    /// Reads and unpacks an archive once its checksum matches.
    pub async fn load_verified(&self, record: &BackupRecord) -> Result<ConfigTree> {
        let bytes = match tokio::fs::read(&record.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WardenError::NotFound(format!("archive {}", record.path.display())))
            }
            Err(e) => return Err(e.into()),
        };
        let actual = archive::sha256_hex(&bytes);
        if actual != record.checksum {
            return Err(WardenError::Corruption {
                backup_id: record.id.clone(),
                expected: record.checksum.clone(),
                actual,
            });
        }
        archive::unpack(&bytes).map_err(|source| WardenError::Archive {
            path: Some(record.path.clone()),
            source,
        })
    }

    // --- restore ---

    /// Restores a backup with the full-tree steps.
    pub async fn restore_backup(&self, node_id: &str, backup_id: &str) -> Result<RestoreOutcome> {
        let guard = self.locks.acquire(node_id).await;
        let mut log = OperationLog::new();
        log.transition(OperationState::StrategySelected)
            .map_err(|e| WardenError::Config(e.to_string()))?;
        let request = RestoreRequest {
            backup_id,
            plan: Strategy::FullRestore.plan(),
            diagnosis: None,
            log,
        };
        self.restore_with(&guard, request).await?.into_result()
    }

    /// The restore primitive. The caller holds the node and has already moved
    /// the log to `STRATEGY_SELECTED`. Always records a restore attempt; `Err`
    /// is reserved for failures to read or write the catalog itself.
    pub async fn restore_with(&self, guard: &NodeGuard, request: RestoreRequest<'_>) -> Result<RestoreOutcome> {
        let started_at = OffsetDateTime::now_utc();
        let node = self.catalog.require_node(guard.node_id()).await?;
        let RestoreRequest {
            backup_id,
            plan,
            diagnosis,
            mut log,
        } = request;
        info!("{}: restore of {} with {} started", node.id, backup_id, plan.strategy);

        let mut run = RestoreRun {
            snapshot: None,
            verification: None,
            abort: None,
        };
        self.drive(guard, &node, backup_id, plan, &mut log, &mut run).await;

        let current_snapshot = run.snapshot.as_ref().map(|s| s.id.as_str());
        if let Err(e) = self.prune_snapshots(guard, current_snapshot).await {
            warn!("{}: snapshot pruning failed: {}", node.id, e);
        }

        let attempt = RestoreAttempt {
            id: Uuid::new_v4().to_string(),
            node_id: node.id.clone(),
            backup_id: Some(backup_id.to_string()),
            diagnosis,
            strategy: plan.strategy,
            status: log.state(),
            rollback_path: run.snapshot.as_ref().map(|s| s.path.clone()),
            snapshot_backup_id: run.snapshot.as_ref().map(|s| s.id.clone()),
            log: log.into_steps(),
            started_at,
            finished_at: OffsetDateTime::now_utc(),
        };
        self.catalog.append_restore_attempt(attempt.clone()).await?;
        info!("{}: restore {} finished as {}", node.id, attempt.id, attempt.status);

        if attempt.status == OperationState::RolledBackFailed {
            error!("{}: rollback failed, node needs manual attention", node.id);
            if let Err(e) = self
                .monitor
                .force_status(&node.id, NodeStatus::NeedsManualAttention)
                .await
            {
                warn!("{}: could not mark node for manual attention: {}", node.id, e);
            }
        }

        Ok(RestoreOutcome {
            attempt,
            snapshot: run.snapshot,
            verification: run.verification,
            abort: run.abort,
        })
    }

    /// Runs the operation up to a terminal state. Never returns early without one.
    async fn drive(
        &self,
        guard: &NodeGuard,
        node: &Node,
        backup_id: &str,
        plan: RestorePlan,
        log: &mut OperationLog,
        run: &mut RestoreRun,
    ) {
        // Integrity first: nothing leaves the controller for a bad archive.
        let target = match self.resolve_target(node, backup_id).await {
            Ok((record, tree)) => {
                log.ok("verify checksum", format!("{} matches {}", record.id, record.checksum));
                tree
            }
            Err(e) => return abort(log, run, "verify checksum", e),
        };

        if let Err(e) = self.control.ping(node).await {
            return abort(log, run, "confirm connectivity", WardenError::remote(&node.id, "confirm connectivity", e));
        }
        log.ok("confirm connectivity", node.host.destination());

        let (snapshot_record, snapshot_tree) = match self.snapshot(node).await {
            Ok(snapshot) => snapshot,
            Err(e) => return abort(log, run, "pre-restore snapshot", e),
        };
        log.ok(
            "pre-restore snapshot",
            format!("{} ({} files) at {}", snapshot_record.id, snapshot_record.file_count, snapshot_record.path.display()),
        );
        run.snapshot = Some(snapshot_record);
        advance(log, OperationState::SnapshotTaken);

        let applied = match plan.scope {
            ApplyScope::FullTree => target.clone(),
            ApplyScope::MainFile => match target.get(&self.config_file) {
                Some(file) => {
                    let mut merged = snapshot_tree.clone();
                    merged.insert_with_mode(self.config_file.clone(), file.mode, file.contents.clone());
                    merged
                }
                None => {
                    let e = WardenError::NotFound(format!("{} in backup {}", self.config_file, backup_id));
                    return abort(log, run, "select main configuration file", e);
                }
            },
        };

        advance(log, OperationState::Applying);

        if plan.emergency_first {
            match self.emergency_steps(guard, node, log).await {
                Ok(verification) if verification.passed => {
                    run.verification = Some(verification);
                    advance(log, OperationState::Succeeded);
                    return;
                }
                Ok(verification) => {
                    log.fail("verify", verification.evidence.join("; "));
                    run.verification = Some(verification);
                    log.ok("escalate", format!("{} -> {}", Strategy::Emergency, Strategy::FullRestore));
                    advance(log, OperationState::Applying);
                }
                Err(e) => {
                    log.fail("emergency", e.to_string());
                    return self.rollback(guard, node, &snapshot_tree, log, run).await;
                }
            }
        }

        if let Err(e) = self.apply(node, &applied, plan, log).await {
            log.fail("apply", e.to_string());
            return self.rollback(guard, node, &snapshot_tree, log, run).await;
        }

        advance(log, OperationState::Verifying);
        match self.monitor.verify(guard).await {
            Ok(verification) if verification.passed => {
                log.ok("verify", verification.evidence.join("; "));
                run.verification = Some(verification);
                advance(log, OperationState::Succeeded);
            }
            Ok(verification) => {
                log.fail("verify", verification.evidence.join("; "));
                run.verification = Some(verification);
                self.rollback(guard, node, &snapshot_tree, log, run).await;
            }
            Err(e) => {
                log.fail("verify", e.to_string());
                self.rollback(guard, node, &snapshot_tree, log, run).await;
            }
        }
    }

    async fn resolve_target(&self, node: &Node, backup_id: &str) -> Result<(BackupRecord, ConfigTree)> {
        let record = self.get_backup(backup_id).await?;
        if record.node_id != node.id {
            return Err(WardenError::NotFound(format!("backup {} for node {}", backup_id, node.id)));
        }
        let tree = self.load_verified(&record).await?;
        Ok((record, tree))
    }

    async fn snapshot(&self, node: &Node) -> Result<(BackupRecord, ConfigTree)> {
        let tree = self
            .control
            .read_config_tree(node)
            .await
            .map_err(|e| WardenError::remote(&node.id, "pre-restore snapshot", e))?;
        let record = self
            .store(node, &tree, BackupKind::PreRestore, vec![format!("snapshot of {} files before restore", tree.len())])
            .await?;
        Ok((record, tree))
    }

    /// Free disk space, forced restart, verification. Cleanup commands are best-effort.
    async fn emergency_steps(&self, guard: &NodeGuard, node: &Node, log: &mut OperationLog) -> Result<Verification> {
        let outcomes = self
            .control
            .free_disk_space(node)
            .await
            .map_err(|e| WardenError::remote(&node.id, "free disk space", e))?;
        for outcome in outcomes {
            if outcome.ok {
                log.ok("free disk space", outcome.command);
            } else {
                log.fail("free disk space", format!("{} (ignored): {}", outcome.command, outcome.detail));
            }
        }
        self.control
            .restart_service(node, true)
            .await
            .map_err(|e| WardenError::remote(&node.id, "forced restart", e))?;
        log.ok("forced restart", "");
        advance(log, OperationState::Verifying);
        self.monitor.verify(guard).await
    }

    async fn apply(&self, node: &Node, tree: &ConfigTree, plan: RestorePlan, log: &mut OperationLog) -> Result<()> {
        self.control
            .stop_service(node)
            .await
            .map_err(|e| WardenError::remote(&node.id, "stop service", e))?;
        log.ok("stop service", "");

        if plan.reinstall {
            self.control
                .reinstall_program(node)
                .await
                .map_err(|e| WardenError::remote(&node.id, "reinstall program", e))?;
            log.ok("reinstall program", "");
        }

        self.write_and_confirm(node, tree, log).await?;

        if plan.force_restart {
            self.control
                .restart_service(node, true)
                .await
                .map_err(|e| WardenError::remote(&node.id, "forced restart", e))?;
            log.ok("forced restart", "");
        } else {
            self.control
                .start_service(node)
                .await
                .map_err(|e| WardenError::remote(&node.id, "start service", e))?;
            log.ok("start service", "");
        }
        Ok(())
    }

    /// Writes a tree, fixes permissions and reads it back.
    async fn write_and_confirm(&self, node: &Node, tree: &ConfigTree, log: &mut OperationLog) -> Result<()> {
        let scope = match tree.get(&self.config_file) {
            Some(_) => format!("{} files", tree.len()),
            None => format!("{} files, no {}", tree.len(), self.config_file),
        };
        self.control
            .write_config_tree(node, tree)
            .await
            .map_err(|e| WardenError::remote(&node.id, "apply configuration", e))?;
        log.ok("apply configuration", scope);

        self.control
            .fix_permissions(node)
            .await
            .map_err(|e| WardenError::remote(&node.id, "fix permissions", e))?;
        log.ok("fix permissions", "");

        let read_back = self
            .control
            .read_config_tree(node)
            .await
            .map_err(|e| WardenError::remote(&node.id, "confirm configuration", e))?;
        let (expected, actual) = (tree.content_digest(), read_back.content_digest());
        if expected != actual {
            return Err(WardenError::Verification(format!(
                "applied configuration differs from the archive (expected {expected}, found {actual})"
            )));
        }
        log.ok("confirm configuration", expected);
        Ok(())
    }

    /// Reapplies the snapshot and checks the node came back.
    async fn rollback(&self, guard: &NodeGuard, node: &Node, snapshot: &ConfigTree, log: &mut OperationLog, run: &mut RestoreRun) {
        warn!("{}: rolling back to pre-restore snapshot", node.id);
        advance(log, OperationState::RollingBack);

        match self.reapply_snapshot(guard, node, snapshot, log).await {
            Ok(verification) if verification.passed => {
                log.ok("verify after rollback", verification.evidence.join("; "));
                run.verification = Some(verification);
                advance(log, OperationState::RolledBackSucceeded);
            }
            Ok(verification) => {
                log.fail("verify after rollback", verification.evidence.join("; "));
                run.verification = Some(verification);
                advance(log, OperationState::RolledBackFailed);
            }
            Err(e) => {
                log.fail("rollback", WardenError::RollbackFailure(e.to_string()).to_string());
                advance(log, OperationState::RolledBackFailed);
            }
        }
    }

    async fn reapply_snapshot(&self, guard: &NodeGuard, node: &Node, snapshot: &ConfigTree, log: &mut OperationLog) -> Result<Verification> {
        // The service may already be down; a failed stop does not block the rollback.
        if let Err(e) = self.control.stop_service(node).await {
            log.fail("stop service", format!("ignored: {e}"));
        }
        self.write_and_confirm(node, snapshot, log).await?;
        self.control
            .restart_service(node, true)
            .await
            .map_err(|e| WardenError::remote(&node.id, "restart after rollback", e))?;
        log.ok("restart after rollback", "");
        self.monitor.verify(guard).await
    }

    /// Drops the oldest pre-restore snapshots beyond the retention limit.
    /// `current` is the snapshot of the operation in progress and is never
    /// pruned, even with a limit of zero.
    pub async fn prune_snapshots(&self, guard: &NodeGuard, current: Option<&str>) -> Result<usize> {
        let Some(keep) = self.retention.max_pre_restore_snapshots else {
            return Ok(0);
        };
        let snapshots: Vec<BackupRecord> = self
            .catalog
            .backups_for_node(guard.node_id(), None)
            .await
            .into_iter()
            .filter(|b| b.kind == BackupKind::PreRestore)
            .collect();

        let mut pruned = 0;
        for record in snapshots.into_iter().skip(keep) {
            if Some(record.id.as_str()) == current {
                continue;
            }
            remove_archive(&record.path).await;
            self.catalog.remove_backup(&record.id).await?;
            pruned += 1;
        }
        if pruned > 0 {
            info!("{}: pruned {} pre-restore snapshots", guard.node_id(), pruned);
        }
        Ok(pruned)
    }
}

struct RestoreRun {
    snapshot: Option<BackupRecord>,
    verification: Option<Verification>,
    abort: Option<WardenError>,
}

fn abort(log: &mut OperationLog, run: &mut RestoreRun, step: &str, error: WardenError) {
    warn!("operation aborted at '{}': {}", step, error);
    log.fail(step, error.to_string());
    advance(log, OperationState::Aborted);
    run.abort = Some(error);
}

/// Transitions are fixed by the code paths in this module; a refusal is a bug,
/// logged rather than allowed to leave the operation without a terminal state.
fn advance(log: &mut OperationLog, next: OperationState) {
    if let Err(e) = log.transition(next) {
        error!("{}", e);
        log.fail("state machine", e.to_string());
    }
}

async fn remove_archive(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not delete {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthPolicy, MonitorSettings};
    use crate::error::RemoteError;
    use crate::models::HostRef;
    use crate::remote::ServiceState;
    use crate::testkit::{FakeFleet, FakeNode};

    struct Fixture {
        fleet: FakeFleet,
        catalog: Catalog,
        engine: BackupEngine,
        _dir: tempfile::TempDir,
    }

    async fn fixture(retention: RetentionPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("data")).await.unwrap();
        catalog.register_node(Node::new("pc-a", HostRef::new("192.168.3.73", "openclaw01"))).await.unwrap();
        let fleet = FakeFleet::new("openclaw.json");
        fleet.add_node("pc-a", FakeNode::healthy());

        let control: Arc<dyn NodeControl> = Arc::new(fleet.clone());
        let locks = NodeLocks::new();
        let policy = HealthPolicy {
            verify_interval_secs: 0,
            verify_settle_secs: 0,
            ..HealthPolicy::default()
        };
        let monitor = Arc::new(HealthMonitor::new(control.clone(), catalog.clone(), locks.clone(), policy, MonitorSettings::default()));
        let engine = BackupEngine::new(control, catalog.clone(), locks, monitor, dir.path().join("backups"), retention, "openclaw.json", 3);
        Fixture {
            fleet,
            catalog,
            engine,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_create_backup_checksum_matches_file() {
        let fx = fixture(RetentionPolicy::default()).await;
        let record = fx.engine.create_backup("pc-a", BackupKind::Manual).await.unwrap();

        assert_eq!(archive::checksum_file(&record.path).await.unwrap(), record.checksum);
        assert_eq!(record.file_count, 2);
        let name = record.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("pc-a-") && name.ends_with(".tar.gz"));
        fx.engine.verify_backup(&record.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_backups_is_capped() {
        let fx = fixture(RetentionPolicy::default()).await;
        for _ in 0..4 {
            fx.engine.create_backup("pc-a", BackupKind::Manual).await.unwrap();
        }
        assert_eq!(fx.engine.list_backups("pc-a", None).await.len(), 3);
        assert_eq!(fx.engine.list_backups("pc-a", Some(10)).await.len(), 4);
    }

    #[tokio::test]
    async fn test_restore_unmodified_backup_reproduces_files() {
        let fx = fixture(RetentionPolicy::default()).await;
        let record = fx.engine.create_backup("pc-a", BackupKind::Manual).await.unwrap();
        let original = fx.fleet.tree("pc-a");

        fx.fleet.update_node("pc-a", |n| {
            n.tree.insert("openclaw.json", b"{ broken".to_vec());
            n.service = ServiceState::Failed;
        });

        let outcome = fx.engine.restore_backup("pc-a", &record.id).await.unwrap();
        assert_eq!(outcome.attempt.status, OperationState::Succeeded);
        assert_eq!(fx.fleet.tree("pc-a"), original);
        assert!(outcome.snapshot.is_some());

        assert_eq!(
            fx.fleet.mutations("pc-a"),
            vec!["stop_service", "write_config_tree", "fix_permissions", "start_service"]
        );
    }

    #[tokio::test]
    async fn test_corrupt_archive_aborts_without_touching_node() {
        let fx = fixture(RetentionPolicy::default()).await;
        let record = fx.engine.create_backup("pc-a", BackupKind::Manual).await.unwrap();

        let mut bytes = std::fs::read(&record.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&record.path, bytes).unwrap();
        fx.fleet.clear_calls("pc-a");

        let err = fx.engine.restore_backup("pc-a", &record.id).await.unwrap_err();
        assert_eq!(err.kind(), "corruption");
        assert!(fx.fleet.calls("pc-a").is_empty());

        let attempts = fx.catalog.restore_attempts_for_node("pc-a", None).await;
        assert_eq!(attempts[0].status, OperationState::Aborted);
        assert!(attempts[0].snapshot_backup_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_backup_is_not_found() {
        let fx = fixture(RetentionPolicy::default()).await;
        let err = fx.engine.restore_backup("pc-a", "does-not-exist").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(fx.fleet.mutations("pc-a").is_empty());
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back_to_snapshot() {
        let fx = fixture(RetentionPolicy::default()).await;
        fx.fleet.update_node("pc-a", |n| {
            n.tree = ConfigTree::new().with_file("openclaw.json", br#"{"gateway":{"port":1}}"#.to_vec());
        });
        let record = fx.engine.create_backup("pc-a", BackupKind::Manual).await.unwrap();
        fx.fleet.update_node("pc-a", |n| n.tree.insert("notes.md", b"live edit".to_vec()));
        let before = fx.fleet.tree("pc-a");

        fx.fleet.fail_next(
            "pc-a",
            "fix_permissions",
            RemoteError::Command { command: "chmod".into(), exit_code: 1, stderr: "Operation not permitted".into() },
        );
        let outcome = fx.engine.restore_backup("pc-a", &record.id).await.unwrap();

        assert_eq!(outcome.attempt.status, OperationState::RolledBackSucceeded);
        assert_eq!(fx.fleet.tree("pc-a").content_digest(), before.content_digest());
        assert_eq!(fx.catalog.get_node("pc-a").await.unwrap().status, NodeStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failed_rollback_needs_manual_attention() {
        let fx = fixture(RetentionPolicy::default()).await;
        let record = fx.engine.create_backup("pc-a", BackupKind::Manual).await.unwrap();
        fx.fleet.update_node("pc-a", |n| n.start_blocked = true);

        let outcome = fx.engine.restore_backup("pc-a", &record.id).await.unwrap();
        assert_eq!(outcome.attempt.status, OperationState::RolledBackFailed);
        assert_eq!(
            fx.catalog.get_node("pc-a").await.unwrap().status,
            NodeStatus::NeedsManualAttention
        );
    }

    #[tokio::test]
    async fn test_attempt_is_recorded_when_status_write_fails() {
        let fx = fixture(RetentionPolicy::default()).await;
        let record = fx.engine.create_backup("pc-a", BackupKind::Manual).await.unwrap();
        fx.fleet.update_node("pc-a", |n| n.start_blocked = true);

        // Node writes fail from here on; restore logs are a separate file.
        let nodes_file = fx.catalog.data_dir().join("nodes.json");
        std::fs::remove_file(&nodes_file).unwrap();
        std::fs::create_dir(&nodes_file).unwrap();

        let outcome = fx.engine.restore_backup("pc-a", &record.id).await.unwrap();
        assert_eq!(outcome.attempt.status, OperationState::RolledBackFailed);

        let attempts = fx.catalog.restore_attempts_for_node("pc-a", None).await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].id, outcome.attempt.id);
        assert_eq!(attempts[0].status, OperationState::RolledBackFailed);
    }

    #[tokio::test]
    async fn test_zero_retention_keeps_current_snapshot() {
        let fx = fixture(RetentionPolicy {
            max_pre_restore_snapshots: Some(0),
        })
        .await;
        let record = fx.engine.create_backup("pc-a", BackupKind::Manual).await.unwrap();
        let first = fx.engine.restore_backup("pc-a", &record.id).await.unwrap();
        let first_snapshot = first.attempt.rollback_path.clone().unwrap();
        assert!(first_snapshot.exists());

        fx.fleet.update_node("pc-a", |n| n.start_blocked = true);
        let failed = fx.engine.restore_backup("pc-a", &record.id).await.unwrap();
        assert_eq!(failed.attempt.status, OperationState::RolledBackFailed);

        let rollback_path = failed.attempt.rollback_path.clone().unwrap();
        assert!(rollback_path.exists());
        assert!(!first_snapshot.exists());
        let snapshot_id = failed.attempt.snapshot_backup_id.clone().unwrap();
        assert!(fx.catalog.get_backup(&snapshot_id).await.is_some());
    }

    #[tokio::test]
    async fn test_snapshots_are_pruned_oldest_first() {
        let fx = fixture(RetentionPolicy {
            max_pre_restore_snapshots: Some(1),
        })
        .await;
        let record = fx.engine.create_backup("pc-a", BackupKind::Manual).await.unwrap();
        let first = fx.engine.restore_backup("pc-a", &record.id).await.unwrap();
        let second = fx.engine.restore_backup("pc-a", &record.id).await.unwrap();

        let snapshots: Vec<BackupRecord> = fx
            .catalog
            .backups_for_node("pc-a", None)
            .await
            .into_iter()
            .filter(|b| b.kind == BackupKind::PreRestore)
            .collect();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, second.snapshot.unwrap().id);
        assert!(!first.snapshot.unwrap().path.exists());
        assert!(fx.catalog.get_backup(&record.id).await.is_some());
    }
}
