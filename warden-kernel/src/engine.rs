//! Wiring of the engine components around one [`NodeControl`].

use std::sync::Arc;
use tracing::info;

use crate::backup::BackupEngine;
use crate::catalog::Catalog;
use crate::config::{Transport, WardenConfig};
use crate::diagnose::Diagnoser;
use crate::error::Result;
use crate::executor::{LocalExecutor, SshExecutor};
use crate::health::HealthMonitor;
use crate::models::Node;
use crate::recovery::RecoveryStrategist;
use crate::remote::{NodeControl, ShellControl};
use crate::state::NodeLocks;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct Warden {
    pub config: Arc<WardenConfig>,
    pub catalog: Catalog,
    pub locks: NodeLocks,
    pub monitor: Arc<HealthMonitor>,
    pub backups: Arc<BackupEngine>,
    pub strategist: Arc<RecoveryStrategist>,
}

/// The production node boundary for the configured transport.
pub fn shell_control(config: &WardenConfig) -> Arc<dyn NodeControl> {
    match config.transport {
        Transport::Ssh => Arc::new(ShellControl::new(
            SshExecutor::new(config.ssh.clone()),
            config.program.clone(),
            config.timeouts.clone(),
        )),
        Transport::Local => Arc::new(ShellControl::new(LocalExecutor, config.program.clone(), config.timeouts.clone())),
    }
}

impl Warden {
    /// Opens the catalog and registers every node listed in the configuration.
    pub async fn build(config: WardenConfig, control: Arc<dyn NodeControl>) -> Result<Self> {
        config.validate()?;
        let catalog = Catalog::open(&config.data_dir).await?;
        for (id, host) in &config.nodes {
            catalog.register_node(Node::new(id.clone(), host.clone())).await?;
        }

        let locks = NodeLocks::new();
        let monitor = Arc::new(HealthMonitor::new(
            control.clone(),
            catalog.clone(),
            locks.clone(),
            config.policy.clone(),
            config.monitor.clone(),
        ));
        let backups = Arc::new(BackupEngine::new(
            control.clone(),
            catalog.clone(),
            locks.clone(),
            monitor.clone(),
            config.backup_dir.clone(),
            config.retention.clone(),
            config.program.config_file.clone(),
            config.backup.list_limit,
        ));
        let diagnoser = Diagnoser::new(control, config.policy.clone(), config.program.config_file.clone());
        let strategist = Arc::new(RecoveryStrategist::new(
            catalog.clone(),
            locks.clone(),
            monitor.clone(),
            diagnoser,
            backups.clone(),
        ));
        info!("warden ready: {} nodes under management", catalog.list_nodes().await.len());

        Ok(Self {
            config: Arc::new(config),
            catalog,
            locks,
            monitor,
            backups,
            strategist,
        })
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(
            self.catalog.clone(),
            self.monitor.clone(),
            self.backups.clone(),
            self.strategist.clone(),
            self.config.monitor.clone(),
            self.config.backup.clone(),
            self.config.recovery.clone(),
        ))
    }
}
