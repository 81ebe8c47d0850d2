//! Controller configuration (`warden.yaml`).
//!
//! Located through `WARDEN_CONFIG`, defaults to `./warden.yaml`. A missing or
//! empty file yields the defaults; every section can be omitted.
//!
//! ```yaml
//! data_dir: ./data
//! backup_dir: ./backups
//! listen: 0.0.0.0:8080
//! nodes:
//!   pc-a: { host: 192.168.3.73, user: openclaw01 }
//!   t440: { host: 192.168.3.33, user: linou, port: 22 }
//! program:
//!   binary: openclaw
//!   service: openclaw-gateway
//!   config_dir: ~/.openclaw
//!   listen_port: 18789
//! monitor: { interval_secs: 300, workers: 4 }
//! retention: { max_pre_restore_snapshots: 10 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::error::WardenError;
use crate::executor::SshSettings;
use crate::models::HostRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub listen: String,
    pub transport: Transport,
    pub ssh: SshSettings,
    pub nodes: BTreeMap<String, HostRef>,
    pub program: ProgramProfile,
    pub monitor: MonitorSettings,
    pub policy: HealthPolicy,
    pub timeouts: Timeouts,
    pub retention: RetentionPolicy,
    pub backup: BackupSettings,
    pub recovery: RecoverySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ssh,
    /// Run commands on the controller itself.
    Local,
}

/// Where and how the managed program lives on every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramProfile {
    pub binary: String,
    pub service: String,
    /// `systemctl --user` when true, `sudo -n systemctl` otherwise.
    pub user_service: bool,
    /// Configuration tree root; `~/` is expanded on the node.
    pub config_dir: String,
    /// Main configuration file, relative to `config_dir`. Must parse as JSON.
    pub config_file: String,
    pub listen_port: u16,
    /// Files (relative to `config_dir`) restricted to mode 0600 after a restore.
    pub private_files: Vec<String>,
    pub install_command: String,
    /// Best-effort commands run by the emergency strategy to free disk space.
    pub cleanup_commands: Vec<String>,
    /// How far back service logs are read during diagnosis.
    pub log_window_minutes: u32,
}

impl Default for ProgramProfile {
    fn default() -> Self {
        Self {
            binary: "openclaw".to_string(),
            service: "openclaw-gateway".to_string(),
            user_service: true,
            config_dir: "~/.openclaw".to_string(),
            config_file: "openclaw.json".to_string(),
            listen_port: 18789,
            private_files: vec!["auth-profiles.json".to_string()],
            install_command: "npm install -g openclaw@latest --no-audit --no-fund".to_string(),
            cleanup_commands: vec![
                "journalctl --user --vacuum-size=100M".to_string(),
                "rm -rf \"$HOME/.npm/_cacache\"".to_string(),
            ],
            log_window_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    /// Pause after a failed sweep before trying again.
    pub error_backoff_secs: u64,
    /// Concurrent per-node checks during a sweep.
    pub workers: usize,
    /// Health data older than this is not trusted for diagnosis.
    pub stale_after_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            error_backoff_secs: 60,
            workers: 4,
            stale_after_secs: 600,
        }
    }
}

/// Score thresholds and verification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    pub healthy_min: u8,
    pub warning_min: u8,
    pub unstable_min: u8,
    pub disk_critical_percent: f32,
    pub verify_min_score: u8,
    pub verify_attempts: u32,
    pub verify_interval_secs: u64,
    /// Wait after (re)starting the service before the first verification probe.
    pub verify_settle_secs: u64,
    /// Minimum score for a node to accept new workload.
    pub ready_min_score: u8,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            healthy_min: 90,
            warning_min: 70,
            unstable_min: 50,
            disk_critical_percent: 90.0,
            verify_min_score: 75,
            verify_attempts: 3,
            verify_interval_secs: 5,
            verify_settle_secs: 5,
            ready_min_score: 70,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub probe_secs: u64,
    pub command_secs: u64,
    /// Archive transfer and reinstall.
    pub transfer_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe_secs: 10,
            command_secs: 60,
            transfer_secs: 600,
        }
    }
}

impl Timeouts {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Pre-restore snapshots kept per node; `None` keeps all of them.
    pub max_pre_restore_snapshots: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Interval of scheduled backups; disabled when unset.
    pub schedule_interval_secs: Option<u64>,
    /// Default number of backups returned by listings.
    pub list_limit: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            schedule_interval_secs: None,
            list_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub auto_recover: bool,
    pub max_attempts: u32,
    pub cooldown_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            auto_recover: false,
            max_attempts: 3,
            cooldown_secs: 3600,
        }
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backup_dir: PathBuf::from("./backups"),
            listen: "0.0.0.0:8080".to_string(),
            transport: Transport::Ssh,
            ssh: SshSettings::default(),
            nodes: BTreeMap::new(),
            program: ProgramProfile::default(),
            monitor: MonitorSettings::default(),
            policy: HealthPolicy::default(),
            timeouts: Timeouts::default(),
            retention: RetentionPolicy::default(),
            backup: BackupSettings::default(),
            recovery: RecoverySettings::default(),
        }
    }
}

impl WardenConfig {
    /// Checks that thresholds are ordered and intervals usable.
    pub fn validate(&self) -> Result<(), WardenError> {
        let p = &self.policy;
        if !(p.healthy_min <= 100 && p.warning_min < p.healthy_min && p.unstable_min < p.warning_min) {
            return Err(WardenError::Config(format!(
                "score thresholds must satisfy unstable < warning < healthy <= 100 (got {}/{}/{})",
                p.unstable_min, p.warning_min, p.healthy_min
            )));
        }
        if p.verify_min_score > 100 || p.ready_min_score > 100 {
            return Err(WardenError::Config("scores are capped at 100".into()));
        }
        if p.verify_attempts == 0 {
            return Err(WardenError::Config("policy.verify_attempts must be at least 1".into()));
        }
        if self.monitor.workers == 0 {
            return Err(WardenError::Config("monitor.workers must be at least 1".into()));
        }
        if self.monitor.interval_secs == 0 {
            return Err(WardenError::Config("monitor.interval_secs must be greater than 0".into()));
        }
        if self.timeouts.probe_secs == 0 || self.timeouts.command_secs == 0 || self.timeouts.transfer_secs == 0 {
            return Err(WardenError::Config("timeouts must be greater than 0".into()));
        }
        if self.program.config_file.is_empty() || self.program.config_dir.is_empty() {
            return Err(WardenError::Config("program.config_dir and program.config_file are required".into()));
        }
        if self.backup.schedule_interval_secs == Some(0) {
            return Err(WardenError::Config("backup.schedule_interval_secs must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn parse(text: &str) -> Result<Self, WardenError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| WardenError::Config(e.to_string()))
    }
}

pub fn config_path() -> PathBuf {
    std::env::var("WARDEN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("warden.yaml"))
}

/// Loads the configuration file; a missing file means defaults, an invalid one is an error.
pub async fn load_config(path: &Path) -> Result<WardenConfig, WardenError> {
    if !path.exists() {
        warn!("no config at {}, using defaults", path.display());
        return Ok(WardenConfig::default());
    }
    let text = fs::read_to_string(path).await?;
    let config = WardenConfig::parse(&text)?;
    config.validate()?;
    info!("loaded config from {} ({} nodes)", path.display(), config.nodes.len());
    Ok(config)
}
