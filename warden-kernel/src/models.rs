//! Persistent records of the fleet: nodes, backups and restore attempts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;

use crate::diagnose::Diagnosis;
use crate::operation::{OperationState, StepRecord};
use crate::recovery::Strategy;

/// How the controller reaches a node. Credentials stay with the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRef {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl HostRef {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 22,
        }
    }

    /// `user@host`, as handed to the transport.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Healthy,
    Warning,
    Unstable,
    Degraded,
    Offline,
    Error,
    /// Set when a rollback failed. Only an operator acknowledgement clears it.
    NeedsManualAttention,
    /// Registered but never checked.
    Unknown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Healthy => "healthy",
            NodeStatus::Warning => "warning",
            NodeStatus::Unstable => "unstable",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Offline => "offline",
            NodeStatus::Error => "error",
            NodeStatus::NeedsManualAttention => "needs-manual-attention",
            NodeStatus::Unknown => "unknown",
        }
    }

    /// Statuses that warrant diagnosis and recovery.
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            NodeStatus::Unstable | NodeStatus::Degraded | NodeStatus::Offline | NodeStatus::Error
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource usage sampled on the node, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub host: HostRef,
    pub status: NodeStatus,
    pub last_score: u8,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked: Option<OffsetDateTime>,
    pub metrics: Option<ResourceMetrics>,
    pub program_version: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    /// Consecutive automatic recovery attempts since the last success.
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_recovery_at: Option<OffsetDateTime>,
}

impl Node {
    pub fn new(id: impl Into<String>, host: HostRef) -> Self {
        Self {
            id: id.into(),
            host,
            status: NodeStatus::Unknown,
            last_score: 0,
            last_seen: None,
            last_checked: None,
            metrics: None,
            program_version: None,
            registered_at: OffsetDateTime::now_utc(),
            recovery_attempts: 0,
            last_recovery_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    Manual,
    Scheduled,
    PreRestore,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Scheduled => "scheduled",
            BackupKind::PreRestore => "pre-restore",
        }
    }
}

/// Catalog entry for one archive. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub node_id: String,
    pub path: PathBuf,
    /// SHA-256 of the finished archive, lowercase hex.
    pub checksum: String,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub kind: BackupKind,
    pub file_count: usize,
    /// Narrative build log.
    #[serde(default)]
    pub log: Vec<String>,
}

/// One audit record per restore / recovery operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreAttempt {
    pub id: String,
    pub node_id: String,
    pub backup_id: Option<String>,
    pub diagnosis: Option<Diagnosis>,
    pub strategy: Strategy,
    pub status: OperationState,
    /// Path of the pre-restore snapshot archive, if one was taken.
    pub rollback_path: Option<PathBuf>,
    pub snapshot_backup_id: Option<String>,
    pub log: Vec<StepRecord>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

/// Human readable byte size (`512B`, `1.5KB`, `3.2MB`).
pub fn format_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let size = size_bytes as f64;
    if size < KB {
        format!("{size_bytes}B")
    } else if size < KB * KB {
        format!("{:.1}KB", size / KB)
    } else if size < KB * KB * KB {
        format!("{:.1}MB", size / (KB * KB))
    } else {
        format!("{:.1}GB", size / (KB * KB * KB))
    }
}
