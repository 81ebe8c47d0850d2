//! Fleet catalog: nodes, backups and restore logs, each persisted as one
//! pretty-printed JSON file in the data directory.
//!
//! Writes replace the whole file through a temp file + rename, so a crash
//! mid-write leaves the previous version intact.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, WardenError};
use crate::models::{BackupRecord, Node, NodeStatus, RestoreAttempt};

const NODES_FILE: &str = "nodes.json";
const BACKUPS_FILE: &str = "backups.json";
const RESTORE_LOGS_FILE: &str = "restore_logs.json";

pub type NodesMap = HashMap<String, Node>;

#[derive(Clone)]
pub struct Catalog {
    data_dir: PathBuf,
    nodes: Arc<RwLock<NodesMap>>,
    backups: Arc<RwLock<Vec<BackupRecord>>>,
    restore_logs: Arc<RwLock<Vec<RestoreAttempt>>>,
}

/// Summary returned by [`Catalog::latest_status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub node_id: String,
    pub status: NodeStatus,
    pub score: u8,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked: Option<OffsetDateTime>,
}

impl Catalog {
    /// Opens (or creates) the catalog under `data_dir`.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let nodes: NodesMap = load_json(&data_dir.join(NODES_FILE)).await?;
        let backups: Vec<BackupRecord> = load_json(&data_dir.join(BACKUPS_FILE)).await?;
        let restore_logs: Vec<RestoreAttempt> = load_json(&data_dir.join(RESTORE_LOGS_FILE)).await?;
        info!(
            "catalog loaded from {}: {} nodes, {} backups, {} restore logs",
            data_dir.display(),
            nodes.len(),
            backups.len(),
            restore_logs.len()
        );

        Ok(Self {
            data_dir,
            nodes: Arc::new(RwLock::new(nodes)),
            backups: Arc::new(RwLock::new(backups)),
            restore_logs: Arc::new(RwLock::new(restore_logs)),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // --- nodes ---

    /// Registers a node. Re-registering keeps history and only updates the host.
    pub async fn register_node(&self, node: Node) -> Result<Node> {
        let mut nodes = self.nodes.write().await;
        let stored = match nodes.get_mut(&node.id) {
            Some(existing) => {
                existing.host = node.host;
                existing.clone()
            }
            None => {
                info!("registered node {} ({})", node.id, node.host.destination());
                nodes.insert(node.id.clone(), node.clone());
                node
            }
        };
        save_json(&self.data_dir.join(NODES_FILE), &*nodes).await?;
        Ok(stored)
    }

    pub async fn retire_node(&self, node_id: &str) -> Result<Node> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .remove(node_id)
            .ok_or_else(|| WardenError::NotFound(format!("node {node_id}")))?;
        save_json(&self.data_dir.join(NODES_FILE), &*nodes).await?;
        info!("retired node {}", node_id);
        Ok(node)
    }

    pub async fn get_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().await.get(node_id).cloned()
    }

    pub async fn require_node(&self, node_id: &str) -> Result<Node> {
        self.get_node(node_id)
            .await
            .ok_or_else(|| WardenError::NotFound(format!("node {node_id}")))
    }

    /// All nodes, sorted by id.
    pub async fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn latest_status(&self, node_id: &str) -> Option<StatusSummary> {
        self.nodes.read().await.get(node_id).map(|node| StatusSummary {
            node_id: node.id.clone(),
            status: node.status,
            score: node.last_score,
            last_checked: node.last_checked,
        })
    }

    /// Applies `update` to one node and persists. Returns the node before and after.
    /// Memory only changes once the file is written.
    pub async fn update_node<F>(&self, node_id: &str, update: F) -> Result<(Node, Node)>
    where
        F: FnOnce(&mut Node),
    {
        let mut nodes = self.nodes.write().await;
        let before = nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| WardenError::NotFound(format!("node {node_id}")))?;
        let mut after = before.clone();
        update(&mut after);

        let mut staged = nodes.clone();
        staged.insert(node_id.to_string(), after.clone());
        save_json(&self.data_dir.join(NODES_FILE), &staged).await?;
        *nodes = staged;
        Ok((before, after))
    }

    // --- backups ---

    pub async fn insert_backup(&self, record: BackupRecord) -> Result<()> {
        let mut backups = self.backups.write().await;
        backups.push(record);
        save_json(&self.data_dir.join(BACKUPS_FILE), &*backups).await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Option<BackupRecord> {
        self.backups.read().await.iter().find(|b| b.id == backup_id).cloned()
    }

    /// Newest first. `None` returns every backup of the node.
    pub async fn backups_for_node(&self, node_id: &str, limit: Option<usize>) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = self
            .backups
            .read()
            .await
            .iter()
            .filter(|b| b.node_id == node_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for backups taken within the same instant.
        records.reverse();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        records
    }

    pub async fn remove_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        let mut backups = self.backups.write().await;
        let index = backups
            .iter()
            .position(|b| b.id == backup_id)
            .ok_or_else(|| WardenError::NotFound(format!("backup {backup_id}")))?;
        let record = backups.remove(index);
        save_json(&self.data_dir.join(BACKUPS_FILE), &*backups).await?;
        Ok(record)
    }

    // --- restore logs ---

    pub async fn append_restore_attempt(&self, attempt: RestoreAttempt) -> Result<()> {
        let mut logs = self.restore_logs.write().await;
        debug!("restore attempt {} on {}: {}", attempt.id, attempt.node_id, attempt.status);
        logs.push(attempt);
        save_json(&self.data_dir.join(RESTORE_LOGS_FILE), &*logs).await
    }

    /// Newest first.
    pub async fn restore_attempts_for_node(&self, node_id: &str, limit: Option<usize>) -> Vec<RestoreAttempt> {
        let logs = self.restore_logs.read().await;
        let iter = logs.iter().rev().filter(|a| a.node_id == node_id).cloned();
        match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

async fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        debug!("no {} yet, starting fresh", path.display());
        return Ok(T::default());
    }
    let content = tokio::fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&content)?)
}

async fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackupKind, HostRef};
    use time::Duration;

    fn backup(id: &str, node_id: &str, age_minutes: i64, kind: BackupKind) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            node_id: node_id.to_string(),
            path: PathBuf::from(format!("/tmp/{id}.tar.gz")),
            checksum: "00".repeat(32),
            size_bytes: 128,
            created_at: OffsetDateTime::now_utc() - Duration::minutes(age_minutes),
            kind,
            file_count: 1,
            log: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_nodes_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        catalog
            .register_node(Node::new("pc-a", HostRef::new("192.168.3.73", "openclaw01")))
            .await
            .unwrap();
        catalog.update_node("pc-a", |n| n.status = NodeStatus::Warning).await.unwrap();

        let reopened = Catalog::open(dir.path()).await.unwrap();
        let node = reopened.get_node("pc-a").await.unwrap();
        assert_eq!(node.status, NodeStatus::Warning);
        assert!(!dir.path().join("nodes.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_reregistration_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        catalog.register_node(Node::new("t440", HostRef::new("192.168.3.33", "linou"))).await.unwrap();
        catalog.update_node("t440", |n| n.last_score = 75).await.unwrap();

        let node = catalog
            .register_node(Node::new("t440", HostRef::new("192.168.3.34", "linou")))
            .await
            .unwrap();
        assert_eq!(node.last_score, 75);
        assert_eq!(node.host.host, "192.168.3.34");
    }

    #[tokio::test]
    async fn test_failed_save_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        catalog.register_node(Node::new("pc-a", HostRef::new("192.168.3.73", "openclaw01"))).await.unwrap();

        // A directory in place of the file makes the rename fail.
        std::fs::remove_file(dir.path().join(NODES_FILE)).unwrap();
        std::fs::create_dir(dir.path().join(NODES_FILE)).unwrap();

        let err = catalog.update_node("pc-a", |n| n.status = NodeStatus::Error).await.unwrap_err();
        assert_eq!(err.kind(), "io");
        assert_eq!(catalog.get_node("pc-a").await.unwrap().status, NodeStatus::Unknown);
    }

    #[tokio::test]
    async fn test_update_missing_node_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        let err = catalog.update_node("ghost", |n| n.status = NodeStatus::Healthy).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_backups_newest_first_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        catalog.insert_backup(backup("old", "pc-a", 30, BackupKind::Manual)).await.unwrap();
        catalog.insert_backup(backup("new", "pc-a", 1, BackupKind::Manual)).await.unwrap();
        catalog.insert_backup(backup("mid", "pc-a", 10, BackupKind::Scheduled)).await.unwrap();
        catalog.insert_backup(backup("other", "t440", 0, BackupKind::Manual)).await.unwrap();

        let ids: Vec<String> = catalog.backups_for_node("pc-a", Some(2)).await.into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec!["new", "mid"]);
        assert_eq!(catalog.backups_for_node("pc-a", None).await.len(), 3);
        assert!(catalog.get_backup("old").await.is_some());

        catalog.remove_backup("old").await.unwrap();
        assert!(catalog.get_backup("old").await.is_none());
    }
}
