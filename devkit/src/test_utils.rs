/*!
Test harness for recovery scenarios

- A complete engine over a [`FakeFleet`], with catalog and archives in a
  temporary directory
- Verification tuned to run without waiting
- Assertions on statuses, audit records and remote mutations
*/

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use warden_kernel::config::WardenConfig;
use warden_kernel::models::{BackupKind, BackupRecord, HostRef, Node, NodeStatus, RestoreAttempt};
use warden_kernel::operation::OperationState;
use warden_kernel::testkit::{FakeFleet, FakeNode};
use warden_kernel::Warden;

use crate::fixtures::CONFIG_FILE;

/// A full engine over a fake fleet.
pub struct TestHarness {
    pub fleet: FakeFleet,
    pub warden: Warden,
    dir: TempDir,
}

impl TestHarness {
    /// Engine with no nodes.
    pub async fn new() -> Result<Self> {
        Self::with_nodes(Vec::new()).await
    }

    /// Engine managing the given nodes, each registered as `<id>.lan`.
    pub async fn with_nodes(nodes: Vec<(&str, FakeNode)>) -> Result<Self> {
        env_logger::try_init().ok();

        let dir = tempfile::tempdir().context("creating harness directory")?;
        let mut config = Self::config(dir.path());
        let fleet = FakeFleet::new(CONFIG_FILE);
        for (id, node) in nodes {
            config.nodes.insert(id.to_string(), HostRef::new(format!("{id}.lan"), "openclaw"));
            fleet.add_node(id, node);
        }

        let warden = Warden::build(config, Arc::new(fleet.clone())).await?;
        log::info!("harness ready in {}", dir.path().display());
        Ok(Self { fleet, warden, dir })
    }

    /// Defaults with storage under `root` and no waiting between verification probes.
    pub fn config(root: &Path) -> WardenConfig {
        let mut config = WardenConfig::default();
        config.data_dir = root.join("data");
        config.backup_dir = root.join("backups");
        config.program.config_file = CONFIG_FILE.to_string();
        config.policy.verify_interval_secs = 0;
        config.policy.verify_settle_secs = 0;
        config
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Adds a node to the fleet and to the catalog.
    pub async fn add_node(&self, id: &str, node: FakeNode) -> Result<Node> {
        self.fleet.add_node(id, node);
        let registered = self
            .warden
            .catalog
            .register_node(Node::new(id, HostRef::new(format!("{id}.lan"), "openclaw")))
            .await?;
        Ok(registered)
    }

    pub async fn node(&self, id: &str) -> Result<Node> {
        Ok(self.warden.catalog.require_node(id).await?)
    }

    pub async fn status(&self, id: &str) -> Result<NodeStatus> {
        Ok(self.node(id).await?.status)
    }

    pub async fn backup(&self, id: &str) -> Result<BackupRecord> {
        Ok(self.warden.backups.create_backup(id, BackupKind::Manual).await?)
    }

    /// Flips one byte in the middle of a stored archive.
    pub async fn corrupt_backup(&self, record: &BackupRecord) -> Result<()> {
        let mut bytes = tokio::fs::read(&record.path).await?;
        if bytes.is_empty() {
            bail!("archive {} is empty", record.path.display());
        }
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xff;
        tokio::fs::write(&record.path, bytes).await?;
        log::info!("corrupted {}", record.path.display());
        Ok(())
    }

    /// Content digest of the node's live configuration.
    pub fn config_digest(&self, id: &str) -> String {
        self.fleet.tree(id).content_digest()
    }

    /// Content digest of the configuration stored in a backup.
    pub async fn backup_digest(&self, record: &BackupRecord) -> Result<String> {
        Ok(self.warden.backups.load_verified(record).await?.content_digest())
    }

    pub async fn restore_attempts(&self, id: &str) -> Vec<RestoreAttempt> {
        self.warden.catalog.restore_attempts_for_node(id, None).await
    }

    pub async fn assert_status(&self, id: &str, expected: NodeStatus) -> Result<()> {
        let actual = self.status(id).await?;
        if actual != expected {
            bail!("node {}: expected status {}, got {}", id, expected, actual);
        }
        Ok(())
    }

    /// The newest restore attempt of the node ended in `expected`.
    pub async fn assert_last_attempt(&self, id: &str, expected: OperationState) -> Result<RestoreAttempt> {
        let attempt = self
            .restore_attempts(id)
            .await
            .into_iter()
            .next()
            .with_context(|| format!("node {id} has no restore attempt"))?;
        if attempt.status != expected {
            bail!("node {}: last attempt ended {}, expected {}", id, attempt.status, expected);
        }
        Ok(attempt)
    }

    pub fn assert_no_mutations(&self, id: &str) -> Result<()> {
        let mutations = self.fleet.mutations(id);
        if !mutations.is_empty() {
            bail!("node {} was mutated: {:?}", id, mutations);
        }
        Ok(())
    }

    pub async fn stats(&self) -> HarnessStats {
        let nodes = self.warden.catalog.list_nodes().await;
        let mut backups = 0;
        let mut restores = 0;
        for node in &nodes {
            backups += self.warden.catalog.backups_for_node(&node.id, None).await.len();
            restores += self.warden.catalog.restore_attempts_for_node(&node.id, None).await.len();
        }
        HarnessStats {
            statuses: nodes.into_iter().map(|n| (n.id, n.status)).collect(),
            backups,
            restores,
        }
    }
}

#[derive(Debug)]
pub struct HarnessStats {
    pub statuses: Vec<(String, NodeStatus)>,
    pub backups: usize,
    pub restores: usize,
}

impl HarnessStats {
    pub fn print(&self) {
        println!("Harness statistics:");
        for (id, status) in &self.statuses {
            println!("  {}: {}", id, status);
        }
        println!("  Backups: {}", self.backups);
        println!("  Restore attempts: {}", self.restores);
    }
}

/// Declares a tokio test running `$body` against a harness with the given nodes.
/// The body evaluates to `anyhow::Result<()>`; on failure the harness state is printed.
#[macro_export]
macro_rules! scenario_test {
    ($name:ident, [$(($id:expr, $node:expr)),* $(,)?], |$harness:ident| $body:block) => {
        #[tokio::test]
        async fn $name() {
            let $harness = $crate::test_utils::TestHarness::with_nodes(vec![$(($id, $node)),*])
                .await
                .expect("harness setup");
            let result: ::anyhow::Result<()> = async { $body }.await;
            if let Err(e) = result {
                $harness.stats().await.print();
                panic!("scenario '{}' failed: {:#}", stringify!($name), e);
            }
        }
    };
}
