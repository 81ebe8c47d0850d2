use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Per-node mutual exclusion. Every mutating operation on a node, and every
/// health check, holds that node's lock for its whole duration.
#[derive(Clone, Default)]
pub struct NodeLocks {
    locks: Shared<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Proof that the holder has exclusive access to one node.
pub struct NodeGuard {
    node_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl NodeGuard {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl std::fmt::Debug for NodeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGuard").field("node_id", &self.node_id).finish()
    }
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, node_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits until the node is free.
    pub async fn acquire(&self, node_id: &str) -> NodeGuard {
        let guard = self.slot(node_id).lock_owned().await;
        NodeGuard {
            node_id: node_id.to_string(),
            _guard: guard,
        }
    }

    /// Returns `None` when another operation holds the node.
    pub fn try_acquire(&self, node_id: &str) -> Option<NodeGuard> {
        let guard = self.slot(node_id).try_lock_owned().ok()?;
        Some(NodeGuard {
            node_id: node_id.to_string(),
            _guard: guard,
        })
    }

    pub fn forget(&self, node_id: &str) {
        self.locks.lock().remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_is_refused() {
        let locks = NodeLocks::new();
        let guard = locks.acquire("pc-a").await;
        assert_eq!(guard.node_id(), "pc-a");
        assert!(locks.try_acquire("pc-a").is_none());
        assert!(locks.try_acquire("t440").is_some());
        drop(guard);
        assert!(locks.try_acquire("pc-a").is_some());
    }
}
