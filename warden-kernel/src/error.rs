//! Error taxonomy shared by every component of the engine.
//!
//! `RemoteError` is what the node boundary reports; `WardenError` is what the
//! engine hands back to its callers. Conversions keep the distinction between
//! "could not reach the node" and "the node ran the command and it failed",
//! because the first one never mutated anything.

use std::path::PathBuf;

/// Failure reported by a [`crate::remote::NodeControl`] call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Transport-level failure: unreachable host, auth refused, timeout.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The remote command ran and exited non-zero.
    #[error("command `{command}` exited with {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    /// The command succeeded but its output could not be interpreted.
    #[error("unexpected output: {0}")]
    Malformed(String),
}

impl RemoteError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

/// Errors raised while packing or unpacking configuration archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsafe archive entry path: {0}")]
    UnsafePath(String),
    #[error("unsupported archive entry {path}: {kind}")]
    UnsupportedEntry { path: String, kind: String },
}

#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Node unreachable or authentication refused.
    #[error("node {node_id} unreachable: {reason}")]
    Connectivity { node_id: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Stored checksum does not match the archive on disk.
    #[error("backup {backup_id} is corrupt: expected {expected}, found {actual}")]
    Corruption {
        backup_id: String,
        expected: String,
        actual: String,
    },

    /// A remote step exited non-zero.
    #[error("step '{step}' failed: {source}")]
    RemoteCommand {
        step: String,
        #[source]
        source: RemoteError,
    },

    /// Post-change probes stayed below the verification threshold.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The rollback itself could not restore a working node.
    #[error("rollback failed: {0}")]
    RollbackFailure(String),

    #[error("archive error at {path:?}: {source}")]
    Archive {
        path: Option<PathBuf>,
        #[source]
        source: ArchiveError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WardenError {
    /// Wraps a remote failure raised while running a named step.
    pub fn remote(node_id: &str, step: &str, err: RemoteError) -> Self {
        match err {
            RemoteError::Transport(reason) => WardenError::Connectivity {
                node_id: node_id.to_string(),
                reason,
            },
            other => WardenError::RemoteCommand {
                step: step.to_string(),
                source: other,
            },
        }
    }

    /// Short machine-friendly label, used in API payloads and audit logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WardenError::Connectivity { .. } => "connectivity",
            WardenError::NotFound(_) => "not_found",
            WardenError::Corruption { .. } => "corruption",
            WardenError::RemoteCommand { .. } => "remote_command",
            WardenError::Verification(_) => "verification",
            WardenError::RollbackFailure(_) => "rollback_failure",
            WardenError::Archive { .. } => "archive",
            WardenError::Config(_) => "config",
            WardenError::Io(_) => "io",
            WardenError::Json(_) => "json",
        }
    }
}

impl From<ArchiveError> for WardenError {
    fn from(source: ArchiveError) -> Self {
        WardenError::Archive { path: None, source }
    }
}

pub type Result<T, E = WardenError> = std::result::Result<T, E>;
