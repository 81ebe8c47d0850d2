//! Fleet health monitoring, checksummed configuration backups and verified
//! recovery for nodes running a managed service.

pub mod archive;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod diagnose;
pub mod engine;
pub mod error;
pub mod executor;
pub mod health;
pub mod http;
pub mod models;
pub mod operation;
pub mod recovery;
pub mod remote;
pub mod state;
pub mod supervisor;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use backup::BackupEngine;
pub use catalog::Catalog;
pub use config::WardenConfig;
pub use diagnose::Diagnoser;
pub use engine::Warden;
pub use error::{Result, WardenError};
pub use health::HealthMonitor;
pub use recovery::{RecoveryStrategist, Strategy};
pub use remote::NodeControl;
