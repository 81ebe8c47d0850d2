//! Restore / recovery operation lifecycle.
//!
//! Every operation walks one state machine and records each step it runs.
//! The log refuses illegal transitions, so an audit record can only ever show
//! a sequence that actually makes sense.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Requested,
    Diagnosed,
    StrategySelected,
    SnapshotTaken,
    Applying,
    Verifying,
    RollingBack,
    Succeeded,
    RolledBackSucceeded,
    RolledBackFailed,
    /// Stopped before anything on the node was touched.
    Aborted,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Requested => "REQUESTED",
            OperationState::Diagnosed => "DIAGNOSED",
            OperationState::StrategySelected => "STRATEGY_SELECTED",
            OperationState::SnapshotTaken => "SNAPSHOT_TAKEN",
            OperationState::Applying => "APPLYING",
            OperationState::Verifying => "VERIFYING",
            OperationState::RollingBack => "ROLLING_BACK",
            OperationState::Succeeded => "SUCCEEDED",
            OperationState::RolledBackSucceeded => "ROLLED_BACK_SUCCEEDED",
            OperationState::RolledBackFailed => "ROLLED_BACK_FAILED",
            OperationState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded
                | OperationState::RolledBackSucceeded
                | OperationState::RolledBackFailed
                | OperationState::Aborted
        )
    }

    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        match (self, next) {
            (Requested, Diagnosed | StrategySelected | Aborted) => true,
            (Diagnosed, StrategySelected | Aborted) => true,
            (StrategySelected, SnapshotTaken | Aborted) => true,
            // Snapshot failures and unreachable nodes still stop before mutation.
            (SnapshotTaken, Applying | Aborted) => true,
            (Applying, Verifying | RollingBack) => true,
            (Verifying, Succeeded | RollingBack | Applying) => true,
            (RollingBack, RolledBackSucceeded | RolledBackFailed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal operation transition {from} -> {to}")]
pub struct TransitionError {
    pub from: OperationState,
    pub to: OperationState,
}

/// One line of an operation narrative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub state: OperationState,
    pub step: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct OperationLog {
    state: OperationState,
    steps: Vec<StepRecord>,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLog {
    pub fn new() -> Self {
        Self {
            state: OperationState::Requested,
            steps: Vec::new(),
        }
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<StepRecord> {
        self.steps
    }

    pub fn transition(&mut self, next: OperationState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        debug!("operation {} -> {}", self.state, next);
        self.state = next;
        self.push(format!("enter {}", next.as_str()), true, String::new());
        Ok(())
    }

    pub fn ok(&mut self, step: impl Into<String>, detail: impl Into<String>) {
        self.push(step.into(), true, detail.into());
    }

    pub fn fail(&mut self, step: impl Into<String>, detail: impl Into<String>) {
        self.push(step.into(), false, detail.into());
    }

    fn push(&mut self, step: String, ok: bool, detail: String) {
        self.steps.push(StepRecord {
            at: OffsetDateTime::now_utc(),
            state: self.state,
            step,
            ok,
            detail,
        });
    }

    /// Step names in order, without the state-entry markers.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.step.starts_with("enter "))
            .map(|s| s.step.as_str())
            .collect()
    }
}
