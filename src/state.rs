//! Explicit build state machine.
//!
//! Every package build walks the same linear path:
//!
//! ```text
//! START -> PRECONDITIONS_OK -> PATCHES_APPLIED -> EXTERNAL_BUILD_OK -> ARTIFACTS_PLACED -> DONE
//!   \____________\________________\___________________\___________________\--> ABORTED
//! ```
//!
//! Nothing is retried. The tracker records each transition and every
//! precondition result so a failed run can be diagnosed from its run record.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    Start,
    PreconditionsOk,
    PatchesApplied,
    ExternalBuildOk,
    ArtifactsPlaced,
    Done,
    Aborted,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Start => "START",
            BuildState::PreconditionsOk => "PRECONDITIONS_OK",
            BuildState::PatchesApplied => "PATCHES_APPLIED",
            BuildState::ExternalBuildOk => "EXTERNAL_BUILD_OK",
            BuildState::ArtifactsPlaced => "ARTIFACTS_PLACED",
            BuildState::Done => "DONE",
            BuildState::Aborted => "ABORTED",
        }
    }

    /// The single forward successor. Terminal states have none.
    pub fn next(&self) -> Option<BuildState> {
        match self {
            BuildState::Start => Some(BuildState::PreconditionsOk),
            BuildState::PreconditionsOk => Some(BuildState::PatchesApplied),
            BuildState::PatchesApplied => Some(BuildState::ExternalBuildOk),
            BuildState::ExternalBuildOk => Some(BuildState::ArtifactsPlaced),
            BuildState::ArtifactsPlaced => Some(BuildState::Done),
            BuildState::Done | BuildState::Aborted => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Done | BuildState::Aborted)
    }

    pub fn can_transition_to(&self, to: BuildState) -> bool {
        if to == BuildState::Aborted {
            return !self.is_terminal();
        }
        self.next() == Some(to)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a precondition check looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Directory,
    File,
    Tool,
}

/// One recorded precondition result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionRecord {
    pub kind: CheckKind,
    pub subject: String,
    pub satisfied: bool,
}

impl PreconditionRecord {
    pub fn path(kind: CheckKind, path: impl Into<PathBuf>, satisfied: bool) -> Self {
        Self {
            kind,
            subject: path.into().display().to_string(),
            satisfied,
        }
    }
}

/// Tracks the current state and its history for one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTracker {
    current: BuildState,
    history: Vec<BuildState>,
    preconditions: Vec<PreconditionRecord>,
    failure: Option<String>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: BuildState::Start,
            history: vec![BuildState::Start],
            preconditions: Vec::new(),
            failure: None,
        }
    }

    pub fn current(&self) -> BuildState {
        self.current
    }

    pub fn history(&self) -> &[BuildState] {
        &self.history
    }

    pub fn preconditions(&self) -> &[PreconditionRecord] {
        &self.preconditions
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn record_precondition(&mut self, record: PreconditionRecord) {
        self.preconditions.push(record);
    }

    /// Move to `to`, rejecting anything but the single forward step.
    pub fn advance(&mut self, to: BuildState) -> Result<()> {
        if to == BuildState::Aborted || !self.current.can_transition_to(to) {
            return Err(BuildError::InvalidTransition {
                from: self.current,
                to,
            }
            .into());
        }
        self.current = to;
        self.history.push(to);
        Ok(())
    }

    /// Short-circuit to ABORTED, remembering the state that failed.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.current.is_terminal() {
            return;
        }
        self.failure = Some(format!("{}: {}", self.current, reason.into()));
        self.current = BuildState::Aborted;
        self.history.push(BuildState::Aborted);
    }
}
