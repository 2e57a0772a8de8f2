//! Pipeline phase state machine.
//!
//! The `phase` field on a record is the single source of truth for which
//! stage acts on it next. Stages gate on exact phase equality, claim work by
//! moving the record into an in-progress phase, and hand it off by moving it
//! into the next pending phase. Because only one stage ever watches a given
//! phase, the phase acts as a single-writer token without a lock manager.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when parsing an unknown phase string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown phase '{0}'")]
pub struct ParsePhaseError(pub String);

/// Lifecycle phase of a pipeline record.
///
/// The happy path is strictly linear:
///
/// ```text
/// pending_dataset -> acquiring -> pending_training -> training
///     -> pending_evaluation -> evaluating -> completed
/// ```
///
/// `failed` is reachable from any non-terminal phase. `completed` and
/// `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for the acquisition stage to find and store a dataset.
    PendingDataset,
    /// Acquisition stage is searching, downloading and uploading.
    Acquiring,
    /// Dataset is stored; waiting for the training stage.
    PendingTraining,
    /// Training stage is running.
    Training,
    /// Model is stored; waiting for the evaluation stage.
    PendingEvaluation,
    /// Evaluation stage is running.
    Evaluating,
    /// Pipeline finished successfully.
    Completed,
    /// Pipeline failed with no recoverable artifact.
    Failed,
}

impl Phase {
    /// Returns the canonical snake_case name used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PendingDataset => "pending_dataset",
            Phase::Acquiring => "acquiring",
            Phase::PendingTraining => "pending_training",
            Phase::Training => "training",
            Phase::PendingEvaluation => "pending_evaluation",
            Phase::Evaluating => "evaluating",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    /// Returns true for phases no stage will ever act on again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Returns true for the in-progress marker phases a stage claims.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Phase::Acquiring | Phase::Training | Phase::Evaluating)
    }

    /// Check whether a transition between two phases is allowed.
    ///
    /// Any non-terminal phase may transition to `Failed`; otherwise only the
    /// linear forward step is valid.
    pub fn can_transition(&self, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == Phase::Failed {
            return true;
        }
        matches!(
            (self, to),
            (Phase::PendingDataset, Phase::Acquiring)
                | (Phase::Acquiring, Phase::PendingTraining)
                | (Phase::PendingTraining, Phase::Training)
                | (Phase::Training, Phase::PendingEvaluation)
                | (Phase::PendingEvaluation, Phase::Evaluating)
                | (Phase::Evaluating, Phase::Completed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ParsePhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_dataset" => Ok(Phase::PendingDataset),
            "acquiring" => Ok(Phase::Acquiring),
            "pending_training" => Ok(Phase::PendingTraining),
            "training" => Ok(Phase::Training),
            "pending_evaluation" => Ok(Phase::PendingEvaluation),
            "evaluating" => Ok(Phase::Evaluating),
            "completed" => Ok(Phase::Completed),
            "failed" => Ok(Phase::Failed),
            other => Err(ParsePhaseError(other.to_string())),
        }
    }
}
