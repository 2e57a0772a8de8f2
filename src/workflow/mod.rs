//! Stage workflow execution.
//!
//! Every pipeline stage (acquisition, training, evaluation) shares one
//! shape: gate on a precondition phase, claim the record by moving it into
//! an in-progress phase, run the stage body, then advance to the success
//! phase or apply the check-before-fail rule. The [`WorkflowExecutor`]
//! implements that shape once; each [`Stage`] supplies its phases, its body
//! and its artifact probe.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{BackendError, TrainingBackend};
use crate::config::PipelineConfig;
use crate::dataset::{ArchiveError, DatasetSource, NormalizeError, SourceError};
use crate::objstore::{ObjectStore, ObjectStoreError};
use crate::record::{Phase, PipelineRecord};
use crate::retry::RetriesExhausted;
use crate::store::{RecordStore, StoreError};

pub mod acquisition;
pub mod evaluation;
pub mod executor;
pub mod training;

pub use acquisition::AcquisitionStage;
pub use evaluation::EvaluationStage;
pub use executor::{StageSuccess, WorkflowExecutor};
pub use training::TrainingStage;

/// Shared collaborators a stage body works with.
///
/// Everything is behind a trait object so tests can swap in in-memory
/// implementations; the config rides along for defaults and retry bounds.
#[derive(Clone)]
pub struct StageContext {
    /// The shared record store.
    pub store: Arc<dyn RecordStore>,
    /// Object store for archives, models and bundles.
    pub objects: Arc<dyn ObjectStore>,
    /// Dataset source for the acquisition stage.
    pub source: Arc<dyn DatasetSource>,
    /// Training/evaluation subsystem.
    pub backend: Arc<dyn TrainingBackend>,
    /// Pipeline configuration.
    pub config: PipelineConfig,
}

/// Errors produced by stage bodies.
#[derive(Debug, Error)]
pub enum StageError {
    /// The record's parameters cannot drive this stage.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An artifact a prior stage should have produced is missing.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Record store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Dataset normalization failed.
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    /// Archive packing/unpacking failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Local IO failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The training backend reported a failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A dataset source operation failed on every attempt.
    #[error(transparent)]
    SourceExhausted(#[from] RetriesExhausted<SourceError>),

    /// An object store operation failed on every attempt.
    #[error(transparent)]
    ObjectExhausted(#[from] RetriesExhausted<ObjectStoreError>),

    /// A blocking helper task died.
    #[error("blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

/// Structured failure result of a workflow execution.
///
/// Callers triggering a stage can tell "no such record" from "wrong phase"
/// from "the stage itself failed" and decide whether a retry makes sense.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The record does not exist. The store was not touched.
    #[error("record not found: {0}")]
    NotFound(Uuid),

    /// The record is not in this stage's precondition phase.
    ///
    /// Usually a duplicate dispatch; intentionally neither retried nor
    /// escalated to `failed`.
    #[error("record {id} is in phase '{actual}', stage '{stage}' requires '{expected}'")]
    InvalidPrecondition {
        stage: &'static str,
        id: Uuid,
        expected: Phase,
        actual: Phase,
    },

    /// The record store itself misbehaved.
    #[error("storage error: {0}")]
    Store(#[source] StoreError),

    /// The stage body failed with no recoverable artifact.
    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        stage: &'static str,
        #[source]
        source: StageError,
    },
}

/// One unit of pipeline work with declared phases and a body.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name used in logs and audit entries.
    fn name(&self) -> &'static str;

    /// Phase a record must be in for this stage to act.
    fn precondition(&self) -> Phase;

    /// Phase marking this stage's work as claimed and running.
    fn in_progress(&self) -> Phase;

    /// Phase the record advances to when the stage succeeds.
    fn success_phase(&self) -> Phase;

    /// Whether a body failure with an existing artifact should still advance
    /// the record to the success phase.
    ///
    /// True only for stages whose entire effect is the artifact itself (the
    /// acquisition stage): once the artifact exists the next stage can run,
    /// so holding the record back would just strand it.
    fn advance_on_partial(&self) -> bool {
        false
    }

    /// Executes the stage body against a claimed record.
    ///
    /// Inputs produced by earlier stages must be fetched fresh from the
    /// context here, never cached from an earlier poll. Returns the storage
    /// reference of the produced artifact, when there is one.
    async fn run(
        &self,
        ctx: &StageContext,
        record: &PipelineRecord,
    ) -> Result<Option<String>, StageError>;

    /// Probes for the artifact this stage was supposed to produce.
    ///
    /// Drives the check-before-fail rule: when the body fails but this
    /// returns a reference, the failure is reclassified as partial success.
    async fn existing_artifact(
        &self,
        ctx: &StageContext,
        record_id: Uuid,
    ) -> Result<Option<String>, StoreError>;
}

/// Turns a free-form name into a storage-safe slug.
pub(crate) fn storage_slug(name: &str) -> String {
    let mut slug: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-');

    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_slug_flattens_separators() {
        assert_eq!(storage_slug("user/flower photos"), "user-flower-photos");
        assert_eq!(storage_slug("Birds_2024"), "birds-2024");
        assert_eq!(storage_slug("  trimmed  "), "trimmed");
    }

    #[test]
    fn test_storage_slug_never_empty() {
        assert_eq!(storage_slug(""), "unnamed");
        assert_eq!(storage_slug("///"), "unnamed");
    }
}
