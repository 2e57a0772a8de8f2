//! Pipeline service: the surface exposed to callers of the core.
//!
//! The thin request layer (HTTP or CLI) talks to [`PipelineService`]:
//! submit a project plan, trigger a stage for a record, read a record's
//! status, or build a scheduler that serves every stage automatically.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::record::{AuditLogEntry, LogLevel, Phase, PipelineRecord, ProjectPlan};
use crate::scheduler::PollScheduler;
use crate::store::StoreError;
use crate::workflow::{
    AcquisitionStage, EvaluationStage, Stage, StageContext, StageSuccess, TrainingStage,
    WorkflowError, WorkflowExecutor,
};

/// Number of audit log entries returned by a status query.
const STATUS_LOG_LIMIT: usize = 20;

/// Errors surfaced to the core's callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The stage name does not match any pipeline stage.
    #[error("unknown stage '{0}' (expected acquisition, training or evaluation)")]
    UnknownStage(String),

    /// The submitted plan cannot drive a pipeline run.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// A stage execution failed; see [`WorkflowError`] for the breakdown
    /// into not-found, wrong-phase and stage-failed.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// The record store misbehaved.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// A record's phase plus its recent audit trail.
#[derive(Debug, Clone)]
pub struct RecordStatus {
    /// The record id.
    pub record_id: Uuid,
    /// Project name.
    pub name: String,
    /// Current lifecycle phase.
    pub phase: Phase,
    /// Most recent audit log entries, newest first.
    pub recent_logs: Vec<AuditLogEntry>,
}

/// Facade over the workflow executor and the three pipeline stages.
pub struct PipelineService {
    executor: Arc<WorkflowExecutor>,
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineService {
    /// Creates a service over the given collaborators.
    pub fn new(ctx: StageContext) -> Self {
        Self {
            executor: Arc::new(WorkflowExecutor::new(ctx)),
            stages: vec![
                Arc::new(AcquisitionStage),
                Arc::new(TrainingStage),
                Arc::new(EvaluationStage),
            ],
        }
    }

    /// Returns the shared workflow executor.
    pub fn executor(&self) -> Arc<WorkflowExecutor> {
        Arc::clone(&self.executor)
    }

    /// Submits a project plan, creating a record in `pending_dataset`.
    ///
    /// The acquisition scheduler discovers the record on its next cycle.
    pub async fn submit(&self, plan: &ProjectPlan) -> Result<PipelineRecord, ServiceError> {
        if plan.name.trim().is_empty() {
            return Err(ServiceError::InvalidPlan("name is empty".to_string()));
        }
        if plan.search_keywords.is_empty() {
            return Err(ServiceError::InvalidPlan(
                "search_keywords is empty".to_string(),
            ));
        }

        let record = PipelineRecord::from_plan(plan);
        let store = &self.executor.context().store;
        store.insert_record(&record).await?;

        // Best-effort, like every other audit write.
        let _ = store
            .insert_log(&AuditLogEntry::new(
                record.id,
                "intake",
                format!("project '{}' submitted", record.name),
                LogLevel::Info,
            ))
            .await;

        info!(record_id = %record.id, name = %record.name, "Project submitted");
        Ok(record)
    }

    /// Triggers one stage for one record immediately.
    ///
    /// The result distinguishes "not found", "wrong phase" and
    /// "stage failed", which is what a caller needs to decide whether
    /// re-triggering makes sense.
    pub async fn trigger_stage(
        &self,
        stage_name: &str,
        record_id: Uuid,
    ) -> Result<StageSuccess, ServiceError> {
        let stage = self
            .stages
            .iter()
            .find(|s| s.name() == stage_name)
            .ok_or_else(|| ServiceError::UnknownStage(stage_name.to_string()))?;

        Ok(self.executor.execute(stage.as_ref(), record_id).await?)
    }

    /// Returns a record's phase and recent audit log entries.
    pub async fn status(&self, record_id: Uuid) -> Result<RecordStatus, ServiceError> {
        let store = &self.executor.context().store;
        let record = store.get_record(record_id).await?;
        let recent_logs = store.recent_logs(record_id, STATUS_LOG_LIMIT).await?;

        Ok(RecordStatus {
            record_id,
            name: record.name,
            phase: record.phase,
            recent_logs,
        })
    }

    /// Builds a scheduler watching every stage this service hosts.
    pub fn scheduler(&self, poll_interval: Duration) -> PollScheduler {
        PollScheduler::new(self.executor(), self.stages.clone(), poll_interval)
    }
}
