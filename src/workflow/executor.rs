//! Generic guarded, idempotent stage execution.

use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::record::{AuditLogEntry, LogLevel, Phase};
use crate::retry::{execute_with_retry, RetryPolicy};

use super::{Stage, StageContext, WorkflowError};

/// Successful outcome of a stage execution.
#[derive(Debug, Clone)]
pub struct StageSuccess {
    /// The record that was advanced.
    pub record_id: Uuid,
    /// Name of the stage that ran.
    pub stage: &'static str,
    /// Storage reference of the produced artifact, when there is one.
    pub produced_ref: Option<String>,
    /// True when the body failed but the artifact already existed and the
    /// failure was reclassified as partial success.
    pub recovered: bool,
}

/// Executes stages against records with the phase-token protocol.
///
/// The procedure, identical for every stage:
///
/// 1. Load the record (`NotFound` if absent, nothing written).
/// 2. Gate on the stage's precondition phase (`InvalidPrecondition` on
///    mismatch, nothing written).
/// 3. Claim the record by transitioning to the in-progress phase.
/// 4. Run the stage body.
/// 5. On success, transition to the success phase (retried independently of
///    the body; exhaustion still counts as success, because the artifact
///    exists and only the status write was lost).
/// 6. On failure, probe for the stage's artifact first: if it exists the
///    record is *not* failed — the body died after its real work landed.
/// 7. Only with no artifact does the record move to `failed`.
pub struct WorkflowExecutor {
    ctx: StageContext,
    status_retry: RetryPolicy,
}

impl WorkflowExecutor {
    /// Creates an executor over the given context.
    pub fn new(ctx: StageContext) -> Self {
        // Losing only the final status write means duplicated expensive work
        // on the next poll, so it gets a flat three-attempt schedule.
        let status_retry = RetryPolicy::new(3)
            .with_initial_delay(Duration::from_secs(2))
            .with_multiplier(1.0);

        Self { ctx, status_retry }
    }

    /// Overrides the status-write retry schedule.
    pub fn with_status_retry(mut self, policy: RetryPolicy) -> Self {
        self.status_retry = policy;
        self
    }

    /// Returns the shared stage context.
    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Runs a stage against a record.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkflowError`] distinguishing a missing record, a phase
    /// mismatch, a store failure and a genuine stage failure. A stage-body
    /// failure whose artifact already exists is *not* an error; it comes
    /// back as a [`StageSuccess`] with `recovered` set.
    pub async fn execute(
        &self,
        stage: &dyn Stage,
        record_id: Uuid,
    ) -> Result<StageSuccess, WorkflowError> {
        let record = match self.ctx.store.get_record(record_id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Err(WorkflowError::NotFound(record_id)),
            Err(e) => return Err(WorkflowError::Store(e)),
        };

        if record.phase != stage.precondition() {
            debug!(
                record_id = %record_id,
                stage = stage.name(),
                expected = %stage.precondition(),
                actual = %record.phase,
                "Skipping record in wrong phase"
            );
            return Err(WorkflowError::InvalidPrecondition {
                stage: stage.name(),
                id: record_id,
                expected: stage.precondition(),
                actual: record.phase,
            });
        }

        // Optimistic claim. Once this lands, no other executor of the same
        // stage class will pick the record up again.
        self.ctx
            .store
            .update_phase(record_id, stage.in_progress())
            .await
            .map_err(WorkflowError::Store)?;

        self.log(
            record_id,
            stage.name(),
            format!("{} workflow initiated for '{}'", stage.name(), record.name),
            LogLevel::Info,
        )
        .await;

        match stage.run(&self.ctx, &record).await {
            Ok(produced_ref) => {
                self.finish_success(stage, record_id, produced_ref).await
            }
            Err(stage_err) => {
                // Check-before-fail: the body is a sequence of non-atomic
                // steps, and a late failure after the artifact write must
                // not be classified as total failure.
                let existing = match stage.existing_artifact(&self.ctx, record_id).await {
                    Ok(existing) => existing,
                    Err(check_err) => {
                        warn!(
                            record_id = %record_id,
                            stage = stage.name(),
                            error = %check_err,
                            "Artifact probe failed, treating stage failure as total"
                        );
                        None
                    }
                };

                match existing {
                    Some(artifact_ref) => {
                        warn!(
                            record_id = %record_id,
                            stage = stage.name(),
                            artifact = %artifact_ref,
                            error = %stage_err,
                            "Stage body failed but artifact exists, not marking failed"
                        );
                        self.log(
                            record_id,
                            stage.name(),
                            format!(
                                "{} body failed after artifact '{artifact_ref}' was written: {stage_err}",
                                stage.name()
                            ),
                            LogLevel::Warning,
                        )
                        .await;

                        if stage.advance_on_partial() {
                            self.transition_with_retry(stage, record_id, stage.success_phase())
                                .await;
                        }

                        Ok(StageSuccess {
                            record_id,
                            stage: stage.name(),
                            produced_ref: Some(artifact_ref),
                            recovered: true,
                        })
                    }
                    None => {
                        self.log(
                            record_id,
                            stage.name(),
                            format!("{} failed: {stage_err}", stage.name()),
                            LogLevel::Error,
                        )
                        .await;

                        if let Err(e) = self.ctx.store.update_phase(record_id, Phase::Failed).await
                        {
                            error!(
                                record_id = %record_id,
                                stage = stage.name(),
                                error = %e,
                                "Failed to mark record as failed"
                            );
                        }

                        Err(WorkflowError::StageFailed {
                            stage: stage.name(),
                            source: stage_err,
                        })
                    }
                }
            }
        }
    }

    async fn finish_success(
        &self,
        stage: &dyn Stage,
        record_id: Uuid,
        produced_ref: Option<String>,
    ) -> Result<StageSuccess, WorkflowError> {
        self.transition_with_retry(stage, record_id, stage.success_phase())
            .await;

        info!(
            record_id = %record_id,
            stage = stage.name(),
            produced = produced_ref.as_deref().unwrap_or("-"),
            next_phase = %stage.success_phase(),
            "Stage completed"
        );
        self.log(
            record_id,
            stage.name(),
            format!("{} workflow completed successfully", stage.name()),
            LogLevel::Info,
        )
        .await;

        Ok(StageSuccess {
            record_id,
            stage: stage.name(),
            produced_ref,
            recovered: false,
        })
    }

    /// Transitions the record's phase with the status-write retry schedule.
    ///
    /// Exhaustion is logged for manual reconciliation but never propagated:
    /// at this point the stage's artifact exists, and surfacing a failure
    /// would turn a lost status write into duplicated expensive work.
    async fn transition_with_retry(&self, stage: &dyn Stage, record_id: Uuid, to: Phase) {
        let store = &self.ctx.store;
        let target = record_id.to_string();

        let result = execute_with_retry("update_phase", &target, &self.status_retry, || {
            store.update_phase(record_id, to)
        })
        .await;

        if let Err(e) = result {
            warn!(
                record_id = %record_id,
                stage = stage.name(),
                phase = %to,
                error = %e,
                "Status update exhausted retries, record needs manual reconciliation"
            );
            self.log(
                record_id,
                stage.name(),
                format!(
                    "artifact stored but phase update to '{to}' failed, manual reconciliation needed"
                ),
                LogLevel::Warning,
            )
            .await;
        }
    }

    /// Emits a best-effort audit log entry; failures are logged and dropped.
    async fn log(&self, record_id: Uuid, stage: &str, message: String, level: LogLevel) {
        let entry = AuditLogEntry::new(record_id, stage, message, level);
        if let Err(e) = self.ctx.store.insert_log(&entry).await {
            warn!(record_id = %record_id, error = %e, "Failed to write audit log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::backend::{BackendError, EvalMetrics, TrainedModel, TrainingBackend, TrainingSpec};
    use crate::config::PipelineConfig;
    use crate::dataset::{DatasetCandidate, DatasetSource, SourceError};
    use crate::objstore::{ObjectStore, ObjectStoreError};
    use crate::record::{PipelineRecord, ProjectPlan};
    use crate::store::{MemoryRecordStore, RecordStore, StoreError};

    use super::super::{Stage, StageContext, StageError, WorkflowError};
    use super::*;

    /// Object store that accepts everything and holds nothing.
    struct NullObjects;

    #[async_trait]
    impl ObjectStore for NullObjects {
        async fn upload(&self, _: &Path, dest_ref: &str) -> Result<String, ObjectStoreError> {
            Ok(dest_ref.to_string())
        }

        async fn download(&self, source_ref: &str, _: &Path) -> Result<(), ObjectStoreError> {
            Err(ObjectStoreError::NotFound(source_ref.to_string()))
        }

        async fn exists(&self, _: &str) -> Result<bool, ObjectStoreError> {
            Ok(false)
        }
    }

    struct NullSource;

    #[async_trait]
    impl DatasetSource for NullSource {
        fn name(&self) -> &'static str {
            "null"
        }

        async fn search(&self, _: &[String]) -> Result<Vec<DatasetCandidate>, SourceError> {
            Ok(Vec::new())
        }

        async fn fetch(&self, slug: &str, _: &Path) -> Result<PathBuf, SourceError> {
            Err(SourceError::NotFound(slug.to_string()))
        }
    }

    struct NullBackend;

    #[async_trait]
    impl TrainingBackend for NullBackend {
        async fn train(
            &self,
            _: &Path,
            _: &TrainingSpec,
        ) -> Result<TrainedModel, BackendError> {
            Err(BackendError::RequestFailed("null backend".to_string()))
        }

        async fn evaluate(&self, _: &Path, _: &Path) -> Result<EvalMetrics, BackendError> {
            Err(BackendError::RequestFailed("null backend".to_string()))
        }
    }

    /// Store wrapper that fails phase updates to a chosen phase a set
    /// number of times, to exercise the status-write retry.
    struct FlakyPhaseStore {
        inner: Arc<MemoryRecordStore>,
        fail_on: Phase,
        remaining_failures: AtomicU32,
    }

    impl FlakyPhaseStore {
        fn new(inner: Arc<MemoryRecordStore>, fail_on: Phase, failures: u32) -> Self {
            Self {
                inner,
                fail_on,
                remaining_failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl RecordStore for FlakyPhaseStore {
        async fn insert_record(&self, record: &PipelineRecord) -> Result<(), StoreError> {
            self.inner.insert_record(record).await
        }

        async fn get_record(&self, id: Uuid) -> Result<PipelineRecord, StoreError> {
            self.inner.get_record(id).await
        }

        async fn query_by_phase(&self, phase: Phase) -> Result<Vec<PipelineRecord>, StoreError> {
            self.inner.query_by_phase(phase).await
        }

        async fn update_phase(&self, id: Uuid, phase: Phase) -> Result<(), StoreError> {
            if phase == self.fail_on {
                let remaining = self.remaining_failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(StoreError::ConnectionFailed("injected outage".to_string()));
                }
            }
            self.inner.update_phase(id, phase).await
        }

        async fn update_params(
            &self,
            id: Uuid,
            params: &crate::record::StageParams,
        ) -> Result<(), StoreError> {
            self.inner.update_params(id, params).await
        }

        async fn insert_manifest(
            &self,
            manifest: &crate::record::DatasetManifest,
        ) -> Result<(), StoreError> {
            self.inner.insert_manifest(manifest).await
        }

        async fn manifest_for_record(
            &self,
            record_id: Uuid,
        ) -> Result<Option<crate::record::DatasetManifest>, StoreError> {
            self.inner.manifest_for_record(record_id).await
        }

        async fn insert_model(
            &self,
            model: &crate::record::ModelArtifact,
        ) -> Result<(), StoreError> {
            self.inner.insert_model(model).await
        }

        async fn model_for_record(
            &self,
            record_id: Uuid,
        ) -> Result<Option<crate::record::ModelArtifact>, StoreError> {
            self.inner.model_for_record(record_id).await
        }

        async fn update_model_metrics(
            &self,
            model_id: Uuid,
            accuracy: f64,
            metrics: serde_json::Value,
        ) -> Result<(), StoreError> {
            self.inner.update_model_metrics(model_id, accuracy, metrics).await
        }

        async fn insert_log(
            &self,
            entry: &crate::record::AuditLogEntry,
        ) -> Result<(), StoreError> {
            self.inner.insert_log(entry).await
        }

        async fn recent_logs(
            &self,
            record_id: Uuid,
            limit: usize,
        ) -> Result<Vec<crate::record::AuditLogEntry>, StoreError> {
            self.inner.recent_logs(record_id, limit).await
        }
    }

    /// Configurable stage for driving the executor.
    struct MockStage {
        body_result: Box<dyn Fn() -> Result<Option<String>, StageError> + Send + Sync>,
        artifact: Option<String>,
        advance_on_partial: bool,
        invocations: AtomicU32,
    }

    impl MockStage {
        fn succeeding(produced: &str) -> Self {
            let produced = produced.to_string();
            Self {
                body_result: Box::new(move || Ok(Some(produced.clone()))),
                artifact: None,
                advance_on_partial: false,
                invocations: AtomicU32::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                body_result: Box::new(|| {
                    Err(StageError::Validation("injected body failure".to_string()))
                }),
                artifact: None,
                advance_on_partial: false,
                invocations: AtomicU32::new(0),
            }
        }

        fn with_artifact(mut self, artifact: &str) -> Self {
            self.artifact = Some(artifact.to_string());
            self
        }

        fn with_advance_on_partial(mut self) -> Self {
            self.advance_on_partial = true;
            self
        }
    }

    #[async_trait]
    impl Stage for MockStage {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn precondition(&self) -> Phase {
            Phase::PendingTraining
        }

        fn in_progress(&self) -> Phase {
            Phase::Training
        }

        fn success_phase(&self) -> Phase {
            Phase::PendingEvaluation
        }

        fn advance_on_partial(&self) -> bool {
            self.advance_on_partial
        }

        async fn run(
            &self,
            _ctx: &StageContext,
            _record: &PipelineRecord,
        ) -> Result<Option<String>, StageError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            (self.body_result)()
        }

        async fn existing_artifact(
            &self,
            _ctx: &StageContext,
            _record_id: Uuid,
        ) -> Result<Option<String>, StoreError> {
            Ok(self.artifact.clone())
        }
    }

    fn context_with_store(store: Arc<dyn RecordStore>) -> StageContext {
        StageContext {
            store,
            objects: Arc::new(NullObjects),
            source: Arc::new(NullSource),
            backend: Arc::new(NullBackend),
            config: PipelineConfig::default(),
        }
    }

    fn fast_executor(store: Arc<dyn RecordStore>) -> WorkflowExecutor {
        WorkflowExecutor::new(context_with_store(store)).with_status_retry(
            RetryPolicy::new(3).with_initial_delay(Duration::from_millis(1)),
        )
    }

    async fn seeded_record(store: &MemoryRecordStore, phase: Phase) -> PipelineRecord {
        let plan = ProjectPlan::new("flowers", vec!["flower".to_string()]);
        let mut record = PipelineRecord::from_plan(&plan);
        record.phase = phase;
        store.insert_record(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let store = Arc::new(MemoryRecordStore::new());
        let executor = fast_executor(store);

        let err = executor
            .execute(&MockStage::succeeding("x"), Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_precondition_mismatch_never_mutates() {
        let store = Arc::new(MemoryRecordStore::new());
        let record = seeded_record(&store, Phase::PendingDataset).await;
        let executor = fast_executor(Arc::clone(&store) as Arc<dyn RecordStore>);

        let stage = MockStage::succeeding("x");
        let err = executor.execute(&stage, record.id).await.unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::InvalidPrecondition {
                expected: Phase::PendingTraining,
                actual: Phase::PendingDataset,
                ..
            }
        ));
        // Record untouched, body never ran.
        let fetched = store.get_record(record.id).await.unwrap();
        assert_eq!(fetched.phase, Phase::PendingDataset);
        assert_eq!(stage.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_advances_to_success_phase() {
        let store = Arc::new(MemoryRecordStore::new());
        let record = seeded_record(&store, Phase::PendingTraining).await;
        let executor = fast_executor(Arc::clone(&store) as Arc<dyn RecordStore>);

        let outcome = executor
            .execute(&MockStage::succeeding("models/m.pt"), record.id)
            .await
            .unwrap();

        assert_eq!(outcome.produced_ref.as_deref(), Some("models/m.pt"));
        assert!(!outcome.recovered);
        let fetched = store.get_record(record.id).await.unwrap();
        assert_eq!(fetched.phase, Phase::PendingEvaluation);
    }

    #[tokio::test]
    async fn test_failure_without_artifact_marks_failed() {
        let store = Arc::new(MemoryRecordStore::new());
        let record = seeded_record(&store, Phase::PendingTraining).await;
        let executor = fast_executor(Arc::clone(&store) as Arc<dyn RecordStore>);

        let err = executor
            .execute(&MockStage::failing(), record.id)
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::StageFailed { .. }));
        let fetched = store.get_record(record.id).await.unwrap();
        assert_eq!(fetched.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn test_check_before_fail_keeps_record_off_failed() {
        let store = Arc::new(MemoryRecordStore::new());
        let record = seeded_record(&store, Phase::PendingTraining).await;
        let executor = fast_executor(Arc::clone(&store) as Arc<dyn RecordStore>);

        let stage = MockStage::failing().with_artifact("models/m.pt");
        let outcome = executor.execute(&stage, record.id).await.unwrap();

        assert!(outcome.recovered);
        assert_eq!(outcome.produced_ref.as_deref(), Some("models/m.pt"));
        // The phase stays parked at the in-progress marker.
        let fetched = store.get_record(record.id).await.unwrap();
        assert_eq!(fetched.phase, Phase::Training);
    }

    #[tokio::test]
    async fn test_partial_success_can_advance_anyway() {
        let store = Arc::new(MemoryRecordStore::new());
        let record = seeded_record(&store, Phase::PendingTraining).await;
        let executor = fast_executor(Arc::clone(&store) as Arc<dyn RecordStore>);

        let stage = MockStage::failing()
            .with_artifact("raw/d.tar.gz")
            .with_advance_on_partial();
        let outcome = executor.execute(&stage, record.id).await.unwrap();

        assert!(outcome.recovered);
        let fetched = store.get_record(record.id).await.unwrap();
        assert_eq!(fetched.phase, Phase::PendingEvaluation);
    }

    #[tokio::test]
    async fn test_status_write_outage_is_retried() {
        let memory = Arc::new(MemoryRecordStore::new());
        let record = seeded_record(&memory, Phase::PendingTraining).await;
        // Fail the first two writes of the success phase, then recover.
        let flaky = Arc::new(FlakyPhaseStore::new(
            Arc::clone(&memory),
            Phase::PendingEvaluation,
            2,
        ));
        let executor = fast_executor(flaky);

        let outcome = executor
            .execute(&MockStage::succeeding("models/m.pt"), record.id)
            .await
            .unwrap();

        assert!(!outcome.recovered);
        let fetched = memory.get_record(record.id).await.unwrap();
        assert_eq!(fetched.phase, Phase::PendingEvaluation);
    }

    #[tokio::test]
    async fn test_status_write_exhaustion_still_reports_success() {
        let memory = Arc::new(MemoryRecordStore::new());
        let record = seeded_record(&memory, Phase::PendingTraining).await;
        // The success-phase write never goes through.
        let flaky = Arc::new(FlakyPhaseStore::new(
            Arc::clone(&memory),
            Phase::PendingEvaluation,
            u32::MAX,
        ));
        let executor = fast_executor(flaky);

        let outcome = executor
            .execute(&MockStage::succeeding("models/m.pt"), record.id)
            .await
            .unwrap();

        // The artifact exists, so the caller sees success; the record is
        // left at the in-progress marker for manual reconciliation.
        assert_eq!(outcome.produced_ref.as_deref(), Some("models/m.pt"));
        let fetched = memory.get_record(record.id).await.unwrap();
        assert_eq!(fetched.phase, Phase::Training);
    }
}
