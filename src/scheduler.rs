//! Polling scheduler: turns phase membership into dispatched stage work.
//!
//! One cooperative loop per scheduler instance. Each cycle queries the
//! record store for every watched stage's precondition phase and dispatches
//! matching records to the workflow executor as independent tasks. A
//! process-local in-flight set prevents duplicate dispatch while a slow
//! stage body straddles poll cycles; it is instance state, not a process
//! global, so tests and multi-scheduler setups stay independent, and it
//! resets on restart by construction.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::workflow::{Stage, WorkflowError, WorkflowExecutor};

/// Fixed-interval scheduler watching one or more stages.
pub struct PollScheduler {
    executor: Arc<WorkflowExecutor>,
    stages: Vec<Arc<dyn Stage>>,
    poll_interval: Duration,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PollScheduler {
    /// Creates a scheduler dispatching to the given stages.
    ///
    /// A single instance may watch several stages per cycle, letting one
    /// process serve e.g. both training and evaluation.
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        stages: Vec<Arc<dyn Stage>>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            executor,
            stages,
            poll_interval,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown_tx,
        }
    }

    /// Requests a clean stop: the current cycle finishes, no new cycle
    /// starts. In-flight stage executions run to completion.
    pub fn stop(&self) {
        // Send error means the loop already exited.
        let _ = self.shutdown_tx.send(());
    }

    /// Returns how many records are currently being executed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("in-flight lock poisoned").len()
    }

    /// Runs the polling loop until [`stop`](Self::stop) is called.
    ///
    /// A cycle's errors are logged and never terminate the loop; one bad
    /// record or one store outage must not stop the next cycle.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let watched: Vec<&str> = self.stages.iter().map(|s| s.precondition().as_str()).collect();
        info!(
            interval_secs = self.poll_interval.as_secs(),
            phases = ?watched,
            "Polling scheduler started"
        );

        loop {
            self.poll_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown_rx.recv() => {
                    info!("Polling scheduler received stop signal");
                    break;
                }
            }
        }

        info!("Polling scheduler stopped");
    }

    /// Runs one poll cycle across all watched stages and returns how many
    /// records were dispatched.
    pub async fn poll_cycle(&self) -> usize {
        let mut dispatched = 0;

        for stage in &self.stages {
            let phase = stage.precondition();
            let records = match self.executor.context().store.query_by_phase(phase).await {
                Ok(records) => records,
                Err(e) => {
                    error!(phase = %phase, error = %e, "Phase query failed, skipping this cycle");
                    continue;
                }
            };

            if !records.is_empty() {
                debug!(
                    phase = %phase,
                    count = records.len(),
                    stage = stage.name(),
                    "Found records pending dispatch"
                );
            }

            for record in records {
                // The guard must land before dispatch, not after: inserting
                // first is what makes an overlapping cycle skip the record.
                {
                    let mut in_flight =
                        self.in_flight.lock().expect("in-flight lock poisoned");
                    if !in_flight.insert(record.id) {
                        debug!(record_id = %record.id, "Record already in flight, skipping");
                        continue;
                    }
                }
                dispatched += 1;

                info!(
                    record_id = %record.id,
                    name = %record.name,
                    stage = stage.name(),
                    "Dispatching record"
                );

                let executor = Arc::clone(&self.executor);
                let stage = Arc::clone(stage);
                let in_flight = Arc::clone(&self.in_flight);
                tokio::spawn(async move {
                    match executor.execute(stage.as_ref(), record.id).await {
                        Ok(outcome) => {
                            info!(
                                record_id = %record.id,
                                stage = stage.name(),
                                produced = outcome.produced_ref.as_deref().unwrap_or("-"),
                                recovered = outcome.recovered,
                                "Dispatched stage finished"
                            );
                        }
                        Err(WorkflowError::InvalidPrecondition { actual, .. }) => {
                            // Another dispatch got there first; nothing to do.
                            debug!(
                                record_id = %record.id,
                                stage = stage.name(),
                                actual = %actual,
                                "Record no longer in precondition phase"
                            );
                        }
                        Err(e) => {
                            warn!(
                                record_id = %record.id,
                                stage = stage.name(),
                                error = %e,
                                "Dispatched stage failed"
                            );
                        }
                    }

                    in_flight
                        .lock()
                        .expect("in-flight lock poisoned")
                        .remove(&record.id);
                });
            }
        }

        dispatched
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::backend::{BackendError, EvalMetrics, TrainedModel, TrainingBackend, TrainingSpec};
    use crate::config::PipelineConfig;
    use crate::dataset::{DatasetCandidate, DatasetSource, SourceError};
    use crate::objstore::{ObjectStore, ObjectStoreError};
    use crate::record::{Phase, PipelineRecord, ProjectPlan, StageParams};
    use crate::store::{MemoryRecordStore, RecordStore, StoreError};
    use crate::workflow::{StageContext, StageError};

    use super::*;

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
        async fn train(&self, _: &Path, _: &TrainingSpec) -> Result<TrainedModel, BackendError> {
            Err(BackendError::RequestFailed("null backend".to_string()))
        }

        async fn evaluate(&self, _: &Path, _: &Path) -> Result<EvalMetrics, BackendError> {
            Err(BackendError::RequestFailed("null backend".to_string()))
        }
    }

    /// Store whose phase queries always fail, for loop-resilience tests.
    struct DownStore;

    #[async_trait]
    impl RecordStore for DownStore {
        async fn insert_record(&self, _: &PipelineRecord) -> Result<(), StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn get_record(&self, id: Uuid) -> Result<PipelineRecord, StoreError> {
            Err(StoreError::RecordNotFound(id))
        }

        async fn query_by_phase(&self, _: Phase) -> Result<Vec<PipelineRecord>, StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn update_phase(&self, _: Uuid, _: Phase) -> Result<(), StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn update_params(&self, _: Uuid, _: &StageParams) -> Result<(), StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn insert_manifest(
            &self,
            _: &crate::record::DatasetManifest,
        ) -> Result<(), StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn manifest_for_record(
            &self,
            _: Uuid,
        ) -> Result<Option<crate::record::DatasetManifest>, StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn insert_model(&self, _: &crate::record::ModelArtifact) -> Result<(), StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn model_for_record(
            &self,
            _: Uuid,
        ) -> Result<Option<crate::record::ModelArtifact>, StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn update_model_metrics(
            &self,
            _: Uuid,
            _: f64,
            _: serde_json::Value,
        ) -> Result<(), StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn insert_log(&self, _: &crate::record::AuditLogEntry) -> Result<(), StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }

        async fn recent_logs(
            &self,
            _: Uuid,
            _: usize,
        ) -> Result<Vec<crate::record::AuditLogEntry>, StoreError> {
            Err(StoreError::ConnectionFailed("down".to_string()))
        }
    }

    /// Stage whose body sleeps, so it can straddle poll cycles.
    struct SlowStage {
        precondition: Phase,
        in_progress: Phase,
        success: Phase,
        body_delay: Duration,
        invocations: Arc<AtomicU32>,
    }

    impl SlowStage {
        fn training(body_delay: Duration, invocations: Arc<AtomicU32>) -> Self {
            Self {
                precondition: Phase::PendingTraining,
                in_progress: Phase::Training,
                success: Phase::PendingEvaluation,
                body_delay,
                invocations,
            }
        }

        fn evaluation(body_delay: Duration, invocations: Arc<AtomicU32>) -> Self {
            Self {
                precondition: Phase::PendingEvaluation,
                in_progress: Phase::Evaluating,
                success: Phase::Completed,
                body_delay,
                invocations,
            }
        }
    }

    #[async_trait]
    impl Stage for SlowStage {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn precondition(&self) -> Phase {
            self.precondition
        }

        fn in_progress(&self) -> Phase {
            self.in_progress
        }

        fn success_phase(&self) -> Phase {
            self.success
        }

        async fn run(
            &self,
            _ctx: &StageContext,
            _record: &PipelineRecord,
        ) -> Result<Option<String>, StageError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.body_delay).await;
            Ok(None)
        }

        async fn existing_artifact(
            &self,
            _ctx: &StageContext,
            _record_id: Uuid,
        ) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
    }

    fn executor_over(store: Arc<dyn RecordStore>) -> Arc<WorkflowExecutor> {
        Arc::new(WorkflowExecutor::new(StageContext {
            store,
            objects: Arc::new(NullObjects),
            source: Arc::new(NullSource),
            backend: Arc::new(NullBackend),
            config: PipelineConfig::default(),
        }))
    }

    async fn record_in_phase(store: &MemoryRecordStore, phase: Phase) -> PipelineRecord {
        let plan = ProjectPlan::new("r", vec!["k".to_string()]);
        let mut record = PipelineRecord::from_plan(&plan);
        record.phase = phase;
        store.insert_record(&record).await.unwrap();
        record
    }

    async fn wait_until_idle(scheduler: &PollScheduler) {
        for _ in 0..200 {
            if scheduler.in_flight_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scheduler never drained");
    }

    #[tokio::test]
    async fn test_back_to_back_cycles_dispatch_once() {
        let store = Arc::new(MemoryRecordStore::new());
        let record = record_in_phase(&store, Phase::PendingTraining).await;

        let invocations = Arc::new(AtomicU32::new(0));
        let stage = Arc::new(SlowStage::training(
            Duration::from_millis(200),
            Arc::clone(&invocations),
        ));
        let scheduler = PollScheduler::new(
            executor_over(Arc::clone(&store) as Arc<dyn RecordStore>),
            vec![stage],
            Duration::from_secs(10),
        );

        // Two cycles while the body is still sleeping.
        assert_eq!(scheduler.poll_cycle().await, 1);
        assert_eq!(scheduler.poll_cycle().await, 0);
        assert_eq!(scheduler.in_flight_count(), 1);

        wait_until_idle(&scheduler).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let fetched = store.get_record(record.id).await.unwrap();
        assert_eq!(fetched.phase, Phase::PendingEvaluation);
    }

    #[tokio::test]
    async fn test_completed_record_not_redispatched() {
        let store = Arc::new(MemoryRecordStore::new());
        record_in_phase(&store, Phase::PendingTraining).await;

        let invocations = Arc::new(AtomicU32::new(0));
        let stage = Arc::new(SlowStage::training(
            Duration::from_millis(1),
            Arc::clone(&invocations),
        ));
        let scheduler = PollScheduler::new(
            executor_over(store),
            vec![stage],
            Duration::from_secs(10),
        );

        assert_eq!(scheduler.poll_cycle().await, 1);
        wait_until_idle(&scheduler).await;

        // The record advanced out of the watched phase, so the next cycle
        // finds nothing even though the in-flight set is empty again.
        assert_eq!(scheduler.poll_cycle().await, 0);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_scheduler_serves_multiple_phases() {
        let store = Arc::new(MemoryRecordStore::new());
        record_in_phase(&store, Phase::PendingTraining).await;
        record_in_phase(&store, Phase::PendingEvaluation).await;

        let train_calls = Arc::new(AtomicU32::new(0));
        let eval_calls = Arc::new(AtomicU32::new(0));
        let scheduler = PollScheduler::new(
            executor_over(store),
            vec![
                Arc::new(SlowStage::training(
                    Duration::from_millis(1),
                    Arc::clone(&train_calls),
                )),
                Arc::new(SlowStage::evaluation(
                    Duration::from_millis(1),
                    Arc::clone(&eval_calls),
                )),
            ],
            Duration::from_secs(10),
        );

        assert_eq!(scheduler.poll_cycle().await, 2);
        wait_until_idle(&scheduler).await;

        assert_eq!(train_calls.load(Ordering::SeqCst), 1);
        assert_eq!(eval_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_outage_does_not_panic_the_cycle() {
        let invocations = Arc::new(AtomicU32::new(0));
        let stage = Arc::new(SlowStage::training(
            Duration::from_millis(1),
            Arc::clone(&invocations),
        ));
        let scheduler = PollScheduler::new(
            executor_over(Arc::new(DownStore)),
            vec![stage],
            Duration::from_secs(10),
        );

        assert_eq!(scheduler.poll_cycle().await, 0);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_ends_the_loop() {
        let store = Arc::new(MemoryRecordStore::new());
        let invocations = Arc::new(AtomicU32::new(0));
        let stage = Arc::new(SlowStage::training(
            Duration::from_millis(1),
            Arc::clone(&invocations),
        ));
        let scheduler = Arc::new(PollScheduler::new(
            executor_over(store),
            vec![stage],
            Duration::from_millis(10),
        ));

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.stop();

        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
