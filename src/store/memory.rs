//! In-memory record store for tests and local runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::record::{
    AuditLogEntry, DatasetManifest, ModelArtifact, Phase, PipelineRecord, StageParams,
};

use super::{RecordStore, StoreError};

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, PipelineRecord>,
    manifests: Vec<DatasetManifest>,
    models: Vec<ModelArtifact>,
    logs: Vec<AuditLogEntry>,
}

/// In-process record store backed by a mutex-guarded map.
///
/// Provides the same read-your-writes behavior the precondition-gating
/// protocol requires of the production backend, which makes it a faithful
/// stand-in for workflow and scheduler tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub fn record_count(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").records.len()
    }

    /// Returns all audit log entries, oldest first.
    ///
    /// Test helper; the orchestration core itself never reads logs back.
    pub fn all_logs(&self) -> Vec<AuditLogEntry> {
        self.inner.lock().expect("store lock poisoned").logs.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert_record(&self, record: &PipelineRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> Result<PipelineRecord, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::RecordNotFound(id))
    }

    async fn query_by_phase(&self, phase: Phase) -> Result<Vec<PipelineRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.phase == phase)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn update_phase(&self, id: Uuid, phase: Phase) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(StoreError::RecordNotFound(id))?;
        record.phase = phase;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_params(&self, id: Uuid, params: &StageParams) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(StoreError::RecordNotFound(id))?;
        record.params = params.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_manifest(&self, manifest: &DatasetManifest) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.manifests.push(manifest.clone());
        Ok(())
    }

    async fn manifest_for_record(
        &self,
        record_id: Uuid,
    ) -> Result<Option<DatasetManifest>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .manifests
            .iter()
            .find(|m| m.record_id == record_id)
            .cloned())
    }

    async fn insert_model(&self, model: &ModelArtifact) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.models.push(model.clone());
        Ok(())
    }

    async fn model_for_record(&self, record_id: Uuid) -> Result<Option<ModelArtifact>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .models
            .iter()
            .find(|m| m.record_id == record_id)
            .cloned())
    }

    async fn update_model_metrics(
        &self,
        model_id: Uuid,
        accuracy: f64,
        metrics: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let model = inner
            .models
            .iter_mut()
            .find(|m| m.id == model_id)
            .ok_or(StoreError::RecordNotFound(model_id))?;
        model.accuracy = Some(accuracy);
        model.metrics = Some(metrics);
        Ok(())
    }

    async fn insert_log(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.logs.push(entry.clone());
        Ok(())
    }

    async fn recent_logs(
        &self,
        record_id: Uuid,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .logs
            .iter()
            .rev()
            .filter(|entry| entry.record_id == Some(record_id))
            .take(limit)
            .cloned()
            .collect())
    }
}
