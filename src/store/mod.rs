//! Record store gateway: persistence for records, artifacts and audit logs.
//!
//! The orchestration core talks to persistence exclusively through the
//! [`RecordStore`] trait. Two implementations are provided:
//!
//! - [`PostgresRecordStore`]: the production backend (sqlx + PostgreSQL)
//! - [`MemoryRecordStore`]: in-process backend for tests and local runs
//!
//! Any substituted implementation must provide read-your-writes consistency:
//! a stage that transitions a record's phase must observe that phase on its
//! next read, otherwise the precondition-gating protocol breaks down.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::record::{AuditLogEntry, DatasetManifest, ModelArtifact, Phase, PipelineRecord, StageParams};

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::MemoryRecordStore;
pub use postgres::PostgresRecordStore;

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the backing store failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The requested record does not exist.
    #[error("Record not found: {0}")]
    RecordNotFound(Uuid),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Serialization/deserialization of a stored value failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored value could not be interpreted (e.g. unknown phase name).
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Returns true when the error means "the thing does not exist" rather
    /// than "the store misbehaved". Not-found errors are terminal and must
    /// not be retried.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::RecordNotFound(_) | StoreError::Query(sqlx::Error::RowNotFound)
        )
    }
}

/// Gateway to the shared record store.
///
/// The `phase` column is the coordination primitive of the whole pipeline:
/// schedulers query by phase, executors gate on phase and advance it. All
/// other methods exist to persist or fetch stage artifacts and audit logs.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a freshly created pipeline record.
    async fn insert_record(&self, record: &PipelineRecord) -> Result<(), StoreError>;

    /// Fetches a record by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] when no such record exists.
    async fn get_record(&self, id: Uuid) -> Result<PipelineRecord, StoreError>;

    /// Returns all records currently in the given phase.
    async fn query_by_phase(&self, phase: Phase) -> Result<Vec<PipelineRecord>, StoreError>;

    /// Sets a record's phase and bumps `updated_at`.
    async fn update_phase(&self, id: Uuid, phase: Phase) -> Result<(), StoreError>;

    /// Replaces a record's stage parameters and bumps `updated_at`.
    async fn update_params(&self, id: Uuid, params: &StageParams) -> Result<(), StoreError>;

    /// Persists the dataset manifest produced by the acquisition stage.
    async fn insert_manifest(&self, manifest: &DatasetManifest) -> Result<(), StoreError>;

    /// Fetches the dataset manifest for a record, if one exists.
    async fn manifest_for_record(
        &self,
        record_id: Uuid,
    ) -> Result<Option<DatasetManifest>, StoreError>;

    /// Persists the model artifact produced by the training stage.
    async fn insert_model(&self, model: &ModelArtifact) -> Result<(), StoreError>;

    /// Fetches the model artifact for a record, if one exists.
    async fn model_for_record(&self, record_id: Uuid) -> Result<Option<ModelArtifact>, StoreError>;

    /// Attaches evaluation metrics to a model artifact.
    async fn update_model_metrics(
        &self,
        model_id: Uuid,
        accuracy: f64,
        metrics: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Appends an audit log entry.
    ///
    /// The log is a best-effort side channel: callers on the orchestration
    /// path are allowed to ignore the returned result, and the core never
    /// reads entries back to make decisions.
    async fn insert_log(&self, entry: &AuditLogEntry) -> Result<(), StoreError>;

    /// Returns the most recent audit log entries for a record, newest first.
    async fn recent_logs(
        &self,
        record_id: Uuid,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, StoreError>;
}
