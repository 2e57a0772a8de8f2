//! Stage-produced artifacts and the audit log side channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Manifest describing where an acquired dataset lives.
///
/// Created once by the acquisition stage and immutable afterwards; a
/// training or evaluation rerun reads it but never rewrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    /// Unique identifier.
    pub id: Uuid,
    /// Record this dataset belongs to.
    pub record_id: Uuid,
    /// Source-side identifier of the dataset (e.g. a catalog slug).
    pub name: String,
    /// Which dataset source produced it.
    pub source: String,
    /// Object store reference of the raw archive.
    pub storage_ref: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// When the manifest was created.
    pub created_at: DateTime<Utc>,
}

impl DatasetManifest {
    /// Creates a new manifest.
    pub fn new(
        record_id: Uuid,
        name: impl Into<String>,
        source: impl Into<String>,
        storage_ref: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id,
            name: name.into(),
            source: source.into(),
            storage_ref: storage_ref.into(),
            size_bytes,
            created_at: Utc::now(),
        }
    }
}

/// A trained model produced by the training stage.
///
/// The evaluation stage attaches `accuracy` and `metrics` later; nothing
/// else is ever mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Unique identifier.
    pub id: Uuid,
    /// Record this model belongs to.
    pub record_id: Uuid,
    /// Model name.
    pub name: String,
    /// Object store reference of the model weights.
    pub storage_ref: String,
    /// Architecture identifier (e.g. "resnet18").
    pub architecture: String,
    /// Test-set accuracy, attached by evaluation.
    pub accuracy: Option<f64>,
    /// Detailed metric report, attached by evaluation.
    pub metrics: Option<serde_json::Value>,
    /// Free-form training metadata (epochs, learning rate, class count).
    pub metadata: serde_json::Value,
    /// When the artifact was created.
    pub created_at: DateTime<Utc>,
}

impl ModelArtifact {
    /// Creates a new model artifact without evaluation metrics.
    pub fn new(
        record_id: Uuid,
        name: impl Into<String>,
        storage_ref: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id,
            name: name.into(),
            storage_ref: storage_ref.into(),
            architecture: architecture.into(),
            accuracy: None,
            metrics: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Sets the training metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Severity of an audit log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Routine progress.
    Info,
    /// Something unexpected that did not stop the stage.
    Warning,
    /// A failure.
    Error,
}

impl LogLevel {
    /// Returns the canonical name used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Append-only audit log entry.
///
/// Write-only from the orchestration core's perspective: stages emit entries
/// but never read them back, so the log can never influence control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Record the entry relates to; None for pre-record events.
    pub record_id: Option<Uuid>,
    /// Name of the stage that emitted the entry.
    pub stage: String,
    /// Free-text message.
    pub message: String,
    /// Severity.
    pub level: LogLevel,
    /// When the entry was emitted.
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    /// Creates a new entry for a record.
    pub fn new(
        record_id: Uuid,
        stage: impl Into<String>,
        message: impl Into<String>,
        level: LogLevel,
    ) -> Self {
        Self {
            record_id: Some(record_id),
            stage: stage.into(),
            message: message.into(),
            level,
            created_at: Utc::now(),
        }
    }
}
