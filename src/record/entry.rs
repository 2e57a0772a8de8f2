//! Pipeline record and per-record stage parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::Phase;

/// Default model architecture when a plan does not name one.
pub const DEFAULT_ARCHITECTURE: &str = "resnet18";

/// Default dataset size cap in gigabytes for acquisition.
pub const DEFAULT_MAX_DATASET_SIZE_GB: f64 = 50.0;

/// Typed stage parameters carried on a pipeline record.
///
/// Named optional fields cover everything the stages read; anything a caller
/// wants to attach beyond that goes into the free-form `extra` map. Stages
/// never gate scheduling decisions on these values, only the record's phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageParams {
    /// Keywords used by the acquisition stage to search for a dataset.
    #[serde(default)]
    pub search_keywords: Vec<String>,
    /// Preferred model architecture (e.g. "resnet18").
    #[serde(default)]
    pub preferred_model: Option<String>,
    /// Number of training epochs.
    #[serde(default)]
    pub epochs: Option<u32>,
    /// Learning rate for training.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// Fraction of each class used for training during auto-split.
    #[serde(default)]
    pub train_ratio: Option<f64>,
    /// Fraction of each class used for validation during auto-split.
    #[serde(default)]
    pub val_ratio: Option<f64>,
    /// Hard cap on acquired dataset size in gigabytes.
    #[serde(default)]
    pub max_dataset_size_gb: Option<f64>,
    /// Storage reference of the export bundle, set by the evaluation stage.
    #[serde(default)]
    pub bundle_ref: Option<String>,
    /// Free-form extension map for values no stage interprets.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StageParams {
    /// Returns the architecture to train, falling back to the default.
    pub fn architecture(&self) -> &str {
        self.preferred_model.as_deref().unwrap_or(DEFAULT_ARCHITECTURE)
    }

    /// Returns the dataset size cap, falling back to the default.
    pub fn size_cap_gb(&self) -> f64 {
        self.max_dataset_size_gb.unwrap_or(DEFAULT_MAX_DATASET_SIZE_GB)
    }
}

/// Validated project plan produced by the upstream intake step.
///
/// Intake turns a user request into a plan; submitting the plan creates a
/// pipeline record in `pending_dataset` that the acquisition scheduler will
/// discover on its next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPlan {
    /// Human-readable project name.
    pub name: String,
    /// ML task type.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Keywords for dataset search.
    pub search_keywords: Vec<String>,
    /// Preferred model architecture.
    #[serde(default = "default_architecture")]
    pub preferred_model: String,
    /// Target evaluation metric name.
    #[serde(default = "default_target_metric")]
    pub target_metric: String,
    /// Target value for the metric.
    #[serde(default = "default_target_value")]
    pub target_value: f64,
    /// Maximum dataset size to acquire, in gigabytes.
    #[serde(default = "default_max_size_gb")]
    pub max_dataset_size_gb: f64,
}

fn default_task_type() -> String {
    "image_classification".to_string()
}

fn default_architecture() -> String {
    DEFAULT_ARCHITECTURE.to_string()
}

fn default_target_metric() -> String {
    "accuracy".to_string()
}

fn default_target_value() -> f64 {
    0.9
}

fn default_max_size_gb() -> f64 {
    DEFAULT_MAX_DATASET_SIZE_GB
}

impl ProjectPlan {
    /// Creates a plan with defaults for everything but name and keywords.
    pub fn new(name: impl Into<String>, search_keywords: Vec<String>) -> Self {
        Self {
            name: name.into(),
            task_type: default_task_type(),
            search_keywords,
            preferred_model: default_architecture(),
            target_metric: default_target_metric(),
            target_value: default_target_value(),
            max_dataset_size_gb: default_max_size_gb(),
        }
    }

    /// Sets the preferred model architecture.
    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = model.into();
        self
    }

    /// Sets the dataset size cap in gigabytes.
    pub fn with_max_dataset_size_gb(mut self, gb: f64) -> Self {
        self.max_dataset_size_gb = gb;
        self
    }

    /// Converts the plan into the stage parameters stored on the record.
    pub fn to_params(&self) -> StageParams {
        let mut extra = serde_json::Map::new();
        extra.insert(
            "task_type".to_string(),
            serde_json::Value::String(self.task_type.clone()),
        );
        extra.insert(
            "target_metric".to_string(),
            serde_json::Value::String(self.target_metric.clone()),
        );
        if let Some(value) = serde_json::Number::from_f64(self.target_value) {
            extra.insert("target_value".to_string(), serde_json::Value::Number(value));
        }

        StageParams {
            search_keywords: self.search_keywords.clone(),
            preferred_model: Some(self.preferred_model.clone()),
            max_dataset_size_gb: Some(self.max_dataset_size_gb),
            extra,
            ..StageParams::default()
        }
    }
}

/// The unit of work flowing through the pipeline.
///
/// Created by intake in `pending_dataset`, advanced only by stage executors,
/// never deleted (terminal records are retained for audit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Project name.
    pub name: String,
    /// Current lifecycle phase; the single source of truth for scheduling.
    pub phase: Phase,
    /// Typed stage parameters.
    pub params: StageParams,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl PipelineRecord {
    /// Creates a new record in `pending_dataset` from a project plan.
    pub fn from_plan(plan: &ProjectPlan) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: plan.name.clone(),
            phase: Phase::PendingDataset,
            params: plan.to_params(),
            created_at: now,
            updated_at: now,
        }
    }
}
