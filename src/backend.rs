//! Training backend: the opaque train/evaluate collaborator.
//!
//! The orchestration core never touches model architectures or gradient
//! loops; it hands a normalized dataset directory to a [`TrainingBackend`]
//! and gets back a model file or a metric report. The bundled
//! [`HttpTrainingBackend`] talks JSON to a co-located trainer sidecar that
//! shares the worker's filesystem, so requests and responses carry local
//! paths rather than payload bytes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors that can occur while talking to the training backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request never completed (connection refused, timeout).
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The backend answered with a non-success status.
    #[error("Backend error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The backend's response body could not be interpreted.
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
}

/// What to train: architecture and hyperparameters resolved from the
/// record's stage parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSpec {
    /// Model architecture identifier (e.g. "resnet18").
    pub architecture: String,
    /// Number of classes detected in the dataset.
    pub num_classes: usize,
    /// Training epochs.
    pub epochs: u32,
    /// Learning rate.
    pub learning_rate: f64,
}

/// A completed training run.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainedModel {
    /// Local path of the written model weights.
    pub model_path: PathBuf,
    /// Wall-clock training time in seconds.
    pub training_seconds: u64,
}

/// Metric report from evaluating a model on a test split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Overall test-set accuracy in `[0, 1]`.
    pub accuracy: f64,
    /// Weighted precision.
    pub precision: f64,
    /// Weighted recall.
    pub recall: f64,
    /// Weighted F1 score.
    pub f1_score: f64,
    /// Class labels in prediction-index order.
    pub class_labels: Vec<String>,
    /// Per-class classification report.
    pub report: serde_json::Value,
}

impl EvalMetrics {
    /// Returns the detailed report plus the headline numbers as one JSON
    /// value, the shape stored on the model artifact.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "accuracy": self.accuracy,
            "precision": self.precision,
            "recall": self.recall,
            "f1_score": self.f1_score,
            "report": self.report,
        })
    }
}

/// The numeric training/evaluation subsystem, opaque to the core.
#[async_trait]
pub trait TrainingBackend: Send + Sync {
    /// Trains a model on a normalized dataset directory.
    async fn train(
        &self,
        dataset_dir: &Path,
        spec: &TrainingSpec,
    ) -> Result<TrainedModel, BackendError>;

    /// Evaluates a model file against a normalized dataset's test split.
    async fn evaluate(
        &self,
        model_path: &Path,
        dataset_dir: &Path,
    ) -> Result<EvalMetrics, BackendError>;
}

#[derive(Debug, Serialize)]
struct TrainRequest<'a> {
    dataset_dir: &'a Path,
    architecture: &'a str,
    num_classes: usize,
    epochs: u32,
    learning_rate: f64,
}

#[derive(Debug, Serialize)]
struct EvaluateRequest<'a> {
    model_path: &'a Path,
    dataset_dir: &'a Path,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: String,
}

/// JSON-over-HTTP client for a trainer sidecar.
pub struct HttpTrainingBackend {
    base_url: String,
    http_client: Client,
}

impl HttpTrainingBackend {
    /// Creates a client for the sidecar at `base_url`
    /// (e.g. "http://localhost:8500").
    ///
    /// Training runs take minutes to hours, so the request timeout is
    /// deliberately generous; cancellation is the sidecar's concern.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http_client: Client::builder()
                .timeout(Duration::from_secs(6 * 60 * 60))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Returns the sidecar base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<Req, Resp>(&self, endpoint: &str, body: &Req) -> Result<Resp, BackendError>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint);

        let response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ApiErrorResponse>().await {
                Ok(parsed) => parsed.error,
                Err(_) => format!("HTTP {status}"),
            };
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl TrainingBackend for HttpTrainingBackend {
    async fn train(
        &self,
        dataset_dir: &Path,
        spec: &TrainingSpec,
    ) -> Result<TrainedModel, BackendError> {
        info!(
            dataset_dir = %dataset_dir.display(),
            architecture = %spec.architecture,
            num_classes = spec.num_classes,
            epochs = spec.epochs,
            "Requesting training run"
        );

        let request = TrainRequest {
            dataset_dir,
            architecture: &spec.architecture,
            num_classes: spec.num_classes,
            epochs: spec.epochs,
            learning_rate: spec.learning_rate,
        };

        self.post_json("train", &request).await
    }

    async fn evaluate(
        &self,
        model_path: &Path,
        dataset_dir: &Path,
    ) -> Result<EvalMetrics, BackendError> {
        info!(
            model_path = %model_path.display(),
            dataset_dir = %dataset_dir.display(),
            "Requesting evaluation run"
        );

        let request = EvaluateRequest {
            model_path,
            dataset_dir,
        };

        self.post_json("evaluate", &request).await
    }
}
