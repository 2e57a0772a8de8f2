//! Evaluation stage: score the trained model and assemble the export bundle.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::backend::EvalMetrics;
use crate::dataset::{normalize_dataset, pack_tar_gz, unpack_tar_gz, SplitRatios};
use crate::record::{AuditLogEntry, LogLevel, Phase, PipelineRecord};
use crate::retry::execute_with_retry;
use crate::store::StoreError;

use super::{storage_slug, Stage, StageContext, StageError};

/// Moves records from `pending_evaluation` to `completed`.
///
/// Fetches the model artifact and dataset manifest fresh, downloads both,
/// re-normalizes the dataset (idempotent on an already-normalized tree),
/// evaluates on the test split, attaches metrics to the model artifact and
/// uploads a distributable bundle under `exports/`. A model artifact that
/// already carries an accuracy is the check-before-fail artifact.
pub struct EvaluationStage;

impl EvaluationStage {
    /// Builds the user-facing bundle directory: model weights, class label
    /// index and a short README.
    fn write_bundle(
        bundle_dir: &Path,
        record: &PipelineRecord,
        architecture: &str,
        model_path: &Path,
        metrics: &EvalMetrics,
    ) -> Result<(), StageError> {
        std::fs::create_dir_all(bundle_dir)?;
        std::fs::copy(model_path, bundle_dir.join("model.pt"))?;

        let labels = serde_json::to_vec_pretty(&metrics.class_labels)
            .map_err(|e| StageError::Validation(format!("labels not serializable: {e}")))?;
        std::fs::write(bundle_dir.join("labels.json"), labels)?;

        let readme = format!(
            "# {name}\n\n\
             Image classifier trained by modelforge.\n\n\
             - Architecture: {architecture}\n\
             - Classes: {classes}\n\
             - Test accuracy: {accuracy:.4}\n\n\
             `model.pt` holds the trained weights; `labels.json` maps\n\
             prediction indices to class names.\n",
            name = record.name,
            architecture = architecture,
            classes = metrics.class_labels.len(),
            accuracy = metrics.accuracy,
        );
        std::fs::write(bundle_dir.join("README.md"), readme)?;

        Ok(())
    }
}

#[async_trait]
impl Stage for EvaluationStage {
    fn name(&self) -> &'static str {
        "evaluation"
    }

    fn precondition(&self) -> Phase {
        Phase::PendingEvaluation
    }

    fn in_progress(&self) -> Phase {
        Phase::Evaluating
    }

    fn success_phase(&self) -> Phase {
        Phase::Completed
    }

    async fn run(
        &self,
        ctx: &StageContext,
        record: &PipelineRecord,
    ) -> Result<Option<String>, StageError> {
        let model = ctx
            .store
            .model_for_record(record.id)
            .await?
            .ok_or_else(|| StageError::MissingInput("model artifact".to_string()))?;
        let manifest = ctx
            .store
            .manifest_for_record(record.id)
            .await?
            .ok_or_else(|| StageError::MissingInput("dataset manifest".to_string()))?;

        let _ = ctx
            .store
            .insert_log(&AuditLogEntry::new(
                record.id,
                self.name(),
                format!(
                    "metadata retrieved - model: '{}', dataset: '{}'",
                    model.name, manifest.name
                ),
                LogLevel::Info,
            ))
            .await;

        let scratch = tempfile::tempdir()?;
        let model_path = scratch.path().join("model.pt");
        execute_with_retry(
            "download_model",
            &model.storage_ref,
            &ctx.config.io_retry,
            || ctx.objects.download(&model.storage_ref, &model_path),
        )
        .await?;

        let archive_path = scratch.path().join("dataset.tar.gz");
        execute_with_retry(
            "download_dataset",
            &manifest.storage_ref,
            &ctx.config.io_retry,
            || ctx.objects.download(&manifest.storage_ref, &archive_path),
        )
        .await?;

        let data_dir = scratch.path().join("dataset");
        let ratios = SplitRatios::new(
            record.params.train_ratio.unwrap_or(ctx.config.train_ratio),
            record.params.val_ratio.unwrap_or(ctx.config.val_ratio),
        );
        {
            let archive_path = archive_path.clone();
            let data_dir = data_dir.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StageError> {
                unpack_tar_gz(&archive_path, &data_dir)?;
                normalize_dataset(&data_dir, &ratios)?;
                Ok(())
            })
            .await??;
        }

        let metrics = ctx.backend.evaluate(&model_path, &data_dir).await?;
        info!(
            record_id = %record.id,
            accuracy = metrics.accuracy,
            f1_score = metrics.f1_score,
            "Evaluation finished"
        );
        let _ = ctx
            .store
            .insert_log(&AuditLogEntry::new(
                record.id,
                self.name(),
                format!("evaluation complete - accuracy: {:.2}%", metrics.accuracy * 100.0),
                LogLevel::Info,
            ))
            .await;

        ctx.store
            .update_model_metrics(model.id, metrics.accuracy, metrics.to_json())
            .await?;

        let bundle_dir = scratch.path().join("bundle");
        Self::write_bundle(&bundle_dir, record, &model.architecture, &model_path, &metrics)?;

        let bundle_archive = scratch.path().join("bundle.tar.gz");
        {
            let bundle_dir = bundle_dir.clone();
            let bundle_archive = bundle_archive.clone();
            tokio::task::spawn_blocking(move || pack_tar_gz(&bundle_dir, &bundle_archive))
                .await??;
        }

        let bundle_ref = format!("exports/{}-bundle.tar.gz", storage_slug(&record.name));
        execute_with_retry("upload_bundle", &bundle_ref, &ctx.config.io_retry, || {
            ctx.objects.upload(&bundle_archive, &bundle_ref)
        })
        .await?;

        let mut params = record.params.clone();
        params.bundle_ref = Some(bundle_ref.clone());
        ctx.store.update_params(record.id, &params).await?;

        Ok(Some(bundle_ref))
    }

    async fn existing_artifact(
        &self,
        ctx: &StageContext,
        record_id: Uuid,
    ) -> Result<Option<String>, StoreError> {
        // Only an already-evaluated model counts; an unevaluated one means
        // this stage's real work never happened.
        Ok(ctx
            .store
            .model_for_record(record_id)
            .await?
            .filter(|m| m.accuracy.is_some())
            .map(|m| m.storage_ref))
    }
}
