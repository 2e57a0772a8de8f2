//! Training stage: normalize the stored dataset and train a model on it.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::backend::TrainingSpec;
use crate::dataset::{count_classes, normalize_dataset, unpack_tar_gz, SplitRatios};
use crate::record::{AuditLogEntry, LogLevel, ModelArtifact, Phase, PipelineRecord};
use crate::retry::execute_with_retry;
use crate::store::StoreError;

use super::{storage_slug, Stage, StageContext, StageError};

/// Moves records from `pending_training` to `pending_evaluation`.
///
/// Fetches the dataset manifest fresh, downloads and unpacks the raw
/// archive, normalizes it into the canonical train/val/test layout, hands
/// it to the training backend and stores the resulting model under
/// `models/`. The model artifact row is the check-before-fail artifact.
pub struct TrainingStage;

impl TrainingStage {
    fn split_ratios(ctx: &StageContext, record: &PipelineRecord) -> SplitRatios {
        SplitRatios::new(
            record.params.train_ratio.unwrap_or(ctx.config.train_ratio),
            record.params.val_ratio.unwrap_or(ctx.config.val_ratio),
        )
    }
}

#[async_trait]
impl Stage for TrainingStage {
    fn name(&self) -> &'static str {
        "training"
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

    async fn run(
        &self,
        ctx: &StageContext,
        record: &PipelineRecord,
    ) -> Result<Option<String>, StageError> {
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
                format!("dataset retrieved: '{}'", manifest.name),
                LogLevel::Info,
            ))
            .await;

        let scratch = tempfile::tempdir()?;
        let archive_path = scratch.path().join("dataset.tar.gz");
        execute_with_retry(
            "download_dataset",
            &manifest.storage_ref,
            &ctx.config.io_retry,
            || ctx.objects.download(&manifest.storage_ref, &archive_path),
        )
        .await?;

        let data_dir = scratch.path().join("dataset");
        let ratios = Self::split_ratios(ctx, record);
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

        let num_classes = count_classes(&data_dir.join("train"))?;
        let _ = ctx
            .store
            .insert_log(&AuditLogEntry::new(
                record.id,
                self.name(),
                format!("detected {num_classes} classes in dataset"),
                LogLevel::Info,
            ))
            .await;

        let spec = TrainingSpec {
            architecture: record.params.architecture().to_string(),
            num_classes,
            epochs: record.params.epochs.unwrap_or(ctx.config.default_epochs),
            learning_rate: record
                .params
                .learning_rate
                .unwrap_or(ctx.config.default_learning_rate),
        };

        let trained = ctx.backend.train(&data_dir, &spec).await?;
        info!(
            record_id = %record.id,
            architecture = %spec.architecture,
            training_seconds = trained.training_seconds,
            "Training run finished"
        );

        let model_ref = format!("models/{}.pt", storage_slug(&record.name));
        execute_with_retry("upload_model", &model_ref, &ctx.config.io_retry, || {
            ctx.objects.upload(&trained.model_path, &model_ref)
        })
        .await?;

        let artifact = ModelArtifact::new(
            record.id,
            format!("{}_model", record.name),
            &model_ref,
            &spec.architecture,
        )
        .with_metadata(serde_json::json!({
            "epochs": spec.epochs,
            "learning_rate": spec.learning_rate,
            "num_classes": spec.num_classes,
            "training_seconds": trained.training_seconds,
        }));
        ctx.store.insert_model(&artifact).await?;

        Ok(Some(model_ref))
    }

    async fn existing_artifact(
        &self,
        ctx: &StageContext,
        record_id: Uuid,
    ) -> Result<Option<String>, StoreError> {
        Ok(ctx
            .store
            .model_for_record(record_id)
            .await?
            .map(|m| m.storage_ref))
    }
}
