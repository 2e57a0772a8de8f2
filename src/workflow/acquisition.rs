//! Acquisition stage: find, fetch and store a dataset for a record.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::dataset::rank_candidates;
use crate::record::{AuditLogEntry, DatasetManifest, LogLevel, Phase, PipelineRecord};
use crate::retry::execute_with_retry;
use crate::store::StoreError;

use super::{storage_slug, Stage, StageContext, StageError};

/// Moves records from `pending_dataset` to `pending_training`.
///
/// Searches the configured dataset source for the record's keywords, ranks
/// the candidates, fetches the best archive, uploads it to the object store
/// under `raw/` and writes the dataset manifest. The manifest is the
/// check-before-fail artifact, and because it is this stage's entire
/// effect, a partial success advances the record anyway.
pub struct AcquisitionStage;

#[async_trait]
impl Stage for AcquisitionStage {
    fn name(&self) -> &'static str {
        "acquisition"
    }

    fn precondition(&self) -> Phase {
        Phase::PendingDataset
    }

    fn in_progress(&self) -> Phase {
        Phase::Acquiring
    }

    fn success_phase(&self) -> Phase {
        Phase::PendingTraining
    }

    fn advance_on_partial(&self) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: &StageContext,
        record: &PipelineRecord,
    ) -> Result<Option<String>, StageError> {
        let keywords = &record.params.search_keywords;
        if keywords.is_empty() {
            return Err(StageError::Validation(
                "record has no search keywords".to_string(),
            ));
        }
        let max_size_gb = record.params.size_cap_gb();

        let query = keywords.join(" ");
        let candidates =
            execute_with_retry("search_datasets", &query, &ctx.config.io_retry, || {
                ctx.source.search(keywords)
            })
            .await?;

        let best = rank_candidates(&candidates, keywords, max_size_gb).ok_or_else(|| {
            StageError::Validation(format!("no suitable dataset found for keywords '{query}'"))
        })?;

        let _ = ctx
            .store
            .insert_log(&AuditLogEntry::new(
                record.id,
                self.name(),
                format!(
                    "selected dataset '{}' ({:.2} GB) from source '{}'",
                    best.slug,
                    best.size_gb(),
                    ctx.source.name()
                ),
                LogLevel::Info,
            ))
            .await;

        let scratch = tempfile::tempdir()?;
        let archive_path =
            execute_with_retry("fetch_dataset", &best.slug, &ctx.config.io_retry, || {
                ctx.source.fetch(&best.slug, scratch.path())
            })
            .await?;
        let size_bytes = std::fs::metadata(&archive_path)?.len();

        let storage_ref = format!("raw/{}.tar.gz", storage_slug(&best.slug));
        execute_with_retry("upload_dataset", &storage_ref, &ctx.config.io_retry, || {
            ctx.objects.upload(&archive_path, &storage_ref)
        })
        .await?;

        info!(
            record_id = %record.id,
            slug = %best.slug,
            storage_ref = %storage_ref,
            size_bytes = size_bytes,
            "Dataset stored"
        );

        let manifest = DatasetManifest::new(
            record.id,
            &best.slug,
            ctx.source.name(),
            &storage_ref,
            size_bytes,
        );
        ctx.store.insert_manifest(&manifest).await?;

        Ok(Some(storage_ref))
    }

    async fn existing_artifact(
        &self,
        ctx: &StageContext,
        record_id: Uuid,
    ) -> Result<Option<String>, StoreError> {
        Ok(ctx
            .store
            .manifest_for_record(record_id)
            .await?
            .map(|m| m.storage_ref))
    }
}
