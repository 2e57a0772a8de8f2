//! Embedded database schema.
//!
//! All statements use `IF NOT EXISTS` so applying them repeatedly is safe;
//! the migration runner in [`super::postgres`] additionally records each
//! statement in a `_migrations` table to skip re-execution.

/// Returns every schema statement in application order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_PIPELINE_RECORDS,
        CREATE_PIPELINE_RECORDS_PHASE_INDEX,
        CREATE_DATASET_MANIFESTS,
        CREATE_DATASET_MANIFESTS_RECORD_INDEX,
        CREATE_MODEL_ARTIFACTS,
        CREATE_MODEL_ARTIFACTS_RECORD_INDEX,
        CREATE_AUDIT_LOG,
        CREATE_AUDIT_LOG_RECORD_INDEX,
    ]
}

/// The unit of work. `phase` gates scheduling; schedulers query it every
/// cycle, so it carries an index. Records are never deleted.
const CREATE_PIPELINE_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_records (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    phase TEXT NOT NULL,
    params JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_PIPELINE_RECORDS_PHASE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pipeline_records_phase ON pipeline_records (phase)
"#;

/// One manifest per record, written once by the acquisition stage.
const CREATE_DATASET_MANIFESTS: &str = r#"
CREATE TABLE IF NOT EXISTS dataset_manifests (
    id UUID PRIMARY KEY,
    record_id UUID NOT NULL REFERENCES pipeline_records (id),
    name TEXT NOT NULL,
    source TEXT NOT NULL,
    storage_ref TEXT NOT NULL,
    size_bytes BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_DATASET_MANIFESTS_RECORD_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_dataset_manifests_record ON dataset_manifests (record_id)
"#;

/// One model artifact per record, written by training; evaluation attaches
/// `accuracy` and `metrics` afterwards.
const CREATE_MODEL_ARTIFACTS: &str = r#"
CREATE TABLE IF NOT EXISTS model_artifacts (
    id UUID PRIMARY KEY,
    record_id UUID NOT NULL REFERENCES pipeline_records (id),
    name TEXT NOT NULL,
    storage_ref TEXT NOT NULL,
    architecture TEXT NOT NULL,
    accuracy DOUBLE PRECISION,
    metrics JSONB,
    metadata JSONB NOT NULL DEFAULT 'null',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_MODEL_ARTIFACTS_RECORD_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_model_artifacts_record ON model_artifacts (record_id)
"#;

/// Append-only audit log. `record_id` is nullable for pre-record events.
const CREATE_AUDIT_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id BIGSERIAL PRIMARY KEY,
    record_id UUID,
    stage TEXT NOT NULL,
    message TEXT NOT NULL,
    level TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_AUDIT_LOG_RECORD_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_audit_log_record ON audit_log (record_id)
"#;
