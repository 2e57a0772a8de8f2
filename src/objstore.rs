//! Object store gateway for large binary artifacts.
//!
//! Raw dataset archives, trained model weights and export bundles are too
//! large for the record store; they live in an object store addressed by
//! string references like `raw/flowers.tar.gz`. The [`ObjectStore`] trait is
//! what stage bodies program against; [`FsObjectStore`] is the bundled
//! directory-backed implementation with SHA-256 integrity verification.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// The referenced object does not exist. Terminal, not retried.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// IO operation failed. Treated as transient by callers' retry policy.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored object does not match its recorded checksum.
    #[error("Checksum mismatch for {reference}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    /// The reference is not a valid object path.
    #[error("Invalid object reference: {0}")]
    InvalidRef(String),
}

/// Storage for large artifacts, addressed by string reference.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads a local file under `dest_ref` and returns the stored reference.
    async fn upload(&self, local_path: &Path, dest_ref: &str) -> Result<String, ObjectStoreError>;

    /// Downloads the object at `source_ref` to a local path.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::NotFound`] for missing objects so callers
    /// can tell a bad reference from a transient failure.
    async fn download(&self, source_ref: &str, local_path: &Path) -> Result<(), ObjectStoreError>;

    /// Returns whether an object exists at the reference.
    async fn exists(&self, reference: &str) -> Result<bool, ObjectStoreError>;
}

/// Directory-backed object store.
///
/// Objects are stored as files under a root directory, mirroring the
/// reference path. Each upload records a SHA-256 checksum in a sidecar file;
/// downloads verify it so a truncated or corrupted object is caught before a
/// stage trains or evaluates on it.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, ObjectStoreError> {
        if reference.is_empty() || reference.starts_with('/') {
            return Err(ObjectStoreError::InvalidRef(reference.to_string()));
        }
        let path = Path::new(reference);
        let escapes = path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes {
            return Err(ObjectStoreError::InvalidRef(reference.to_string()));
        }
        Ok(self.root.join(path))
    }

    fn checksum_path(object_path: &Path) -> PathBuf {
        let mut name = object_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".sha256");
        object_path.with_file_name(name)
    }

    fn compute_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(&self, local_path: &Path, dest_ref: &str) -> Result<String, ObjectStoreError> {
        let object_path = self.resolve(dest_ref)?;

        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = fs::read(local_path).await?;
        let checksum = Self::compute_checksum(&data);

        fs::write(&object_path, &data).await?;
        fs::write(Self::checksum_path(&object_path), &checksum).await?;

        debug!(
            reference = dest_ref,
            bytes = data.len(),
            checksum = %checksum,
            "Uploaded object"
        );

        Ok(dest_ref.to_string())
    }

    async fn download(&self, source_ref: &str, local_path: &Path) -> Result<(), ObjectStoreError> {
        let object_path = self.resolve(source_ref)?;

        let data = match fs::read(&object_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(source_ref.to_string()));
            }
            Err(e) => return Err(ObjectStoreError::Io(e)),
        };

        // A missing sidecar means the object predates checksumming; accept it.
        if let Ok(expected) = fs::read_to_string(Self::checksum_path(&object_path)).await {
            let expected = expected.trim().to_string();
            let actual = Self::compute_checksum(&data);
            if expected != actual {
                return Err(ObjectStoreError::ChecksumMismatch {
                    reference: source_ref.to_string(),
                    expected,
                    actual,
                });
            }
        }

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(local_path, &data).await?;

        debug!(reference = source_ref, bytes = data.len(), "Downloaded object");
        Ok(())
    }

    async fn exists(&self, reference: &str) -> Result<bool, ObjectStoreError> {
        let object_path = self.resolve(reference)?;
        Ok(fs::try_exists(&object_path).await?)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, FsObjectStore) {
        let tmp = TempDir::new().unwrap();
        let store = FsObjectStore::new(tmp.path());
        (tmp, store)
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let (_tmp, store) = store();
        let scratch = TempDir::new().unwrap();

        let src = scratch.path().join("archive.tar.gz");
        tokio::fs::write(&src, b"dataset-bytes").await.unwrap();

        let reference = store.upload(&src, "raw/flowers.tar.gz").await.unwrap();
        assert_eq!(reference, "raw/flowers.tar.gz");
        assert!(store.exists("raw/flowers.tar.gz").await.unwrap());

        let dest = scratch.path().join("out/archive.tar.gz");
        store.download("raw/flowers.tar.gz", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"dataset-bytes");
    }

    #[tokio::test]
    async fn test_download_missing_object_is_not_found() {
        let (_tmp, store) = store();
        let scratch = TempDir::new().unwrap();

        let err = store
            .download("raw/missing.tar.gz", &scratch.path().join("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, ObjectStoreError::NotFound(_)));
        assert!(!store.exists("raw/missing.tar.gz").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_detects_corruption() {
        let (tmp, store) = store();
        let scratch = TempDir::new().unwrap();

        let src = scratch.path().join("model.pt");
        tokio::fs::write(&src, b"weights").await.unwrap();
        store.upload(&src, "models/m.pt").await.unwrap();

        // Tamper with the stored object behind the store's back.
        tokio::fs::write(tmp.path().join("models/m.pt"), b"corrupted")
            .await
            .unwrap();

        let err = store
            .download("models/m.pt", &scratch.path().join("out.pt"))
            .await
            .unwrap_err();

        assert!(matches!(err, ObjectStoreError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_rejects_escaping_references() {
        let (_tmp, store) = store();
        let scratch = TempDir::new().unwrap();
        let src = scratch.path().join("f");
        tokio::fs::write(&src, b"x").await.unwrap();

        for reference in ["", "/etc/passwd", "../outside", "raw/../../outside"] {
            let err = store.upload(&src, reference).await.unwrap_err();
            assert!(
                matches!(err, ObjectStoreError::InvalidRef(_)),
                "accepted bad ref: {reference}"
            );
        }
    }

    #[tokio::test]
    async fn test_upload_overwrites_existing_object() {
        let (_tmp, store) = store();
        let scratch = TempDir::new().unwrap();

        let src = scratch.path().join("f");
        tokio::fs::write(&src, b"v1").await.unwrap();
        store.upload(&src, "raw/f").await.unwrap();

        tokio::fs::write(&src, b"v2").await.unwrap();
        store.upload(&src, "raw/f").await.unwrap();

        let dest = scratch.path().join("out");
        store.download("raw/f", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"v2");
    }
}
