//! Tar.gz packing and unpacking for dataset and bundle transport.
//!
//! Raw datasets travel through the object store as gzipped tarballs, and the
//! evaluation stage ships its user bundle the same way. Archive I/O is
//! synchronous; stage bodies run it via `spawn_blocking` so the scheduler's
//! polling loop is never starved.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder as TarBuilder};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while packing or unpacking archives.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The source directory to pack does not exist.
    #[error("directory not found: {0}")]
    MissingDirectory(PathBuf),

    /// The archive file to unpack does not exist.
    #[error("archive not found: {0}")]
    MissingArchive(PathBuf),
}

/// Packs a directory's contents into a gzipped tarball.
///
/// Entries are stored relative to `src_dir`, so unpacking reproduces the
/// directory's contents without an extra wrapper folder.
pub fn pack_tar_gz(src_dir: &Path, dest_file: &Path) -> Result<(), ArchiveError> {
    if !src_dir.is_dir() {
        return Err(ArchiveError::MissingDirectory(src_dir.to_path_buf()));
    }

    let file = File::create(dest_file)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = TarBuilder::new(encoder);

    builder.append_dir_all(".", src_dir)?;
    builder.into_inner()?.finish()?;

    debug!(src = %src_dir.display(), dest = %dest_file.display(), "Packed archive");
    Ok(())
}

/// Unpacks a gzipped tarball into a directory, creating it if needed.
pub fn unpack_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    if !archive_path.is_file() {
        return Err(ArchiveError::MissingArchive(archive_path.to_path_buf()));
    }

    std::fs::create_dir_all(dest_dir)?;

    let file = File::open(archive_path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    archive.unpack(dest_dir)?;

    debug!(archive = %archive_path.display(), dest = %dest_dir.display(), "Unpacked archive");
    Ok(())
}
