//! Dataset sources and candidate ranking for the acquisition stage.
//!
//! A [`DatasetSource`] answers keyword searches with candidate archives and
//! fetches a chosen candidate to local disk. Remote catalogs (Kaggle-style
//! APIs) live behind the same trait; [`LocalDatasetSource`] serves archives
//! from a directory and backs development and tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while searching or fetching datasets.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The requested dataset does not exist in the source.
    #[error("dataset not found: {0}")]
    NotFound(String),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The source itself is unreachable or misbehaving.
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// A dataset archive a source can deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetCandidate {
    /// Source-side identifier used to fetch the archive.
    pub slug: String,
    /// Archive size in bytes; zero means the source could not tell.
    pub size_bytes: u64,
    /// Popularity signal, when the source tracks one.
    pub downloads: u64,
}

impl DatasetCandidate {
    /// Returns the candidate's size in gigabytes.
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Provider of downloadable datasets.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Short name recorded on the dataset manifest (e.g. "local").
    fn name(&self) -> &'static str;

    /// Searches for candidate archives matching the keywords.
    async fn search(&self, keywords: &[String]) -> Result<Vec<DatasetCandidate>, SourceError>;

    /// Fetches the archive for `slug` into `dest_dir` and returns its path.
    async fn fetch(&self, slug: &str, dest_dir: &Path) -> Result<PathBuf, SourceError>;
}

/// Picks the best candidate for the given keywords, or `None` when nothing
/// usable remains after filtering.
///
/// Candidates larger than `max_size_gb` or with unknown size are dropped.
/// The rest are scored: keyword hits in the slug dominate, download
/// popularity comes next, and a 1-10 GB size band is preferred as the sweet
/// spot between "too small to train on" and "too slow to move around".
pub fn rank_candidates(
    candidates: &[DatasetCandidate],
    keywords: &[String],
    max_size_gb: f64,
) -> Option<DatasetCandidate> {
    let mut scored: Vec<(i64, &DatasetCandidate)> = candidates
        .iter()
        .filter(|c| {
            let size_gb = c.size_gb();
            size_gb > 0.0 && size_gb <= max_size_gb
        })
        .map(|c| (score_candidate(c, keywords), c))
        .collect();

    if scored.is_empty() {
        return None;
    }

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.slug.cmp(&b.1.slug)));

    for (score, candidate) in scored.iter().take(5) {
        debug!(
            slug = %candidate.slug,
            score = score,
            size_gb = format!("{:.2}", candidate.size_gb()),
            downloads = candidate.downloads,
            "Ranked dataset candidate"
        );
    }

    let (score, best) = scored[0];
    info!(
        slug = %best.slug,
        score = score,
        size_gb = format!("{:.2}", best.size_gb()),
        "Selected dataset candidate"
    );

    Some(best.clone())
}

fn score_candidate(candidate: &DatasetCandidate, keywords: &[String]) -> i64 {
    let slug_lower = candidate.slug.to_lowercase();
    let mut score = 0i64;

    // Keyword relevance dominates everything else.
    let keyword_matches = keywords
        .iter()
        .filter(|kw| slug_lower.contains(&kw.to_lowercase()))
        .count() as i64;
    score += keyword_matches * 100;

    // Download popularity.
    if candidate.downloads > 1000 {
        score += 50;
    } else if candidate.downloads > 100 {
        score += 25;
    } else if candidate.downloads > 10 {
        score += 10;
    }

    // Size band preference.
    let size_gb = candidate.size_gb();
    if (1.0..=10.0).contains(&size_gb) {
        score += 30;
    } else if (0.1..1.0).contains(&size_gb) {
        score += 15;
    } else if size_gb > 10.0 {
        score += 5;
    }

    score
}

/// Dataset source backed by a directory of `.tar.gz` archives.
///
/// The archive file stem is the candidate slug; a candidate matches a search
/// when its stem contains at least one keyword. Download counts are unknown
/// and reported as zero.
pub struct LocalDatasetSource {
    catalog_dir: PathBuf,
}

impl LocalDatasetSource {
    /// Creates a source over the given catalog directory.
    pub fn new(catalog_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog_dir: catalog_dir.into(),
        }
    }

    fn archive_path(&self, slug: &str) -> PathBuf {
        self.catalog_dir.join(format!("{slug}.tar.gz"))
    }
}

#[async_trait]
impl DatasetSource for LocalDatasetSource {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn search(&self, keywords: &[String]) -> Result<Vec<DatasetCandidate>, SourceError> {
        let mut candidates = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.catalog_dir)
            .await
            .map_err(|e| SourceError::Unavailable(format!("catalog unreadable: {e}")))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(slug) = file_name.strip_suffix(".tar.gz") else {
                continue;
            };

            let slug_lower = slug.to_lowercase();
            let matches = keywords
                .iter()
                .any(|kw| slug_lower.contains(&kw.to_lowercase()));
            if !matches {
                continue;
            }

            let size_bytes = tokio::fs::metadata(&path).await?.len();
            candidates.push(DatasetCandidate {
                slug: slug.to_string(),
                size_bytes,
                downloads: 0,
            });
        }

        candidates.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(candidates)
    }

    async fn fetch(&self, slug: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        let src = self.archive_path(slug);
        if !src.is_file() {
            return Err(SourceError::NotFound(slug.to_string()));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(format!("{slug}.tar.gz"));
        tokio::fs::copy(&src, &dest).await?;

        Ok(dest)
    }
}
