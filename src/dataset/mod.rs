//! Dataset handling: structure normalization, archives, and sources.
//!
//! - `normalize`: reshapes an extracted archive into the canonical
//!   `train/` + `val/` + `test/` layout the training stage requires
//! - `archive`: tar.gz pack/unpack for dataset and bundle transport
//! - `source`: the `DatasetSource` trait and candidate ranking used by
//!   the acquisition stage

pub mod archive;
pub mod normalize;
pub mod source;

// Re-export main types for convenience
pub use archive::{pack_tar_gz, unpack_tar_gz, ArchiveError};
pub use normalize::{count_classes, normalize_dataset, NormalizeError, SplitRatios};
pub use source::{rank_candidates, DatasetCandidate, DatasetSource, LocalDatasetSource, SourceError};
