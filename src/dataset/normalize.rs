//! Dataset structure normalization.
//!
//! Downloaded archives arrive in wildly inconsistent shapes: payloads wrapped
//! in a single top-level folder, `Train`/`TEST` casing, train/test without a
//! validation split, or bare class folders with no split at all. This module
//! deterministically reshapes such a tree, in place, into the canonical
//! layout every downstream stage relies on:
//!
//! ```text
//! dataset/
//!   train/<class>/<images>
//!   val/<class>/<images>
//!   test/<class>/<images>
//! ```
//!
//! The steps run in a fixed order and each is independently idempotent, so
//! rerunning the normalizer on an already-normalized tree is a no-op. All
//! shuffles are seeded, so the same input always produces the same split
//! membership.

use std::fs;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fixed seed for split shuffles. Reproducible evaluation requires that the
/// same input file set always lands in the same split.
const SPLIT_SEED: u64 = 42;

/// File extensions treated as images; everything else is left untouched.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tiff"];

/// Top-level directory names that are never treated as class folders.
const RESERVED_DIRS: &[&str] = &["train", "val", "test", "validation"];

/// Errors that can occur during dataset normalization.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Split ratios do not describe a valid partition.
    #[error("invalid split ratios: train={train}, val={val} (ratios must be positive and train + val < 1.0)")]
    InvalidRatios { train: f64, val: f64 },

    /// The expected directory does not exist or is not a directory.
    #[error("directory not found: {0}")]
    MissingDirectory(PathBuf),

    /// No class folders were found to auto-split.
    #[error("no class folders found in {0}")]
    NoClasses(PathBuf),

    /// The tree is missing required split directories after normalization.
    #[error("dataset layout incomplete, missing: {missing}")]
    MissingLayout { missing: String },
}

/// Fractions of each class assigned to train and validation during
/// auto-splitting; the remainder goes to test.
#[derive(Debug, Clone, Copy)]
pub struct SplitRatios {
    /// Fraction of each class used for training.
    pub train: f64,
    /// Fraction of each class used for validation.
    pub val: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self { train: 0.7, val: 0.2 }
    }
}

impl SplitRatios {
    /// Creates ratios, leaving validation to the caller via [`validate`].
    ///
    /// [`validate`]: SplitRatios::validate
    pub fn new(train: f64, val: f64) -> Self {
        Self { train, val }
    }

    /// Returns the implied test fraction.
    pub fn test(&self) -> f64 {
        1.0 - self.train - self.val
    }

    /// Checks that the ratios describe a valid three-way partition.
    ///
    /// # Errors
    ///
    /// Returns `NormalizeError::InvalidRatios` when either ratio is
    /// non-positive or `train + val >= 1.0`.
    pub fn validate(&self) -> Result<(), NormalizeError> {
        if self.train <= 0.0 || self.val <= 0.0 || self.train + self.val >= 1.0 {
            return Err(NormalizeError::InvalidRatios {
                train: self.train,
                val: self.val,
            });
        }
        Ok(())
    }
}

/// Normalizes an extracted dataset directory in place.
///
/// Applies, in order: wrapper flattening, case normalization, validation
/// split synthesis, auto-splitting (only when no split directory exists at
/// all), and final layout validation. On success the directory is guaranteed
/// to contain `train/`, `val/` and `test/` directories.
///
/// # Errors
///
/// Fails fast on invalid ratios before touching the tree; otherwise returns
/// the first IO error or a `MissingLayout` error when the tree cannot be
/// brought into the canonical shape.
pub fn normalize_dataset(dir: &Path, ratios: &SplitRatios) -> Result<(), NormalizeError> {
    ratios.validate()?;

    if !dir.is_dir() {
        return Err(NormalizeError::MissingDirectory(dir.to_path_buf()));
    }

    flatten_single_wrapper(dir)?;
    normalize_case(dir)?;
    synthesize_val_split(dir, ratios.val)?;

    if !has_any_split_dir(dir) {
        auto_split(dir, ratios)?;
    }

    validate_layout(dir)
}

/// Hoists a single wrapping directory's contents up one level.
///
/// Many archives wrap their payload in one top-level folder named after the
/// archive. The hoist only happens when that folder is the *only* entry at
/// the top level; any sibling file or directory means the tree is already
/// meaningful as-is. Returns whether a wrapper was flattened.
pub fn flatten_single_wrapper(dir: &Path) -> Result<bool, NormalizeError> {
    let entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;

    if entries.len() != 1 || !entries[0].path().is_dir() {
        return Ok(false);
    }

    let wrapper = entries[0].path();
    debug!(wrapper = %wrapper.display(), "Flattening single wrapper directory");

    // Rename the wrapper aside first so a child sharing its name can be
    // hoisted without colliding.
    let staging = dir.join(".flatten_staging");
    fs::rename(&wrapper, &staging)?;

    for child in fs::read_dir(&staging)? {
        let child = child?;
        fs::rename(child.path(), dir.join(child.file_name()))?;
    }
    fs::remove_dir(&staging)?;

    Ok(true)
}

/// Renames every top-level directory to its lowercase form.
///
/// Skips a rename when the lowercase name already exists, so `Train/` next
/// to `train/` never clobbers. Returns the number of directories renamed.
pub fn normalize_case(dir: &Path) -> Result<usize, NormalizeError> {
    let mut renamed = 0;

    let subdirs = list_subdirs(dir)?;
    for (name, path) in subdirs {
        let lower = name.to_lowercase();
        if name == lower {
            continue;
        }
        let target = dir.join(&lower);
        if target.exists() {
            warn!(from = %name, to = %lower, "Skipping case rename, target already exists");
            continue;
        }
        fs::rename(&path, &target)?;
        debug!(from = %name, to = %lower, "Renamed directory to lowercase");
        renamed += 1;
    }

    Ok(renamed)
}

/// Creates `val/` by moving a deterministic fraction of each class out of
/// `train/`, when the tree has `train/` and `test/` but no `val/`.
///
/// Per class, file names are sorted and then shuffled with the fixed seed;
/// the first `floor(n * val_ratio)` files move. Returns the number of files
/// moved (zero when the precondition does not hold, making the step a no-op
/// on already-complete trees).
pub fn synthesize_val_split(dir: &Path, val_ratio: f64) -> Result<usize, NormalizeError> {
    let train_dir = dir.join("train");
    let test_dir = dir.join("test");
    let val_dir = dir.join("val");

    if !train_dir.is_dir() || !test_dir.is_dir() || val_dir.exists() {
        return Ok(0);
    }

    info!(val_ratio = val_ratio, "Synthesizing validation split from training data");
    fs::create_dir_all(&val_dir)?;

    let mut total_moved = 0;
    for (class, class_dir) in list_subdirs(&train_dir)? {
        let val_class_dir = val_dir.join(&class);
        fs::create_dir_all(&val_class_dir)?;

        let mut images = image_files(&class_dir)?;
        seeded_shuffle(&mut images);

        let val_count = (images.len() as f64 * val_ratio) as usize;
        for name in images.iter().take(val_count) {
            fs::rename(class_dir.join(name), val_class_dir.join(name))?;
            total_moved += 1;
        }

        debug!(class = %class, moved = val_count, "Moved images to validation split");
    }

    info!(moved = total_moved, "Validation split created");
    Ok(total_moved)
}

/// Splits bare class folders into `train/`, `val/` and `test/`.
///
/// Every top-level directory that is not a reserved split name (and not
/// hidden) is treated as a class. Per class, file names are sorted, shuffled
/// with the fixed seed, and partitioned by position: the first
/// `floor(train * n)` to train, up to `floor((train + val) * n)` to val, the
/// remainder to test. Classes without image files are skipped with a warning
/// rather than failing the whole split. Emptied class directories are
/// removed only when actually empty; leftover non-image files keep the
/// directory in place so nothing is silently dropped.
///
/// Returns the number of files moved.
///
/// # Errors
///
/// Fails fast on invalid ratios before any mutation, and when no class
/// folders exist at all.
pub fn auto_split(dir: &Path, ratios: &SplitRatios) -> Result<usize, NormalizeError> {
    ratios.validate()?;

    let classes: Vec<_> = list_subdirs(dir)?
        .into_iter()
        .filter(|(name, _)| {
            !RESERVED_DIRS.contains(&name.to_lowercase().as_str()) && !name.starts_with('.')
        })
        .collect();

    if classes.is_empty() {
        return Err(NormalizeError::NoClasses(dir.to_path_buf()));
    }

    info!(
        classes = classes.len(),
        train = ratios.train,
        val = ratios.val,
        test = ratios.test(),
        "Auto-splitting dataset"
    );

    let train_dir = dir.join("train");
    let val_dir = dir.join("val");
    let test_dir = dir.join("test");
    fs::create_dir_all(&train_dir)?;
    fs::create_dir_all(&val_dir)?;
    fs::create_dir_all(&test_dir)?;

    let mut total_moved = 0;
    for (class, class_dir) in classes {
        let mut files = image_files(&class_dir)?;
        if files.is_empty() {
            warn!(class = %class, "No image files in class directory, skipping");
            continue;
        }
        seeded_shuffle(&mut files);

        let n = files.len();
        let train_cut = (ratios.train * n as f64) as usize;
        let val_cut = ((ratios.train + ratios.val) * n as f64) as usize;

        for split_dir in [&train_dir, &val_dir, &test_dir] {
            fs::create_dir_all(split_dir.join(&class))?;
        }

        for (i, name) in files.iter().enumerate() {
            let dest = if i < train_cut {
                train_dir.join(&class).join(name)
            } else if i < val_cut {
                val_dir.join(&class).join(name)
            } else {
                test_dir.join(&class).join(name)
            };
            fs::rename(class_dir.join(name), dest)?;
            total_moved += 1;
        }

        // Leftover non-image files keep the directory alive.
        if fs::remove_dir(&class_dir).is_err() {
            warn!(class = %class, "Class directory not empty after split, leaving in place");
        }

        debug!(
            class = %class,
            train = train_cut,
            val = val_cut - train_cut,
            test = n - val_cut,
            "Split class"
        );
    }

    info!(moved = total_moved, "Auto-split complete");
    Ok(total_moved)
}

/// Confirms `train/`, `val/` and `test/` all exist as directories.
///
/// This is the postcondition every caller of the normalizer relies on.
pub fn validate_layout(dir: &Path) -> Result<(), NormalizeError> {
    let missing: Vec<&str> = ["train", "val", "test"]
        .into_iter()
        .filter(|name| !dir.join(name).is_dir())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(NormalizeError::MissingLayout {
            missing: missing.join(", "),
        })
    }
}

/// Counts the classes of a normalized dataset by counting the
/// subdirectories of its `train/` directory.
pub fn count_classes(train_dir: &Path) -> Result<usize, NormalizeError> {
    if !train_dir.is_dir() {
        return Err(NormalizeError::MissingDirectory(train_dir.to_path_buf()));
    }
    Ok(list_subdirs(train_dir)?.len())
}

/// Returns true when any of the three split directories exists.
fn has_any_split_dir(dir: &Path) -> bool {
    ["train", "val", "test"]
        .into_iter()
        .any(|name| dir.join(name).is_dir())
}

/// Lists immediate subdirectories as (name, path), sorted by name.
fn list_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, NormalizeError> {
    let mut subdirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            subdirs.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    subdirs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(subdirs)
}

/// Lists image file names in a directory, sorted.
///
/// Sorting before the seeded shuffle makes the permutation independent of
/// directory iteration order, so the split is reproducible across platforms.
fn image_files(dir: &Path) -> Result<Vec<String>, NormalizeError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

/// Shuffles names with the fixed split seed.
fn seeded_shuffle(files: &mut [String]) {
    let mut rng = ChaCha8Rng::seed_from_u64(SPLIT_SEED);
    files.shuffle(&mut rng);
}
