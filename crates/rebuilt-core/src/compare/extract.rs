//! Tarball extraction for artifact comparison.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use super::CompareError;

/// Extract a gzipped tarball into `dest`, creating it first.
///
/// # Errors
///
/// [`CompareError::Archive`] when the file cannot be opened or is not a
/// readable tar.gz.
pub fn extract_tarball(tarball: &Path, dest: &Path) -> Result<(), CompareError> {
    let archive_err = |detail: String| CompareError::Archive {
        path: tarball.display().to_string(),
        detail,
    };

    std::fs::create_dir_all(dest).map_err(|e| archive_err(e.to_string()))?;
    let file = std::fs::File::open(tarball).map_err(|e| archive_err(e.to_string()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    // `unpack` refuses entries that escape `dest`.
    archive
        .unpack(dest)
        .map_err(|e| archive_err(e.to_string()))?;
    Ok(())
}

/// Resolve the comparison root inside an extracted tree: registry tarballs
/// wrap contents in a single top-level directory (conventionally
/// `package/`), and both trees must be compared at the same relative root.
#[must_use]
pub fn comparison_root(extracted: &Path) -> PathBuf {
    let entries: Vec<PathBuf> = std::fs::read_dir(extracted)
        .map(|iter| {
            iter.filter_map(Result::ok)
                .map(|entry| entry.path())
                .collect()
        })
        .unwrap_or_default();

    match entries.as_slice() {
        [single] if single.is_dir() => single.clone(),
        _ => extracted.to_path_buf(),
    }
}
