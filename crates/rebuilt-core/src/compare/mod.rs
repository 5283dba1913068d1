//! Artifact comparison: per-file classification, scoring, and diffs.
//!
//! Both artifacts (published and rebuilt) are extracted into isolated
//! directories, the single wrapper directory convention is normalized away,
//! and the union of relative file paths is classified file by file:
//! byte-identical (after line-ending normalization for text) counts as a
//! match, divergent content carries a bounded diff for humans, and files
//! present on only one side are tracked per side. The aggregate score is
//! the matched fraction of the union.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::digest;

mod diff;
mod extract;

pub use diff::{is_binary, normalize_line_endings, unified_diff};
pub use extract::{comparison_root, extract_tarball};

/// Bump when classification rules change; stored results carrying an older
/// fingerprint are considered stale and recomputed.
const COMPARATOR_VERSION: &str = "2";

/// Line budget for stored per-file diffs.
const MAX_DIFF_LINES: usize = 120;

/// Placeholder diff body for binary divergence.
const BINARY_DIFF_SENTINEL: &str = "(binary files differ)";

/// Errors from artifact comparison. Fatal for the affected version's
/// comparison; the raw reproduction result survives without one.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompareError {
    /// Reading or unpacking an artifact failed.
    #[error("cannot extract {path}: {detail}")]
    Archive {
        /// The artifact path.
        path: String,
        /// What went wrong.
        detail: String,
    },

    /// Walking or reading a tree failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable context.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl CompareError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Per-file classification outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FileStatus {
    /// Content identical (after text normalization).
    Match,
    /// Present on both sides with differing content.
    ContentDiff,
    /// Present in the published package, absent from the rebuild.
    MissingInSource,
    /// Present in the rebuild, absent from the published package.
    MissingInPackage,
}

/// Comparison record for one relative path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileComparison {
    /// Classification.
    pub status: FileStatus,
    /// sha-256 of the published side, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_sha256: Option<String>,
    /// sha-256 of the rebuilt side, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,
    /// Size of the published side in bytes, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_bytes: Option<u64>,
    /// Size of the rebuilt side in bytes, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_bytes: Option<u64>,
    /// Bounded unified diff for textual content differences, or a binary
    /// sentinel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl FileComparison {
    /// Whether this entry is a clean match.
    #[must_use]
    pub fn is_match(&self) -> bool {
        self.status == FileStatus::Match
    }
}

/// Aggregate comparison counts and score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonSummary {
    /// Union size: every relative path seen on either side.
    pub total_files: usize,
    /// Files matching byte-for-byte (after text normalization).
    pub matching_files: usize,
    /// Files present on both sides with differing content.
    pub different_files: usize,
    /// Files only in the published package.
    pub missing_in_source: usize,
    /// Files only in the rebuild.
    pub missing_in_package: usize,
    /// `matching_files / total_files`; `1.0` for two empty trees.
    pub score: f64,
}

impl ComparisonSummary {
    fn from_counts(
        matching_files: usize,
        different_files: usize,
        missing_in_source: usize,
        missing_in_package: usize,
    ) -> Self {
        let total_files =
            matching_files + different_files + missing_in_source + missing_in_package;
        let score = if total_files == 0 {
            1.0
        } else {
            matching_files as f64 / total_files as f64
        };
        Self {
            total_files,
            matching_files,
            different_files,
            missing_in_source,
            missing_in_package,
            score,
        }
    }
}

/// Full comparison output: per-file records plus the aggregate summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonResult {
    /// Per-path records, keyed by relative path.
    pub files: BTreeMap<String, FileComparison>,
    /// Aggregate counts and score.
    pub summary: ComparisonSummary,
}

impl ComparisonResult {
    /// Reduced view for storage: drops exactly the `match` entries,
    /// preserving the summary unchanged.
    #[must_use]
    pub fn filter_non_matching(mut self) -> Self {
        self.files.retain(|_, file| !file.is_match());
        self
    }
}

/// Human-facing score bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreTier {
    /// Every file matches.
    Perfect,
    /// At least 95% of files match.
    Excellent,
    /// At least 80% of files match.
    Good,
    /// Below 80%.
    HighRisk,
}

impl ScoreTier {
    /// Bucket a score.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 1.0 {
            Self::Perfect
        } else if score >= 0.95 {
            Self::Excellent
        } else if score >= 0.8 {
            Self::Good
        } else {
            Self::HighRisk
        }
    }
}

impl fmt::Display for ScoreTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Perfect => "perfect",
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::HighRisk => "high-risk",
        };
        f.write_str(label)
    }
}

/// Identity of the comparison logic that produced a stored result. Stored
/// alongside results so that rule changes invalidate old comparisons.
#[must_use]
pub fn comparator_fingerprint() -> String {
    digest::sha256_hex(
        format!("rebuilt-comparator:v{COMPARATOR_VERSION}:sha256:lf-normalized:nul-8k").as_bytes(),
    )
}

/// Compare two extracted artifact trees at the same relative root.
///
/// # Errors
///
/// [`CompareError::Io`] when a tree cannot be walked or a file read.
pub fn compare_directories(
    published_root: &Path,
    rebuilt_root: &Path,
) -> Result<ComparisonResult, CompareError> {
    let published_files = collect_files(published_root)?;
    let rebuilt_files = collect_files(rebuilt_root)?;

    let union: BTreeSet<&String> = published_files.union(&rebuilt_files).collect();
    let mut files = BTreeMap::new();
    let (mut matching, mut different, mut missing_in_source, mut missing_in_package) =
        (0usize, 0usize, 0usize, 0usize);

    for path in union {
        let in_published = published_files.contains(path.as_str());
        let in_rebuilt = rebuilt_files.contains(path.as_str());

        let comparison = match (in_published, in_rebuilt) {
            (true, true) => {
                let published = read_side(published_root, path)?;
                let rebuilt = read_side(rebuilt_root, path)?;
                if published.hash == rebuilt.hash {
                    matching += 1;
                    FileComparison {
                        status: FileStatus::Match,
                        package_sha256: Some(published.hash),
                        source_sha256: Some(rebuilt.hash),
                        package_bytes: Some(published.bytes),
                        source_bytes: Some(rebuilt.bytes),
                        diff: None,
                    }
                } else {
                    different += 1;
                    let diff = if published.binary || rebuilt.binary {
                        BINARY_DIFF_SENTINEL.to_string()
                    } else {
                        unified_diff(&published.text, &rebuilt.text, MAX_DIFF_LINES)
                    };
                    FileComparison {
                        status: FileStatus::ContentDiff,
                        package_sha256: Some(published.hash),
                        source_sha256: Some(rebuilt.hash),
                        package_bytes: Some(published.bytes),
                        source_bytes: Some(rebuilt.bytes),
                        diff: Some(diff),
                    }
                }
            },
            (true, false) => {
                let published = read_side(published_root, path)?;
                missing_in_source += 1;
                FileComparison {
                    status: FileStatus::MissingInSource,
                    package_sha256: Some(published.hash),
                    source_sha256: None,
                    package_bytes: Some(published.bytes),
                    source_bytes: None,
                    diff: None,
                }
            },
            (false, true) => {
                let rebuilt = read_side(rebuilt_root, path)?;
                missing_in_package += 1;
                FileComparison {
                    status: FileStatus::MissingInPackage,
                    package_sha256: None,
                    source_sha256: Some(rebuilt.hash),
                    package_bytes: None,
                    source_bytes: Some(rebuilt.bytes),
                    diff: None,
                }
            },
            (false, false) => unreachable!("path came from the union"),
        };

        files.insert(path.to_string(), comparison);
    }

    let summary =
        ComparisonSummary::from_counts(matching, different, missing_in_source, missing_in_package);
    debug!(
        total = summary.total_files,
        matching = summary.matching_files,
        score = summary.score,
        "compared trees"
    );

    Ok(ComparisonResult { files, summary })
}

/// Extract both artifacts under `scratch` and compare them.
///
/// # Errors
///
/// Archive errors from extraction, I/O errors from the walk.
pub fn compare_artifacts(
    published_tarball: &Path,
    rebuilt_tarball: &Path,
    scratch: &Path,
) -> Result<ComparisonResult, CompareError> {
    let published_dir = scratch.join("published");
    let rebuilt_dir = scratch.join("rebuilt");

    extract_tarball(published_tarball, &published_dir)?;
    extract_tarball(rebuilt_tarball, &rebuilt_dir)?;

    compare_directories(
        &comparison_root(&published_dir),
        &comparison_root(&rebuilt_dir),
    )
}

struct SideContent {
    hash: String,
    bytes: u64,
    binary: bool,
    text: String,
}

fn read_side(root: &Path, relative: &str) -> Result<SideContent, CompareError> {
    let path = root.join(relative);
    let raw =
        std::fs::read(&path).map_err(|e| CompareError::io(format!("read {relative}"), e))?;

    let binary = is_binary(&raw);
    let (hash, text) = if binary {
        (digest::sha256_hex(&raw), String::new())
    } else {
        let normalized = normalize_line_endings(&raw);
        let text = String::from_utf8_lossy(&normalized).into_owned();
        (digest::sha256_hex(&normalized), text)
    };

    Ok(SideContent {
        hash,
        bytes: raw.len() as u64,
        binary,
        text,
    })
}

fn collect_files(root: &Path) -> Result<BTreeSet<String>, CompareError> {
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            CompareError::io(
                format!("walk {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walked path is under its root")
            .to_string_lossy()
            .replace('\\', "/");
        files.insert(relative);
    }
    Ok(files)
}
