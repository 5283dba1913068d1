//! Reproduction result model and history merge semantics.
//!
//! One [`EnhancedResult`] is appended per reproduction attempt and never
//! mutated afterwards; the per-version [`ResultHistory`] is the storage
//! unit. On every run the history is re-normalized: deduplicated so that
//! each reproducer tool version keeps exactly one entry (preferring entries
//! that carry comparison data, then the most recent), and re-sorted into a
//! total order (ascending timestamp, semantic tool-version order breaking
//! ties).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compare::ComparisonResult;
use crate::gitref::SourceDescriptor;
use crate::nodever::compare_versions;
use crate::registry::PublishRecord;

/// Immutable identity of a reproduction request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageSpec {
    /// Package name.
    pub name: String,
    /// The version or range as requested by the caller.
    pub requested: String,
    /// The resolved exact version.
    pub version: String,
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Publish-record subset persisted for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageDisplay {
    /// Package name.
    pub name: String,
    /// Exact version.
    pub version: String,
    /// Published tarball URL.
    pub tarball_url: String,
    /// Published integrity digest, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// Publish timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl From<&PublishRecord> for PackageDisplay {
    fn from(record: &PublishRecord) -> Self {
        Self {
            name: record.name.clone(),
            version: record.version.clone(),
            tarball_url: record.tarball_url.clone(),
            integrity: record.integrity.clone(),
            published_at: record.published_at,
        }
    }
}

/// One reproduction attempt. Append-only: never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReproductionResult {
    /// Version of this tool that produced the attempt.
    pub tool_version: String,
    /// Wall-clock time of the attempt.
    pub checked_at: DateTime<Utc>,
    /// Host operating system.
    pub os: String,
    /// Host architecture.
    pub arch: String,
    /// Strategy identifier, e.g. `npm:10.2.3+node:16.14.2`; records
    /// toolchain substitutions so consumers can discount the result.
    pub strategy: String,
    /// Whether the rebuilt artifact digest matched the published one.
    pub reproduced: bool,
    /// Whether the published artifact carries a publisher provenance
    /// attestation (independent of our own rebuild).
    pub attested: bool,
    /// Publish-record subset for display.
    pub package: PackageDisplay,
    /// Source location used; absent when reproduction was not attempted
    /// (no source tracking available).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDescriptor>,
}

/// A reproduction attempt enriched with comparison output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnhancedResult {
    /// The underlying attempt.
    #[serde(flatten)]
    pub reproduction: ReproductionResult,
    /// File-by-file comparison; absent when comparison could not run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonResult>,
    /// Fingerprint of the comparison logic that produced `comparison`.
    pub comparator: String,
    /// Transitive production dependencies discovered during the
    /// constrained rebuild.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_dependencies: Option<Vec<String>>,
}

impl EnhancedResult {
    /// Staleness signal for the external scheduler: a stored result is
    /// stale when a different tool version produced it, when it lacks
    /// comparison data, or when the comparison logic has changed since.
    #[must_use]
    pub fn is_stale(&self, current_tool_version: &str, current_comparator: &str) -> bool {
        self.reproduction.tool_version != current_tool_version
            || self.comparison.is_none()
            || self.comparator != current_comparator
    }
}

/// Ordered, deduplicated history of attempts for one package version.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ResultHistory {
    /// The entries, normalized on every merge.
    pub entries: Vec<EnhancedResult>,
}

impl ResultHistory {
    /// Append an attempt, then re-normalize (dedup + sort).
    pub fn merge(&mut self, entry: EnhancedResult) {
        self.entries.push(entry);
        self.normalize();
    }

    /// Enforce the storage invariants: one entry per tool version
    /// (preferring comparison-carrying, then most recent), ascending
    /// timestamp order with semantic tool-version tie-break.
    pub fn normalize(&mut self) {
        let mut by_tool: BTreeMap<String, EnhancedResult> = BTreeMap::new();
        for entry in self.entries.drain(..) {
            let key = entry.reproduction.tool_version.clone();
            match by_tool.remove(&key) {
                Some(incumbent) => {
                    by_tool.insert(key, prefer(entry, incumbent));
                },
                None => {
                    by_tool.insert(key, entry);
                },
            }
        }

        let mut entries: Vec<EnhancedResult> = by_tool.into_values().collect();
        entries.sort_by(|a, b| {
            a.reproduction
                .checked_at
                .cmp(&b.reproduction.checked_at)
                .then_with(|| {
                    compare_versions(
                        &a.reproduction.tool_version,
                        &b.reproduction.tool_version,
                    )
                })
        });
        self.entries = entries;
    }

    /// Most recent entry after normalization.
    #[must_use]
    pub fn latest(&self) -> Option<&EnhancedResult> {
        self.entries.last()
    }

    /// Scheduling signal for the external orchestration collaborator:
    /// this version needs reprocessing when no entry exists yet or the
    /// most recent one is stale.
    #[must_use]
    pub fn needs_refresh(&self, current_tool_version: &str, current_comparator: &str) -> bool {
        self.latest()
            .map_or(true, |entry| entry.is_stale(current_tool_version, current_comparator))
    }
}

/// Pick the entry to keep between two attempts from the same tool version:
/// comparison data beats none; otherwise the most recent timestamp wins,
/// with the newly appended entry winning exact ties.
fn prefer(candidate: EnhancedResult, incumbent: EnhancedResult) -> EnhancedResult {
    match (candidate.comparison.is_some(), incumbent.comparison.is_some()) {
        (true, false) => candidate,
        (false, true) => incumbent,
        _ => {
            if candidate.reproduction.checked_at >= incumbent.reproduction.checked_at {
                candidate
            } else {
                incumbent
            }
        },
    }
}
