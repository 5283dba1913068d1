//! Per-version reproduction orchestration.
//!
//! One [`Pipeline::run`] invocation covers one package and one version
//! request. Cached histories for every selected version are prefetched
//! concurrently, then versions are processed strictly one at a time
//! (resolve source, provision toolchain, fetch, build, compare, persist):
//! every iteration spawns external processes and downloads artifacts, and
//! running versions in parallel would overwhelm the host and risk
//! registry rate limits.
//!
//! Failures are contained at the version boundary: a fatal error in one
//! version's pipeline is logged with package/version/stage context,
//! recorded in the report, and never blocks the remaining versions. The
//! caller exits nonzero when anything failed, after all versions have been
//! attempted.

use std::fmt;
use std::path::Path;

use chrono::Utc;
use futures::future::try_join_all;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::build::{BuildArtifacts, ConstrainedBuilder};
use crate::cache::{CacheError, PackageKey, ResultStore};
use crate::compare::{self, ComparisonResult, ScoreTier};
use crate::config::RunConfig;
use crate::digest;
use crate::fetch::SourceFetcher;
use crate::gitref::{GitRefResolver, SourceDescriptor};
use crate::process::CommandRunner;
use crate::record::{
    EnhancedResult, PackageDisplay, PackageSpec, ReproductionResult, ResultHistory,
};
use crate::registry::{Packument, PublishRecord, Registry, RegistryError};
use crate::toolchain::ToolchainMatcher;

/// Strategy recorded for versions where reproduction was not attempted.
const STRATEGY_NONE: &str = "none";

/// Errors fatal to the whole run, before any version is processed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// Registry metadata could not be fetched.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The version request matched nothing in the packument.
    #[error("no versions of {name} match {requested}")]
    NoMatchingVersions {
        /// Package name.
        name: String,
        /// The version request as given.
        requested: String,
    },

    /// The result store failed during prefetch.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Pipeline stage named in per-version failure context, so a human can
/// re-run just the stage that broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Source URL normalization and ref selection.
    ResolveSource,
    /// Clone, ref fetch, checkout.
    FetchSource,
    /// Constrained install and pack.
    Build,
    /// Artifact download, extraction, diffing.
    Compare,
    /// History merge and store write.
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ResolveSource => "resolve-source",
            Self::FetchSource => "fetch-source",
            Self::Build => "build",
            Self::Compare => "compare",
            Self::Persist => "persist",
        };
        f.write_str(label)
    }
}

/// How one version's processing ended.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    /// The full pipeline ran and the enhanced result was persisted.
    Completed {
        /// Whether the rebuilt artifact digest matched the published one.
        reproduced: bool,
        /// Aggregate comparison score.
        score: f64,
    },
    /// Reproduction was not attempted (no source tracking available).
    Skipped {
        /// Why, verbatim from the resolver.
        reason: String,
    },
    /// A stage failed; later stages did not run.
    Failed {
        /// The stage that failed.
        stage: Stage,
        /// Failure message.
        message: String,
    },
}

/// Outcome of one version's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionOutcome {
    /// The exact version processed.
    pub version: String,
    /// How processing ended.
    pub status: OutcomeStatus,
}

impl fmt::Display for VersionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            OutcomeStatus::Completed { reproduced, score } => write!(
                f,
                "{}: {} (score {score:.3}, {})",
                self.version,
                if *reproduced { "reproduced" } else { "not reproduced" },
                ScoreTier::from_score(*score),
            ),
            OutcomeStatus::Skipped { reason } => {
                write!(f, "{}: skipped ({reason})", self.version)
            },
            OutcomeStatus::Failed { stage, message } => {
                write!(f, "{}: failed at {stage}: {message}", self.version)
            },
        }
    }
}

/// Aggregate outcome of one invocation.
#[derive(Debug)]
pub struct RunReport {
    /// Package name.
    pub package: String,
    /// One outcome per processed version, in processing order.
    pub outcomes: Vec<VersionOutcome>,
}

impl RunReport {
    /// How many versions failed. The caller maps nonzero to a failing
    /// exit code so upstream automation retries unprocessed work.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Failed { .. }))
            .count()
    }
}

/// A stage failure, caught at the version boundary.
struct StageFailure {
    stage: Stage,
    message: String,
}

impl StageFailure {
    fn new(stage: Stage, error: impl fmt::Display) -> Self {
        Self {
            stage,
            message: error.to_string(),
        }
    }
}

/// Sequences the reproduction stages over a list of versions.
pub struct Pipeline<'a> {
    config: &'a RunConfig,
    runner: &'a dyn CommandRunner,
    registry: &'a dyn Registry,
    store: &'a dyn ResultStore,
}

impl<'a> Pipeline<'a> {
    /// Assemble a pipeline over the injected collaborator boundaries.
    #[must_use]
    pub fn new(
        config: &'a RunConfig,
        runner: &'a dyn CommandRunner,
        registry: &'a dyn Registry,
        store: &'a dyn ResultStore,
    ) -> Self {
        Self {
            config,
            runner,
            registry,
            store,
        }
    }

    /// Process every version of `name` selected by `requested`.
    ///
    /// # Errors
    ///
    /// [`PipelineError`] only for run-level problems (package missing,
    /// nothing matching the request, prefetch failure); per-version
    /// failures are reported through the returned [`RunReport`].
    pub async fn run(&self, name: &str, requested: &str) -> Result<RunReport, PipelineError> {
        let packument = self.registry.packument(name).await?;
        let versions = resolve_requested_versions(&packument, requested);
        if versions.is_empty() {
            return Err(PipelineError::NoMatchingVersions {
                name: name.to_string(),
                requested: requested.to_string(),
            });
        }
        info!(package = %name, %requested, count = versions.len(), "selected versions");

        let keys = versions
            .iter()
            .map(|version| PackageKey::new(name, version))
            .collect::<Result<Vec<_>, _>>()?;

        // Histories are prefetched concurrently; the pipeline itself stays
        // strictly sequential.
        let histories = try_join_all(keys.iter().map(|key| self.store.get(key))).await?;

        let mut outcomes = Vec::with_capacity(versions.len());
        for ((version, key), history) in versions.iter().zip(&keys).zip(histories) {
            let spec = PackageSpec {
                name: name.to_string(),
                requested: requested.to_string(),
                version: version.clone(),
            };
            outcomes.push(self.process_version(&packument, &spec, key, history).await);
        }

        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Skipped { .. }))
            .count();
        let report = RunReport {
            package: name.to_string(),
            outcomes,
        };
        info!(
            package = %name,
            completed = report.outcomes.len() - skipped - report.failures(),
            skipped,
            failed = report.failures(),
            "run finished"
        );
        Ok(report)
    }

    /// One version, with every stage error caught at this boundary.
    async fn process_version(
        &self,
        packument: &Packument,
        spec: &PackageSpec,
        key: &PackageKey,
        mut history: ResultHistory,
    ) -> VersionOutcome {
        match self.attempt(packument, spec, key, &mut history).await {
            Ok(status) => VersionOutcome {
                version: spec.version.clone(),
                status,
            },
            Err(failure) => {
                error!(
                    package = %spec.name,
                    version = %spec.version,
                    stage = %failure.stage,
                    "{}",
                    failure.message
                );
                VersionOutcome {
                    version: spec.version.clone(),
                    status: OutcomeStatus::Failed {
                        stage: failure.stage,
                        message: failure.message,
                    },
                }
            },
        }
    }

    async fn attempt(
        &self,
        packument: &Packument,
        spec: &PackageSpec,
        key: &PackageKey,
        history: &mut ResultHistory,
    ) -> Result<OutcomeStatus, StageFailure> {
        let record = PublishRecord::from_packument(packument, &spec.version)
            .map_err(|e| StageFailure::new(Stage::ResolveSource, e))?;
        let attested = self
            .registry
            .has_attestations(&spec.name, &spec.version)
            .await;

        let resolver = GitRefResolver::new(self.runner, self.config.probe_timeout);
        let descriptor = match resolver.resolve(&record).await {
            Ok(descriptor) => descriptor,
            Err(e) if e.is_not_attempted() => {
                info!(
                    package = %spec.name,
                    version = %spec.version,
                    "no source tracking available: {e}"
                );
                let entry = self.entry(&record, None, STRATEGY_NONE.to_string(), false, attested, None, None);
                self.persist(key, history, entry).await?;
                return Ok(OutcomeStatus::Skipped {
                    reason: e.to_string(),
                });
            },
            Err(e) => return Err(StageFailure::new(Stage::ResolveSource, e)),
        };

        // Never fatal: degrades to the ambient toolchain on any failure.
        let toolchain = ToolchainMatcher::new(self.runner)
            .provision(record.node_version.as_deref())
            .await;

        std::fs::create_dir_all(&self.config.work_root)
            .map_err(|e| StageFailure::new(Stage::FetchSource, e))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!(
                "rebuilt-{}-{}-",
                spec.name.replace(['/', '@'], "-"),
                spec.version
            ))
            .tempdir_in(&self.config.work_root)
            .map_err(|e| StageFailure::new(Stage::FetchSource, e))?;

        let src_dir = scratch.path().join("src");
        let fetcher = SourceFetcher::new(
            self.runner,
            self.config.probe_timeout,
            self.config.fetch_timeout,
        );
        let fetched = fetcher
            .fetch(&descriptor, packument, &src_dir)
            .await
            .map_err(|e| StageFailure::new(Stage::FetchSource, e))?;
        // Persisted provenance names the repository actually cloned.
        let descriptor = match &fetched.fallback_url {
            Some(url) => descriptor.with_clone_url(url),
            None => descriptor,
        };

        let project_dir = match &descriptor.subdir {
            Some(subdir) => src_dir.join(subdir),
            None => src_dir,
        };

        let builder = ConstrainedBuilder::new(
            self.runner,
            self.config.install_timeout,
            self.config.max_dependency_removals,
        );
        let artifacts = builder
            .build(&project_dir, &record, &toolchain)
            .await
            .map_err(|e| StageFailure::new(Stage::Build, e))?;

        let strategy = format!(
            "npm:{}+{}",
            artifacts.npm_version,
            toolchain.strategy_fragment()
        );
        let mut reproduced = record.integrity.as_deref() == Some(artifacts.integrity.as_str());

        if let Err(e) = self.write_dep_queue(spec, &artifacts.production_deps) {
            warn!(
                package = %spec.name,
                version = %spec.version,
                error = %e,
                "failed to write dependency-queue handoff"
            );
        }

        let comparison = match self.compare(&record, &artifacts, scratch.path()).await {
            Ok((published_integrity, result)) => {
                if record.integrity.is_none() {
                    // Old versions lack a registry integrity field; the
                    // verdict falls back to the downloaded tarball digest.
                    reproduced = published_integrity == artifacts.integrity;
                }
                result
            },
            Err(failure) => {
                // The raw verdict is still worth keeping; the version is
                // reported failed so automation retries the comparison.
                let entry = self.entry(
                    &record,
                    Some(descriptor),
                    strategy,
                    reproduced,
                    attested,
                    None,
                    Some(artifacts.production_deps),
                );
                self.persist(key, history, entry).await?;
                return Err(failure);
            },
        };

        let score = comparison.summary.score;
        info!(
            package = %spec.name,
            version = %spec.version,
            reproduced,
            score,
            tier = %ScoreTier::from_score(score),
            "version processed"
        );

        let entry = self.entry(
            &record,
            Some(descriptor),
            strategy,
            reproduced,
            attested,
            Some(comparison.filter_non_matching()),
            Some(artifacts.production_deps),
        );
        self.persist(key, history, entry).await?;

        Ok(OutcomeStatus::Completed { reproduced, score })
    }

    /// Download the published artifact and compare it against the rebuild.
    /// Returns the published tarball's integrity digest alongside the
    /// comparison.
    async fn compare(
        &self,
        record: &PublishRecord,
        artifacts: &BuildArtifacts,
        scratch: &Path,
    ) -> Result<(String, ComparisonResult), StageFailure> {
        let published = scratch.join("published.tgz");
        self.registry
            .download_tarball(&record.tarball_url, &published)
            .await
            .map_err(|e| StageFailure::new(Stage::Compare, e))?;

        let published_integrity = digest::sha512_integrity(&published)
            .map_err(|e| StageFailure::new(Stage::Compare, e))?;

        let result =
            compare::compare_artifacts(&published, &artifacts.tarball, &scratch.join("compare"))
                .map_err(|e| StageFailure::new(Stage::Compare, e))?;

        Ok((published_integrity, result))
    }

    async fn persist(
        &self,
        key: &PackageKey,
        history: &mut ResultHistory,
        entry: EnhancedResult,
    ) -> Result<(), StageFailure> {
        history.merge(entry);
        self.store
            .put(key, history)
            .await
            .map_err(|e| StageFailure::new(Stage::Persist, e))
    }

    /// One JSON handoff file per version, for the downstream scheduling
    /// collaborator to enqueue further reproduction work.
    fn write_dep_queue(&self, spec: &PackageSpec, deps: &[String]) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config.deps_dir)?;
        let path = self.config.deps_dir.join(format!(
            "{}@{}.json",
            spec.name.replace('/', "__"),
            spec.version
        ));
        let body = serde_json::json!({
            "package": spec.name,
            "version": spec.version,
            "dependencies": deps,
        });
        let mut bytes = serde_json::to_vec_pretty(&body).expect("json value serializes");
        bytes.push(b'\n');
        std::fs::write(path, bytes)
    }

    #[allow(clippy::too_many_arguments)]
    fn entry(
        &self,
        record: &PublishRecord,
        source: Option<SourceDescriptor>,
        strategy: String,
        reproduced: bool,
        attested: bool,
        comparison: Option<ComparisonResult>,
        production_dependencies: Option<Vec<String>>,
    ) -> EnhancedResult {
        EnhancedResult {
            reproduction: ReproductionResult {
                tool_version: crate::TOOL_VERSION.to_string(),
                checked_at: Utc::now(),
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
                strategy,
                reproduced,
                attested,
                package: PackageDisplay::from(record),
                source,
            },
            comparison,
            comparator: compare::comparator_fingerprint(),
            production_dependencies,
        }
    }
}

/// Expand a version request against the packument. Exact versions and
/// dist-tags select one version; `*`/`all` selects every published version
/// oldest first; `N.x` / `N.M.x` prefixes select the matching versions
/// oldest first. Full range algebra stays with npm itself.
#[must_use]
pub fn resolve_requested_versions(packument: &Packument, requested: &str) -> Vec<String> {
    let requested = requested.trim();

    if requested == "*" || requested.eq_ignore_ascii_case("all") {
        return packument.versions_oldest_first();
    }
    if packument.versions.contains_key(requested) {
        return vec![requested.to_string()];
    }
    if let Some(tagged) = packument.dist_tags.get(requested) {
        if packument.versions.contains_key(tagged) {
            return vec![tagged.clone()];
        }
    }

    if let Some(prefix) = requested
        .strip_suffix(".x")
        .or_else(|| requested.strip_suffix(".*"))
    {
        let numeric = !prefix.is_empty()
            && prefix
                .split('.')
                .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
        if numeric {
            let needle = format!("{prefix}.");
            return packument
                .versions_oldest_first()
                .into_iter()
                .filter(|version| version.starts_with(&needle))
                .collect();
        }
    }

    Vec::new()
}
