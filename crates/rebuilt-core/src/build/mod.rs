//! Constrained rebuild: install dependencies as they existed at publish
//! time, then pack the tree into a distributable artifact.
//!
//! The single most important correctness property lives here: dependency
//! resolution is bounded to the target package's publish timestamp via
//! `npm install --before`. Without that bound a rebuild silently picks up
//! newer transitive dependencies and the comparison is meaningless, so an
//! npm too old to support `--before`, or a publish record with no
//! timestamp, fails the build outright rather than degrading.
//!
//! Two registry realities are papered over before installing:
//! `workspace:` protocol specifiers (meaningless outside the monorepo they
//! came from) are rewritten to wildcards, and dependencies whose pinned
//! version has been unpublished after the fact are removed one at a time
//! under a bounded retry loop.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::digest;
use crate::nodever::parse_version;
use crate::process::{CommandOutput, CommandRequest, CommandRunner, ProcessError};
use crate::registry::PublishRecord;
use crate::toolchain::Toolchain;

/// First npm release with `--before` support.
const NPM_BEFORE_FLOOR: (u64, u64, u64) = (6, 9, 0);

/// Errors from the constrained build. All fatal for the affected version.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The available npm cannot do time-bounded resolution. Proceeding
    /// unconstrained would produce a meaningless comparison.
    #[error("npm {npm_version} lacks --before support (needs >= 6.9.0)")]
    BeforeUnsupported {
        /// The npm version found.
        npm_version: String,
    },

    /// The registry recorded no publish timestamp, so there is nothing to
    /// bound resolution to.
    #[error("{name}@{version} has no publish timestamp; time-bounded install is impossible")]
    MissingPublishTimestamp {
        /// Package name.
        name: String,
        /// Package version.
        version: String,
    },

    /// `npm --version` produced nothing parseable.
    #[error("could not determine npm version: {detail}")]
    NpmVersionUnknown {
        /// Scraped output or failure detail.
        detail: String,
    },

    /// Reading or rewriting a manifest failed.
    #[error("failed to edit {path}: {detail}")]
    ManifestEdit {
        /// The manifest path.
        path: String,
        /// What went wrong.
        detail: String,
    },

    /// Installation failed after exhausting recovery.
    #[error("npm install failed after {attempts} attempt(s): {detail}")]
    InstallFailed {
        /// Number of install attempts made.
        attempts: u32,
        /// Tail of the first failure's output.
        detail: String,
    },

    /// `npm pack` failed or produced no recognizable artifact name.
    #[error("npm pack failed: {detail}")]
    PackFailed {
        /// Failure detail.
        detail: String,
    },

    /// The packed artifact is missing from disk.
    #[error("packed artifact not found at {path}")]
    MissingArtifact {
        /// Expected artifact path.
        path: String,
    },

    /// Hashing the packed artifact failed.
    #[error("failed to digest {path}: {source}")]
    Digest {
        /// Artifact path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Subprocess-level failure.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Products of a successful constrained build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifacts {
    /// Path of the packed tarball.
    pub tarball: PathBuf,
    /// `sha512-…` integrity digest of the tarball.
    pub integrity: String,
    /// npm version that performed the build (strategy provenance).
    pub npm_version: String,
    /// Transitive production dependencies from the resolved lockfile,
    /// `name@version`, sorted. Empty when no lockfile could be read.
    pub production_deps: Vec<String>,
}

/// Rebuilds a fetched source tree under publish-time constraints.
pub struct ConstrainedBuilder<'a> {
    runner: &'a dyn CommandRunner,
    install_timeout: Duration,
    max_dependency_removals: u32,
}

impl<'a> ConstrainedBuilder<'a> {
    /// Create a builder. `max_dependency_removals` bounds the unpublished-
    /// dependency retry loop.
    #[must_use]
    pub fn new(
        runner: &'a dyn CommandRunner,
        install_timeout: Duration,
        max_dependency_removals: u32,
    ) -> Self {
        Self {
            runner,
            install_timeout,
            max_dependency_removals,
        }
    }

    /// Install and pack `project_dir` (already rooted at the monorepo
    /// subdirectory when there is one) as of `record`'s publish time.
    ///
    /// # Errors
    ///
    /// See [`BuildError`]; every variant is fatal for this version.
    pub async fn build(
        &self,
        project_dir: &Path,
        record: &PublishRecord,
        toolchain: &Toolchain,
    ) -> Result<BuildArtifacts, BuildError> {
        let published_at =
            record
                .published_at
                .ok_or_else(|| BuildError::MissingPublishTimestamp {
                    name: record.name.clone(),
                    version: record.version.clone(),
                })?;

        let npm_version = self.npm_version(project_dir, toolchain).await?;
        let parsed = parse_version(&npm_version).ok_or_else(|| BuildError::NpmVersionUnknown {
            detail: npm_version.clone(),
        })?;
        if !parsed.at_least(NPM_BEFORE_FLOOR.0, NPM_BEFORE_FLOOR.1, NPM_BEFORE_FLOOR.2) {
            return Err(BuildError::BeforeUnsupported { npm_version });
        }

        let manifest_path = project_dir.join("package.json");
        let rewritten = rewrite_workspace_specifiers(&manifest_path)?;
        if rewritten > 0 {
            info!(count = rewritten, "rewrote workspace-protocol specifiers to wildcards");
        }

        self.install(project_dir, toolchain, &published_at.to_rfc3339(), &manifest_path)
            .await?;

        let tarball = self.pack(project_dir, toolchain).await?;
        let integrity =
            digest::sha512_integrity(&tarball).map_err(|source| BuildError::Digest {
                path: tarball.display().to_string(),
                source,
            })?;

        let production_deps = collect_production_deps(project_dir);

        Ok(BuildArtifacts {
            tarball,
            integrity,
            npm_version,
            production_deps,
        })
    }

    async fn npm_version(
        &self,
        project_dir: &Path,
        toolchain: &Toolchain,
    ) -> Result<String, BuildError> {
        let out = self
            .npm(project_dir, toolchain, &["--version"], Duration::from_secs(60))
            .await?;
        if !out.success() {
            return Err(BuildError::NpmVersionUnknown {
                detail: out.combined().trim().to_string(),
            });
        }
        let version = out.stdout.trim().to_string();
        if version.is_empty() {
            return Err(BuildError::NpmVersionUnknown {
                detail: "empty npm --version output".to_string(),
            });
        }
        Ok(version)
    }

    /// Time-bounded install with the unpublished-dependency retry loop.
    async fn install(
        &self,
        project_dir: &Path,
        toolchain: &Toolchain,
        before: &str,
        manifest_path: &Path,
    ) -> Result<(), BuildError> {
        let args = [
            "install",
            "--before",
            before,
            "--ignore-scripts",
            "--no-audit",
            "--no-fund",
        ];

        let mut attempts = 0u32;
        let mut first_failure: Option<String> = None;

        loop {
            attempts += 1;
            let out = self
                .npm(project_dir, toolchain, &args, self.install_timeout)
                .await?;
            if out.success() {
                return Ok(());
            }

            let output = out.combined();
            if first_failure.is_none() {
                first_failure = Some(output.clone());
            }

            let removals = attempts - 1;
            let culprit = parse_unpublished_dependency(&output);
            match culprit {
                Some(dep) if removals < self.max_dependency_removals => {
                    warn!(
                        dependency = %dep,
                        attempt = attempts,
                        "install failed on an unavailable dependency version; removing it and retrying"
                    );
                    if !remove_dependency(manifest_path, &dep)? {
                        // The named dependency is not declared here; the
                        // failure is transitive and removal cannot help.
                        return Err(install_failed(attempts, first_failure));
                    }
                },
                _ => return Err(install_failed(attempts, first_failure)),
            }
        }
    }

    async fn pack(
        &self,
        project_dir: &Path,
        toolchain: &Toolchain,
    ) -> Result<PathBuf, BuildError> {
        let out = self
            .npm(
                project_dir,
                toolchain,
                &["pack", "--ignore-scripts"],
                self.install_timeout,
            )
            .await?;
        if !out.success() {
            return Err(BuildError::PackFailed {
                detail: tail(&out.combined(), 2000),
            });
        }

        let filename = parse_pack_filename(&out.stdout).ok_or_else(|| BuildError::PackFailed {
            detail: format!("no artifact filename in pack output: {:?}", tail(&out.stdout, 400)),
        })?;

        let tarball = project_dir.join(&filename);
        if !tarball.is_file() {
            return Err(BuildError::MissingArtifact {
                path: tarball.display().to_string(),
            });
        }
        debug!(artifact = %filename, "packed rebuild artifact");
        Ok(tarball)
    }

    async fn npm(
        &self,
        project_dir: &Path,
        toolchain: &Toolchain,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, ProcessError> {
        let (program, mut full_args) = toolchain.npm_invocation();
        full_args.extend(args.iter().map(|s| (*s).to_string()));
        let req = CommandRequest::new(program)
            .args(full_args)
            .cwd(project_dir)
            .timeout(timeout);
        self.runner.run(&req).await
    }
}

fn install_failed(attempts: u32, first_failure: Option<String>) -> BuildError {
    BuildError::InstallFailed {
        attempts,
        detail: tail(&first_failure.unwrap_or_default(), 2000),
    }
}

/// Last `max` bytes of `text`, on a char boundary.
fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// Rewrite `workspace:` protocol specifiers to `*` across all dependency
/// blocks of `package.json`. Returns how many were rewritten.
///
/// # Errors
///
/// [`BuildError::ManifestEdit`] on read/parse/write failure.
pub fn rewrite_workspace_specifiers(manifest_path: &Path) -> Result<u32, BuildError> {
    edit_manifest(manifest_path, |manifest| {
        let mut rewritten = 0;
        for block in DEPENDENCY_BLOCKS {
            if let Some(deps) = manifest.get_mut(*block).and_then(Value::as_object_mut) {
                for (_, spec) in deps.iter_mut() {
                    if spec.as_str().is_some_and(|s| s.starts_with("workspace:")) {
                        *spec = Value::String("*".to_string());
                        rewritten += 1;
                    }
                }
            }
        }
        rewritten
    })
}

/// Remove `name` from every dependency block of `package.json`. Returns
/// whether anything was removed.
///
/// # Errors
///
/// [`BuildError::ManifestEdit`] on read/parse/write failure.
pub fn remove_dependency(manifest_path: &Path, name: &str) -> Result<bool, BuildError> {
    edit_manifest(manifest_path, |manifest| {
        let mut removed = false;
        for block in DEPENDENCY_BLOCKS {
            if let Some(deps) = manifest.get_mut(*block).and_then(Value::as_object_mut) {
                removed |= deps.remove(name).is_some();
            }
        }
        removed
    })
}

const DEPENDENCY_BLOCKS: &[&str] = &[
    "dependencies",
    "devDependencies",
    "optionalDependencies",
    "peerDependencies",
];

fn edit_manifest<T>(
    manifest_path: &Path,
    edit: impl FnOnce(&mut Value) -> T,
) -> Result<T, BuildError> {
    let manifest_edit = |detail: String| BuildError::ManifestEdit {
        path: manifest_path.display().to_string(),
        detail,
    };

    let raw = std::fs::read_to_string(manifest_path).map_err(|e| manifest_edit(e.to_string()))?;
    let mut manifest: Value =
        serde_json::from_str(&raw).map_err(|e| manifest_edit(e.to_string()))?;

    let result = edit(&mut manifest);

    let pretty =
        serde_json::to_string_pretty(&manifest).map_err(|e| manifest_edit(e.to_string()))?;
    std::fs::write(manifest_path, pretty + "\n").map_err(|e| manifest_edit(e.to_string()))?;
    Ok(result)
}

/// Extract the packed artifact filename: the last non-empty stdout line
/// (npm prints progress to stderr, the filename last on stdout).
#[must_use]
pub fn parse_pack_filename(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .filter(|line| line.ends_with(".tgz") && !line.contains(char::is_whitespace))
        .map(str::to_string)
}

/// Best-effort extraction of the dependency name behind an "unavailable
/// version" install failure. Matches npm's ETARGET and E404 phrasings;
/// anything else reads as "not recoverable". The exact message wording is
/// an npm implementation detail, so this is a heuristic by design.
#[must_use]
pub fn parse_unpublished_dependency(output: &str) -> Option<String> {
    // ETARGET: "notarget No matching version found for foo@^1.2.3."
    let etarget = Regex::new(r"No matching version found for\s+(@?[^@\s']+)@")
        .expect("static regex");
    if let Some(caps) = etarget.captures(output) {
        return Some(caps[1].to_string());
    }

    // E404: "404  'foo@^1.2.3' is not in this registry."
    let e404 = Regex::new(r"'(@?[^@\s']+)@[^']*'\s+is not in (?:this|the npm) registry")
        .expect("static regex");
    e404.captures(output).map(|caps| caps[1].to_string())
}

/// Transitive production dependencies from the resolved lockfile,
/// `name@version`, sorted and deduplicated. Best-effort: any read or shape
/// problem yields an empty set.
#[must_use]
pub fn collect_production_deps(project_dir: &Path) -> Vec<String> {
    let lockfile = ["package-lock.json", "npm-shrinkwrap.json"]
        .iter()
        .map(|name| project_dir.join(name))
        .find(|path| path.is_file());

    let Some(lockfile) = lockfile else {
        warn!(dir = %project_dir.display(), "no lockfile after install; skipping dependency capture");
        return Vec::new();
    };

    let parsed: Option<Value> = std::fs::read_to_string(&lockfile)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok());
    let Some(lock) = parsed else {
        warn!(path = %lockfile.display(), "unreadable lockfile; skipping dependency capture");
        return Vec::new();
    };

    let mut deps = BTreeSet::new();

    // Lockfile v2/v3: flat "packages" map keyed by node_modules path.
    if let Some(packages) = lock.get("packages").and_then(Value::as_object) {
        for (path, entry) in packages {
            if path.is_empty() {
                continue; // the root project itself
            }
            let dev = entry.get("dev").and_then(Value::as_bool).unwrap_or(false);
            if dev {
                continue;
            }
            let Some(name) = path.rsplit("node_modules/").next().filter(|n| !n.is_empty())
            else {
                continue;
            };
            if let Some(version) = entry.get("version").and_then(Value::as_str) {
                deps.insert(format!("{name}@{version}"));
            }
        }
    } else if let Some(dependencies) = lock.get("dependencies").and_then(Value::as_object) {
        // Lockfile v1: nested tree.
        collect_v1_deps(dependencies, &mut deps);
    }

    deps.into_iter().collect()
}

fn collect_v1_deps(dependencies: &serde_json::Map<String, Value>, deps: &mut BTreeSet<String>) {
    for (name, entry) in dependencies {
        let dev = entry.get("dev").and_then(Value::as_bool).unwrap_or(false);
        if !dev {
            if let Some(version) = entry.get("version").and_then(Value::as_str) {
                deps.insert(format!("{name}@{version}"));
            }
        }
        if let Some(nested) = entry.get("dependencies").and_then(Value::as_object) {
            collect_v1_deps(nested, deps);
        }
    }
}
