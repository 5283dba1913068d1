//! Source fetching: clone, ref fetch, checkout, and the alternate-URL
//! fallback search.
//!
//! Every step is a ladder of increasingly expensive attempts, short-
//! circuiting on the first success:
//!
//! - clone: `--depth 1` first, full clone second;
//! - ref fetch: shallow ref fetch, full ref fetch, un-shallowing;
//! - checkout: the literal ref, then `FETCH_HEAD`;
//! - repository: the declared URL, then every alternate repository URL
//!   found across the package's other published versions (newest first),
//!   each probed for reachability under a bounded timeout before cloning.
//!
//! Re-fetching into a directory that already holds a clone of the same
//! repository converges instead of erroring.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gitref::{self, SourceDescriptor, UNPINNED_REF};
use crate::process::{CommandOutput, CommandRequest, CommandRunner, ProcessError};
use crate::registry::Packument;

/// Errors from source fetching. All of them are fatal for the affected
/// version only.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// Cloning failed and no fallback candidate was reachable.
    #[error("no reachable repository for {name} (primary {url}, {probed} alternates probed)")]
    NoReachableRepository {
        /// Package name.
        name: String,
        /// The primary URL that failed.
        url: String,
        /// How many alternate candidates were probed.
        probed: usize,
    },

    /// The destination already holds a clone of a different repository.
    #[error("destination {dest} holds a clone of {found}, expected {expected}")]
    ForeignClone {
        /// Destination directory.
        dest: String,
        /// Origin URL found there.
        found: String,
        /// Origin URL expected.
        expected: String,
    },

    /// The resolved ref could not be checked out, even via `FETCH_HEAD`.
    #[error("failed to check out {git_ref}: {detail}")]
    Checkout {
        /// The ref that was requested.
        git_ref: String,
        /// git's stderr.
        detail: String,
    },

    /// Subprocess-level failure (git missing, killed, …).
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    /// Alternate repository URL used when the primary was unreachable.
    pub fallback_url: Option<String>,
}

/// Clones and checks out package sources through the command runner.
pub struct SourceFetcher<'a> {
    runner: &'a dyn CommandRunner,
    probe_timeout: Duration,
    fetch_timeout: Duration,
}

impl<'a> SourceFetcher<'a> {
    /// Create a fetcher. `probe_timeout` bounds reachability probes,
    /// `fetch_timeout` bounds clone/fetch operations.
    #[must_use]
    pub fn new(
        runner: &'a dyn CommandRunner,
        probe_timeout: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            probe_timeout,
            fetch_timeout,
        }
    }

    /// Fetch the descriptor's repository into `dest` and check out its ref.
    ///
    /// # Errors
    ///
    /// [`FetchError::NoReachableRepository`] when neither the primary URL
    /// nor any alternate candidate can be cloned;
    /// [`FetchError::Checkout`] when the ref cannot be materialized.
    pub async fn fetch(
        &self,
        descriptor: &SourceDescriptor,
        packument: &Packument,
        dest: &Path,
    ) -> Result<FetchedSource, FetchError> {
        let fallback_url = match self.clone_into(&descriptor.clone_url, dest).await? {
            true => None,
            false => {
                warn!(
                    url = %descriptor.clone_url,
                    "primary repository unreachable; searching alternates"
                );
                Some(self.clone_fallback(descriptor, packument, dest).await?)
            },
        };

        self.checkout_ref(dest, &descriptor.git_ref).await?;
        Ok(FetchedSource { fallback_url })
    }

    /// Clone `url` into `dest`, shallow first. Returns `Ok(false)` when the
    /// repository was unreachable (a fallback-search signal, not an error).
    async fn clone_into(&self, url: &str, dest: &Path) -> Result<bool, FetchError> {
        if dest.join(".git").is_dir() {
            // Converge on an existing clone of the same repository.
            let out = self
                .git_in(dest, &["remote", "get-url", "origin"])
                .await?;
            let found = out.stdout.trim().to_string();
            if out.success() && found == url {
                debug!(dest = %dest.display(), "reusing existing clone");
                return Ok(true);
            }
            return Err(FetchError::ForeignClone {
                dest: dest.display().to_string(),
                found,
                expected: url.to_string(),
            });
        }

        let dest_str = dest.display().to_string();
        let shallow = self
            .git(&["clone", "--depth", "1", url, &dest_str])
            .await?;
        if shallow.success() {
            return Ok(true);
        }

        debug!(%url, "shallow clone failed; retrying with full clone");
        let full = self.git(&["clone", url, &dest_str]).await?;
        Ok(full.success())
    }

    /// Scan other published versions (newest first) plus the packument's
    /// top-level repository for an alternate clone URL, probe each, and
    /// clone the first reachable one. Returns the URL used.
    async fn clone_fallback(
        &self,
        descriptor: &SourceDescriptor,
        packument: &Packument,
        dest: &Path,
    ) -> Result<String, FetchError> {
        let candidates = fallback_candidates(packument, &descriptor.clone_url);
        let mut probed = 0usize;

        for candidate in &candidates {
            probed += 1;
            if !self.is_reachable(candidate).await {
                debug!(url = %candidate, "fallback candidate unreachable");
                continue;
            }
            if self.clone_into(candidate, dest).await? {
                info!(url = %candidate, "cloned via fallback repository URL");
                return Ok(candidate.clone());
            }
        }

        Err(FetchError::NoReachableRepository {
            name: packument.name.clone(),
            url: descriptor.clone_url.clone(),
            probed,
        })
    }

    /// Lightweight remote ref listing under a bounded timeout. Expiry or
    /// any failure reads as unreachable.
    async fn is_reachable(&self, url: &str) -> bool {
        let req = CommandRequest::new("git")
            .args(["ls-remote", "--heads", url])
            .timeout(self.probe_timeout);
        matches!(self.runner.run(&req).await, Ok(out) if out.success())
    }

    /// Materialize and check out the ref. [`UNPINNED_REF`] means "whatever
    /// the clone's default branch already points at".
    async fn checkout_ref(&self, dest: &Path, git_ref: &str) -> Result<(), FetchError> {
        if git_ref == UNPINNED_REF {
            return Ok(());
        }

        // Fetch ladder; failures along the way only matter if the final
        // checkout cannot find the ref.
        let shallow = self
            .git_in(dest, &["fetch", "--depth", "1", "origin", git_ref])
            .await?;
        if !shallow.success() {
            let full = self.git_in(dest, &["fetch", "origin", git_ref]).await?;
            if !full.success() {
                let _ = self.git_in(dest, &["fetch", "--unshallow", "origin"]).await?;
            }
        }

        let direct = self
            .git_in(dest, &["checkout", "--force", git_ref])
            .await?;
        if direct.success() {
            return Ok(());
        }

        debug!(%git_ref, "direct checkout failed; trying FETCH_HEAD");
        let fetch_head = self
            .git_in(dest, &["checkout", "--force", "FETCH_HEAD"])
            .await?;
        if fetch_head.success() {
            return Ok(());
        }

        Err(FetchError::Checkout {
            git_ref: git_ref.to_string(),
            detail: format!("{}\n{}", direct.stderr.trim(), fetch_head.stderr.trim())
                .trim()
                .to_string(),
        })
    }

    async fn git(&self, args: &[&str]) -> Result<CommandOutput, ProcessError> {
        let req = CommandRequest::new("git")
            .args(args.iter().copied())
            .timeout(self.fetch_timeout);
        self.runner.run(&req).await
    }

    async fn git_in(&self, dir: &Path, args: &[&str]) -> Result<CommandOutput, ProcessError> {
        let req = CommandRequest::new("git")
            .args(args.iter().copied())
            .cwd(dir)
            .timeout(self.fetch_timeout);
        self.runner.run(&req).await
    }
}

/// Alternate clone URLs for a package, newest published version first, the
/// packument's current top-level repository last, excluding `failed_url`
/// and anything not on the supported forge.
#[must_use]
fn fallback_candidates(packument: &Packument, failed_url: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    let urls = packument
        .versions_newest_first()
        .into_iter()
        .filter_map(|v| {
            packument
                .versions
                .get(&v)
                .and_then(|m| m.repository.as_ref())
                .and_then(|r| r.url())
                .map(str::to_string)
        })
        .chain(
            packument
                .repository
                .as_ref()
                .and_then(|r| r.url())
                .map(str::to_string),
        );

    for url in urls {
        let normalized = gitref::normalize_git_url(&url);
        let Ok(parsed) = gitref::parse_repo_url(&normalized) else {
            continue;
        };
        if parsed.host != gitref::SUPPORTED_HOST {
            continue;
        }
        let clone_url = parsed.clone_url();
        if clone_url != failed_url && !candidates.contains(&clone_url) {
            candidates.push(clone_url);
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitref::RefSource;
    use crate::process::testing::FakeRunner;

    fn descriptor(git_ref: &str, ref_source: RefSource) -> SourceDescriptor {
        SourceDescriptor {
            spec: format!("github:org/repo#{git_ref}"),
            clone_url: "https://github.com/org/repo.git".to_string(),
            git_ref: git_ref.to_string(),
            subdir: None,
            ref_source,
        }
    }

    fn packument_with_alternate() -> Packument {
        serde_json::from_str(
            r#"{
                "name": "demo",
                "versions": {
                    "1.0.0": {
                        "name": "demo", "version": "1.0.0",
                        "repository": "git+https://github.com/org/repo.git",
                        "dist": { "tarball": "https://registry.npmjs.org/demo/-/demo-1.0.0.tgz" }
                    },
                    "2.0.0": {
                        "name": "demo", "version": "2.0.0",
                        "repository": "git+https://github.com/neworg/repo.git",
                        "dist": { "tarball": "https://registry.npmjs.org/demo/-/demo-2.0.0.tgz" }
                    }
                },
                "time": {
                    "1.0.0": "2020-01-01T00:00:00.000Z",
                    "2.0.0": "2021-01-01T00:00:00.000Z"
                },
                "repository": "git@gitlab.com:org/mirror.git"
            }"#,
        )
        .unwrap()
    }

    fn fetcher(runner: &FakeRunner) -> SourceFetcher<'_> {
        SourceFetcher::new(runner, Duration::from_secs(5), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn shallow_clone_then_ref_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("src");

        let runner = FakeRunner::new();
        runner.succeed_with("clone --depth 1", "");
        runner.succeed_with("fetch --depth 1 origin abc123", "");
        runner.succeed_with("checkout --force abc123", "");

        let desc = descriptor("abc123", RefSource::PublishCommit);
        let outcome = fetcher(&runner)
            .fetch(&desc, &packument_with_alternate(), &dest)
            .await
            .unwrap();

        assert_eq!(outcome.fallback_url, None);
        assert!(runner.saw("clone --depth 1 https://github.com/org/repo.git"));
    }

    #[tokio::test]
    async fn full_clone_is_the_shallow_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("src");

        let runner = FakeRunner::new();
        runner.fail_with("clone --depth 1", "fatal: dumb http transport does not support shallow");
        runner.succeed_with("clone https://github.com/org/repo.git", "");
        runner.succeed_with("fetch --depth 1 origin v1.0.0", "");
        runner.succeed_with("checkout --force v1.0.0", "");

        let desc = descriptor("v1.0.0", RefSource::VPrefixedTag);
        let outcome = fetcher(&runner)
            .fetch(&desc, &packument_with_alternate(), &dest)
            .await
            .unwrap();

        assert_eq!(outcome.fallback_url, None);
        assert!(runner.saw("clone https://github.com/org/repo.git"));
    }

    #[tokio::test]
    async fn unreachable_primary_falls_back_to_alternate_version_url() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("src");

        let runner = FakeRunner::new();
        // Primary clone fails both shallow and full.
        runner.fail_with("clone --depth 1 https://github.com/org/repo.git", "fatal: not found");
        runner.fail_with("clone https://github.com/org/repo.git", "fatal: not found");
        // The alternate from version 2.0.0 probes reachable and clones.
        runner.succeed_with("ls-remote --heads https://github.com/neworg/repo.git", "abc\trefs/heads/main");
        runner.succeed_with("clone --depth 1 https://github.com/neworg/repo.git", "");
        runner.succeed_with("fetch --depth 1 origin abc123", "");
        runner.succeed_with("checkout --force abc123", "");

        let desc = descriptor("abc123", RefSource::PublishCommit);
        let outcome = fetcher(&runner)
            .fetch(&desc, &packument_with_alternate(), &dest)
            .await
            .unwrap();

        assert_eq!(
            outcome.fallback_url.as_deref(),
            Some("https://github.com/neworg/repo.git")
        );
    }

    #[tokio::test]
    async fn no_reachable_candidate_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("src");

        let runner = FakeRunner::new();
        runner.fail_with("clone", "fatal: not found");
        runner.fail_with("ls-remote", "fatal: timeout");

        let desc = descriptor("abc123", RefSource::PublishCommit);
        let err = fetcher(&runner)
            .fetch(&desc, &packument_with_alternate(), &dest)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::NoReachableRepository { probed: 1, .. }
        ));
    }

    #[tokio::test]
    async fn checkout_falls_back_to_fetch_head() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("src");

        let runner = FakeRunner::new();
        runner.succeed_with("clone --depth 1", "");
        runner.fail_with("fetch --depth 1 origin", "error: unknown ref");
        runner.succeed_with("fetch origin", "");
        runner.fail_with("checkout --force deadbeef", "error: pathspec did not match");
        runner.succeed_with("checkout --force FETCH_HEAD", "");

        let desc = descriptor("deadbeef", RefSource::PublishCommit);
        fetcher(&runner)
            .fetch(&desc, &packument_with_alternate(), &dest)
            .await
            .unwrap();

        assert!(runner.saw("checkout --force FETCH_HEAD"));
    }

    #[tokio::test]
    async fn unpinned_ref_skips_fetch_and_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("src");

        let runner = FakeRunner::new();
        runner.succeed_with("clone --depth 1", "");

        let desc = descriptor(UNPINNED_REF, RefSource::DefaultBranch);
        fetcher(&runner)
            .fetch(&desc, &packument_with_alternate(), &dest)
            .await
            .unwrap();

        assert!(!runner.saw("checkout"));
        assert!(!runner.saw("fetch --depth 1 origin"));
    }

    #[tokio::test]
    async fn existing_clone_of_same_repo_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("src");
        std::fs::create_dir_all(dest.join(".git")).unwrap();

        let runner = FakeRunner::new();
        runner.succeed_with("remote get-url origin", "https://github.com/org/repo.git\n");
        runner.succeed_with("fetch --depth 1 origin abc123", "");
        runner.succeed_with("checkout --force abc123", "");

        let desc = descriptor("abc123", RefSource::PublishCommit);
        fetcher(&runner)
            .fetch(&desc, &packument_with_alternate(), &dest)
            .await
            .unwrap();

        assert!(!runner.saw("clone"));
    }

    #[test]
    fn fallback_candidates_order_and_filtering() {
        let packument = packument_with_alternate();
        let candidates =
            fallback_candidates(&packument, "https://github.com/org/repo.git");

        // Newest-first alternate, gitlab mirror filtered out, failed URL
        // excluded, no duplicates.
        assert_eq!(candidates, vec!["https://github.com/neworg/repo.git"]);
    }
}
