//! Source-location normalization and git ref selection.
//!
//! Registry manifests report repository locations in every shape that has
//! ever worked in a `package.json`: `git+` prefixes, `git://` and SSH
//! schemes, `github:owner/repo` shorthand, web URLs pointing into a
//! monorepo subtree. This module normalizes them to one canonical HTTPS
//! clone URL, gates on the supported forge, and picks the git ref to check
//! out via a fixed priority ladder:
//!
//! 1. the exact commit recorded at publish time,
//! 2. a tag matching the version string,
//! 3. a tag matching `v<version>`,
//! 4. the default branch `HEAD`, recorded as unpinned evidence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::process::{CommandRequest, CommandRunner};
use crate::registry::PublishRecord;

/// The only source forge this pipeline reproduces from.
pub const SUPPORTED_HOST: &str = "github.com";

/// Ref used when no pinned commit or tag could be resolved: whatever the
/// default branch points at when we clone.
pub const UNPINNED_REF: &str = "HEAD";

/// Errors from source-location resolution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GitRefError {
    /// The manifest declares no repository at all. Reproduction is not
    /// attempted; this is not a failure.
    #[error("{name}@{version} declares no repository")]
    NoRepository {
        /// Package name.
        name: String,
        /// Package version.
        version: String,
    },

    /// The repository is hosted somewhere this pipeline does not support.
    /// Reproduction is not attempted; this is not a failure.
    #[error("unsupported source host {host} in {url}")]
    UnsupportedSourceHost {
        /// The offending host.
        host: String,
        /// The normalized URL.
        url: String,
    },

    /// The declared repository URL could not be parsed at all.
    #[error("unparseable repository URL: {url}")]
    InvalidUrl {
        /// The URL as declared.
        url: String,
    },
}

impl GitRefError {
    /// Whether this error means "skip quietly" rather than "fail".
    #[must_use]
    pub fn is_not_attempted(&self) -> bool {
        matches!(
            self,
            Self::NoRepository { .. } | Self::UnsupportedSourceHost { .. }
        )
    }
}

/// Which rung of the ref ladder produced the descriptor's ref.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefSource {
    /// Exact commit recorded by the publishing client.
    PublishCommit,
    /// Tag named exactly like the version.
    VersionTag,
    /// Tag named `v<version>`.
    VPrefixedTag,
    /// Default branch `HEAD`; unpinned, weaker evidence.
    DefaultBranch,
}

/// A resolved source location: canonical clone URL, ref, and optional
/// monorepo subdirectory. The ref is never empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Canonical machine-readable spec, e.g.
    /// `github:owner/repo#v1.2.3::path:packages/foo`.
    pub spec: String,
    /// HTTPS clone URL.
    pub clone_url: String,
    /// Ref to check out (commit, tag, or [`UNPINNED_REF`]).
    pub git_ref: String,
    /// Subdirectory holding the package inside a monorepo.
    pub subdir: Option<String>,
    /// Which ladder rung selected the ref.
    pub ref_source: RefSource,
}

impl SourceDescriptor {
    /// Whether the ref pins an exact repository state.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.ref_source != RefSource::DefaultBranch
    }

    /// The same descriptor re-pointed at an alternate clone URL (used when
    /// the fetcher succeeded through the fallback search), so persisted
    /// provenance names the repository actually cloned.
    #[must_use]
    pub fn with_clone_url(&self, clone_url: &str) -> Self {
        let spec = match parse_repo_url(clone_url) {
            Ok(parsed) => {
                let mut spec =
                    format!("github:{}/{}#{}", parsed.owner, parsed.repo, self.git_ref);
                if let Some(dir) = &self.subdir {
                    spec.push_str("::path:");
                    spec.push_str(dir);
                }
                spec
            },
            Err(_) => self.spec.clone(),
        };
        Self {
            spec,
            clone_url: clone_url.to_string(),
            git_ref: self.git_ref.clone(),
            subdir: self.subdir.clone(),
            ref_source: self.ref_source,
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}

/// A repository URL decomposed into its forge coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRepo {
    /// Host, lowercased.
    pub host: String,
    /// Repository owner.
    pub owner: String,
    /// Repository name, `.git` suffix stripped.
    pub repo: String,
    /// Subdirectory inferred from a `tree`/`blob` web URL.
    pub subdir: Option<String>,
}

impl ParsedRepo {
    /// Canonical HTTPS clone URL.
    #[must_use]
    pub fn clone_url(&self) -> String {
        format!("https://{}/{}/{}.git", self.host, self.owner, self.repo)
    }
}

/// Expand registry shorthand (`github:o/r`, bare `o/r`) to a full URL.
/// Other forge shorthands expand to their real hosts so the host gate
/// rejects them with an accurate message.
#[must_use]
fn expand_shorthand(input: &str) -> String {
    let trimmed = input.trim();
    for (prefix, host) in [
        ("github:", "github.com"),
        ("gitlab:", "gitlab.com"),
        ("bitbucket:", "bitbucket.org"),
        ("gist:", "gist.github.com"),
    ] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return format!("https://{host}/{rest}");
        }
    }

    // Bare "owner/repo" is GitHub shorthand when the first segment cannot
    // be a hostname.
    let looks_bare = trimmed.split('/').count() == 2
        && !trimmed.contains(':')
        && !trimmed.contains('@')
        && !trimmed.split('/').next().is_some_and(|owner| owner.contains('.'));
    if looks_bare {
        return format!("https://{SUPPORTED_HOST}/{trimmed}");
    }

    trimmed.to_string()
}

/// Normalize a git URL to HTTPS form.
///
/// Strips a `git+` prefix, rewrites `git://` to `https://`, rewrites both
/// SSH forms (`ssh://git@host/path`, `git@host:path`) to `https://host/path`,
/// and drops any trailing slash. Idempotent and host-preserving.
#[must_use]
pub fn normalize_git_url(input: &str) -> String {
    let mut url = input.trim().to_string();

    if let Some(rest) = url.strip_prefix("git+") {
        url = rest.to_string();
    }
    if let Some(rest) = url.strip_prefix("git://") {
        url = format!("https://{rest}");
    }
    if let Some(rest) = url.strip_prefix("ssh://git@") {
        url = format!("https://{rest}");
    } else if let Some(rest) = url.strip_prefix("git@") {
        // scp-like syntax: git@host:owner/repo.git
        if let Some((host, path)) = rest.split_once(':') {
            url = format!("https://{host}/{path}");
        }
    }

    url.trim_end_matches('/').to_string()
}

/// Decompose a normalized HTTPS URL into forge coordinates, unwrapping
/// `tree`/`blob` web URLs into a repository plus subdirectory.
///
/// # Errors
///
/// Returns [`GitRefError::InvalidUrl`] when the URL has no scheme or fewer
/// than two path segments.
pub fn parse_repo_url(url: &str) -> Result<ParsedRepo, GitRefError> {
    let invalid = || GitRefError::InvalidUrl {
        url: url.to_string(),
    };

    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(invalid)?;

    let mut segments = rest.split('/');
    let host = segments.next().ok_or_else(invalid)?;
    let host = host
        .strip_prefix("www.")
        .unwrap_or(host)
        .to_ascii_lowercase();
    if host.is_empty() {
        return Err(invalid());
    }

    let owner = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let repo = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let repo = repo.trim_end_matches(".git");

    // Web URLs into a subtree: /owner/repo/tree/<ref>/<subdir...>
    let extra: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
    let subdir = match extra.split_first() {
        Some((&"tree" | &"blob" | &"raw", rest)) if rest.len() > 1 => {
            Some(rest[1..].join("/"))
        },
        _ => None,
    };

    Ok(ParsedRepo {
        host,
        owner: owner.to_string(),
        repo: repo.to_string(),
        subdir,
    })
}

/// Resolves a publish record's repository descriptor into a
/// [`SourceDescriptor`], probing the remote for tags when no publish-time
/// commit is recorded.
pub struct GitRefResolver<'a> {
    runner: &'a dyn CommandRunner,
    probe_timeout: Duration,
}

impl<'a> GitRefResolver<'a> {
    /// Create a resolver that probes through `runner`.
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, probe_timeout: Duration) -> Self {
        Self {
            runner,
            probe_timeout,
        }
    }

    /// Resolve the source location for one published version.
    ///
    /// # Errors
    ///
    /// [`GitRefError::NoRepository`] / [`GitRefError::UnsupportedSourceHost`]
    /// when reproduction should not be attempted, [`GitRefError::InvalidUrl`]
    /// for garbage URLs.
    pub async fn resolve(&self, record: &PublishRecord) -> Result<SourceDescriptor, GitRefError> {
        let repository = record
            .repository
            .as_ref()
            .and_then(|r| r.url())
            .ok_or_else(|| GitRefError::NoRepository {
                name: record.name.clone(),
                version: record.version.clone(),
            })?;

        let normalized = normalize_git_url(&expand_shorthand(repository));
        let parsed = parse_repo_url(&normalized)?;
        if parsed.host != SUPPORTED_HOST {
            return Err(GitRefError::UnsupportedSourceHost {
                host: parsed.host,
                url: normalized,
            });
        }

        // An explicitly declared subdirectory beats one inferred from a
        // tree/blob URL.
        let subdir = record
            .repository
            .as_ref()
            .and_then(|r| r.directory())
            .map(str::to_string)
            .or(parsed.subdir.clone());

        let clone_url = parsed.clone_url();
        let (git_ref, ref_source) = self.select_ref(record, &clone_url).await;

        if ref_source == RefSource::DefaultBranch {
            warn!(
                package = %record.name,
                version = %record.version,
                %clone_url,
                "no pinned commit or matching tag; falling back to default branch HEAD"
            );
        }

        let mut spec = format!("github:{}/{}#{git_ref}", parsed.owner, parsed.repo);
        if let Some(dir) = &subdir {
            spec.push_str("::path:");
            spec.push_str(dir);
        }

        Ok(SourceDescriptor {
            spec,
            clone_url,
            git_ref,
            subdir,
            ref_source,
        })
    }

    async fn select_ref(&self, record: &PublishRecord, clone_url: &str) -> (String, RefSource) {
        if let Some(commit) = record.git_head.as_deref().filter(|c| !c.is_empty()) {
            return (commit.to_string(), RefSource::PublishCommit);
        }

        let plain = record.version.clone();
        let prefixed = format!("v{}", record.version);
        let req = CommandRequest::new("git")
            .args(vec![
                "ls-remote".to_string(),
                "--tags".to_string(),
                clone_url.to_string(),
                format!("refs/tags/{plain}"),
                format!("refs/tags/{prefixed}"),
            ])
            .timeout(self.probe_timeout);

        let tags = match self.runner.run(&req).await {
            Ok(out) if out.success() => parse_ls_remote_tags(&out.stdout),
            _ => Vec::new(),
        };

        if tags.iter().any(|t| t == &plain) {
            (plain, RefSource::VersionTag)
        } else if tags.iter().any(|t| t == &prefixed) {
            (prefixed, RefSource::VPrefixedTag)
        } else {
            (UNPINNED_REF.to_string(), RefSource::DefaultBranch)
        }
    }
}

/// Extract tag names from `git ls-remote --tags` output, dropping peeled
/// `^{}` entries.
#[must_use]
fn parse_ls_remote_tags(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|r| r.strip_prefix("refs/tags/"))
        .filter(|tag| !tag.ends_with("^{}"))
        .map(str::to_string)
        .collect()
}
