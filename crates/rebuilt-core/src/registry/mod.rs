//! Registry metadata collaborator boundary.
//!
//! The pipeline consumes registry facts through the [`Registry`] trait:
//! the full packument for a package (version list, publish times, per-version
//! manifests), published tarball bytes, and provenance-attestation presence.
//! [`HttpRegistry`] is the production implementation against the npm
//! registry; tests substitute a canned implementation.
//!
//! Two failure modes are deliberately distinct in the error type: a package
//! that does not exist ([`RegistryError::PackageNotFound`]) and transient
//! transport trouble — callers treat them very differently.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
pub(crate) mod testing;

/// Largest packument body this crate will buffer (some popular packages
/// carry multi-megabyte packuments; 50 MiB is far above any real one).
const MAX_PACKUMENT_BYTES: u64 = 50 * 1024 * 1024;

/// Errors from registry metadata access.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The package does not exist in the registry (HTTP 404). Distinct
    /// from transient failures: there is nothing to retry.
    #[error("package not found in registry: {name}")]
    PackageNotFound {
        /// The package name that was requested.
        name: String,
    },

    /// The packument exists but lacks the requested version.
    #[error("version {version} not found in packument for {name}")]
    VersionNotFound {
        /// Package name.
        name: String,
        /// The missing version.
        version: String,
    },

    /// Transport-level failure.
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Unexpected HTTP status.
    #[error("registry returned HTTP {status} for {url}")]
    Status {
        /// The status code.
        status: u16,
        /// The request URL.
        url: String,
    },

    /// Response body exceeded the size bound.
    #[error("packument for {name} exceeds {max} bytes")]
    TooLarge {
        /// Package name.
        name: String,
        /// The bound.
        max: u64,
    },

    /// Writing a downloaded artifact failed.
    #[error("failed to write downloaded artifact to {path}: {source}")]
    Write {
        /// Destination path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// `repository` manifest field: either a bare URL string or an object with
/// an optional monorepo `directory`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RepositoryField {
    /// Bare URL form: `"repository": "github:owner/repo"`.
    Url(String),
    /// Object form with optional subdirectory.
    Object {
        /// Repository URL.
        #[serde(default)]
        url: Option<String>,
        /// Declared monorepo subdirectory.
        #[serde(default)]
        directory: Option<String>,
        /// VCS kind; informational only.
        #[serde(default, rename = "type")]
        kind: Option<String>,
    },
}

impl RepositoryField {
    /// The repository URL, whichever form carried it.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url),
            Self::Object { url, .. } => url.as_deref(),
        }
    }

    /// The declared subdirectory, if the object form carries one.
    #[must_use]
    pub fn directory(&self) -> Option<&str> {
        match self {
            Self::Url(_) => None,
            Self::Object { directory, .. } => directory.as_deref(),
        }
    }
}

/// `dist` block of a version manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DistInfo {
    /// Published tarball URL.
    pub tarball: String,
    /// Subresource-integrity digest (`sha512-…`); absent on old versions.
    #[serde(default)]
    pub integrity: Option<String>,
    /// Legacy sha-1 hex digest.
    #[serde(default)]
    pub shasum: Option<String>,
}

/// One version's manifest as published.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionManifest {
    /// Package name.
    pub name: String,
    /// Exact version.
    pub version: String,
    /// Artifact location and digests.
    #[serde(default)]
    pub dist: DistInfo,
    /// Repository descriptor, if declared.
    #[serde(default)]
    pub repository: Option<RepositoryField>,
    /// Commit recorded by the publishing client.
    #[serde(default, rename = "gitHead")]
    pub git_head: Option<String>,
    /// Node.js version the publisher ran.
    #[serde(default, rename = "_nodeVersion")]
    pub node_version: Option<String>,
    /// npm version the publisher ran.
    #[serde(default, rename = "_npmVersion")]
    pub npm_version: Option<String>,
    /// Runtime dependencies.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Development dependencies.
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, String>,
}

/// Full packument: everything the registry knows about a package.
#[derive(Debug, Clone, Deserialize)]
pub struct Packument {
    /// Package name.
    pub name: String,
    /// Dist-tag map (`latest`, `next`, …).
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
    /// Per-version manifests.
    #[serde(default)]
    pub versions: BTreeMap<String, VersionManifest>,
    /// Publish timestamps per version (plus `created`/`modified`).
    #[serde(default)]
    pub time: BTreeMap<String, DateTime<Utc>>,
    /// Current top-level repository descriptor.
    #[serde(default)]
    pub repository: Option<RepositoryField>,
}

impl Packument {
    /// The manifest for `version`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::VersionNotFound`] when absent.
    pub fn manifest(&self, version: &str) -> Result<&VersionManifest, RegistryError> {
        self.versions
            .get(version)
            .ok_or_else(|| RegistryError::VersionNotFound {
                name: self.name.clone(),
                version: version.to_string(),
            })
    }

    /// Publish timestamp recorded for `version`, if any.
    #[must_use]
    pub fn publish_time(&self, version: &str) -> Option<DateTime<Utc>> {
        self.time.get(version).copied()
    }

    /// Version strings ordered newest-publish first. Versions without a
    /// recorded time sort last, in version order.
    #[must_use]
    pub fn versions_newest_first(&self) -> Vec<String> {
        let mut versions: Vec<&String> = self.versions.keys().collect();
        versions.sort_by(|a, b| {
            match (self.publish_time(a), self.publish_time(b)) {
                (Some(ta), Some(tb)) => tb.cmp(&ta),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => crate::nodever::compare_versions(b, a),
            }
        });
        versions.into_iter().cloned().collect()
    }

    /// Version strings ordered oldest-publish first.
    #[must_use]
    pub fn versions_oldest_first(&self) -> Vec<String> {
        let mut versions = self.versions_newest_first();
        versions.reverse();
        versions
    }
}

/// Publish-time facts for one exact version, assembled from the packument.
/// Immutable once built; everything downstream works from this record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishRecord {
    /// Package name.
    pub name: String,
    /// Exact version.
    pub version: String,
    /// Published tarball URL.
    pub tarball_url: String,
    /// Subresource-integrity digest, when the registry recorded one.
    pub integrity: Option<String>,
    /// Legacy sha-1 digest.
    pub shasum: Option<String>,
    /// Publish timestamp; required for time-bounded installation.
    pub published_at: Option<DateTime<Utc>>,
    /// Node.js version used to publish.
    pub node_version: Option<String>,
    /// npm version used to publish.
    pub npm_version: Option<String>,
    /// Declared runtime dependencies.
    pub dependencies: BTreeMap<String, String>,
    /// Declared development dependencies.
    pub dev_dependencies: BTreeMap<String, String>,
    /// Repository descriptor from the version manifest, falling back to the
    /// packument's top-level descriptor.
    pub repository: Option<RepositoryField>,
    /// Commit recorded at publish time.
    pub git_head: Option<String>,
}

impl PublishRecord {
    /// Build the record for `version` from a packument.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::VersionNotFound`] when the packument lacks
    /// the version.
    pub fn from_packument(packument: &Packument, version: &str) -> Result<Self, RegistryError> {
        let manifest = packument.manifest(version)?;
        Ok(Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            tarball_url: manifest.dist.tarball.clone(),
            integrity: manifest.dist.integrity.clone(),
            shasum: manifest.dist.shasum.clone(),
            published_at: packument.publish_time(version),
            node_version: manifest.node_version.clone(),
            npm_version: manifest.npm_version.clone(),
            dependencies: manifest.dependencies.clone(),
            dev_dependencies: manifest.dev_dependencies.clone(),
            repository: manifest
                .repository
                .clone()
                .or_else(|| packument.repository.clone()),
            git_head: manifest.git_head.clone(),
        })
    }
}

/// Registry access boundary.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch the full packument for `name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::PackageNotFound`] for a 404; transport/status
    /// errors otherwise.
    async fn packument(&self, name: &str) -> Result<Packument, RegistryError>;

    /// Download a published tarball to `dest`.
    ///
    /// # Errors
    ///
    /// Transport, status, or write errors.
    async fn download_tarball(&self, url: &str, dest: &Path) -> Result<(), RegistryError>;

    /// Best-effort check whether the registry holds a publisher provenance
    /// attestation for `name@version`. Any failure reads as `false`.
    async fn has_attestations(&self, name: &str, version: &str) -> bool;
}

/// [`Registry`] implementation over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    /// Create a client for the registry at `base_url` (no trailing slash).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn packument_url(&self, name: &str) -> String {
        // Scoped names keep their '@' but escape the separating slash.
        format!("{}/{}", self.base_url, name.replace('/', "%2F"))
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn packument(&self, name: &str) -> Result<Packument, RegistryError> {
        let url = self.packument_url(name);
        debug!(%url, "fetching packument");

        let response = self.client.get(&url).send().await?;
        match response.status().as_u16() {
            200 => {},
            404 => {
                return Err(RegistryError::PackageNotFound {
                    name: name.to_string(),
                });
            },
            status => {
                return Err(RegistryError::Status { status, url });
            },
        }

        if let Some(len) = response.content_length() {
            if len > MAX_PACKUMENT_BYTES {
                return Err(RegistryError::TooLarge {
                    name: name.to_string(),
                    max: MAX_PACKUMENT_BYTES,
                });
            }
        }

        Ok(response.json().await?)
    }

    async fn download_tarball(&self, url: &str, dest: &Path) -> Result<(), RegistryError> {
        debug!(%url, dest = %dest.display(), "downloading tarball");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let bytes = response.bytes().await?;
        std::fs::write(dest, &bytes).map_err(|source| RegistryError::Write {
            path: dest.display().to_string(),
            source,
        })
    }

    async fn has_attestations(&self, name: &str, version: &str) -> bool {
        let url = format!(
            "{}/-/npm/v1/attestations/{}@{version}",
            self.base_url,
            name.replace('/', "%2F")
        );
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                #[derive(Deserialize)]
                struct Body {
                    #[serde(default)]
                    attestations: Vec<serde_json::Value>,
                }
                response
                    .json::<Body>()
                    .await
                    .map(|body| !body.attestations.is_empty())
                    .unwrap_or(false)
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKUMENT: &str = r#"{
        "name": "left-pad",
        "dist-tags": { "latest": "1.3.0" },
        "versions": {
            "1.0.0": {
                "name": "left-pad",
                "version": "1.0.0",
                "repository": "git://github.com/azer/left-pad.git",
                "dist": {
                    "tarball": "https://registry.npmjs.org/left-pad/-/left-pad-1.0.0.tgz",
                    "shasum": "aaa"
                },
                "_npmVersion": "2.14.7",
                "_nodeVersion": "4.2.1"
            },
            "1.3.0": {
                "name": "left-pad",
                "version": "1.3.0",
                "repository": {
                    "type": "git",
                    "url": "git+https://github.com/stevemao/left-pad.git",
                    "directory": "packages/left-pad"
                },
                "gitHead": "db1442a0556c2b133627ffebf455a78a1ced64b9",
                "dist": {
                    "tarball": "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz",
                    "integrity": "sha512-XI5MPzVNApjAyhQzphX8BkmKsKUxD4LdyK24iZeQGinBN9yTQT3bFlCBy/aVx2HrNcqQGsdot8ghrjyrvMCoEA==",
                    "shasum": "5b8a3a7765dfe001261dde915589e782f8c94d1e"
                },
                "dependencies": { "pad-core": "^2.0.0" },
                "devDependencies": { "mocha": "^3.0.0" }
            }
        },
        "time": {
            "created": "2014-03-20T01:15:21.663Z",
            "1.0.0": "2014-03-20T01:15:21.663Z",
            "1.3.0": "2018-04-10T19:02:03.209Z"
        },
        "repository": { "type": "git", "url": "git+https://github.com/stevemao/left-pad.git" }
    }"#;

    #[test]
    fn packument_deserializes_both_repository_forms() {
        let packument: Packument = serde_json::from_str(PACKUMENT).unwrap();

        let old = packument.manifest("1.0.0").unwrap();
        assert_eq!(
            old.repository.as_ref().unwrap().url(),
            Some("git://github.com/azer/left-pad.git")
        );
        assert_eq!(old.repository.as_ref().unwrap().directory(), None);

        let new = packument.manifest("1.3.0").unwrap();
        assert_eq!(
            new.repository.as_ref().unwrap().directory(),
            Some("packages/left-pad")
        );
    }

    #[test]
    fn publish_record_carries_manifest_facts() {
        let packument: Packument = serde_json::from_str(PACKUMENT).unwrap();
        let record = PublishRecord::from_packument(&packument, "1.3.0").unwrap();

        assert_eq!(record.version, "1.3.0");
        assert!(record.integrity.as_deref().unwrap().starts_with("sha512-"));
        assert_eq!(
            record.git_head.as_deref(),
            Some("db1442a0556c2b133627ffebf455a78a1ced64b9")
        );
        assert_eq!(record.published_at.unwrap().to_rfc3339(), "2018-04-10T19:02:03.209+00:00");
        assert_eq!(record.dependencies.len(), 1);
    }

    #[test]
    fn missing_version_is_a_distinct_error() {
        let packument: Packument = serde_json::from_str(PACKUMENT).unwrap();
        let err = PublishRecord::from_packument(&packument, "9.9.9").unwrap_err();
        assert!(matches!(err, RegistryError::VersionNotFound { .. }));
    }

    #[test]
    fn newest_first_ordering_follows_publish_time() {
        let packument: Packument = serde_json::from_str(PACKUMENT).unwrap();
        assert_eq!(packument.versions_newest_first(), vec!["1.3.0", "1.0.0"]);
        assert_eq!(packument.versions_oldest_first(), vec!["1.0.0", "1.3.0"]);
    }

    #[test]
    fn scoped_names_are_escaped_in_urls() {
        let registry = HttpRegistry::new("https://registry.npmjs.org/");
        assert_eq!(
            registry.packument_url("@types/node"),
            "https://registry.npmjs.org/@types%2Fnode"
        );
    }
}
