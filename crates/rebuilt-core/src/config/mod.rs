//! Run configuration.
//!
//! One immutable [`RunConfig`] value is constructed per invocation, from CLI
//! flags or defaults, and handed down the pipeline. There is no global
//! mutable options state.

use std::path::PathBuf;
use std::time::Duration;

/// Immutable configuration for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Registry base URL.
    pub registry_url: String,
    /// Root directory of the persisted result history (one file per
    /// package version underneath).
    pub cache_root: PathBuf,
    /// Directory receiving dependency-queue handoff files.
    pub deps_dir: PathBuf,
    /// Parent directory for per-attempt scratch work trees.
    pub work_root: PathBuf,
    /// Timeout for repository reachability probes (`git ls-remote`).
    pub probe_timeout: Duration,
    /// Timeout for clone and fetch operations.
    pub fetch_timeout: Duration,
    /// Timeout for dependency installation.
    pub install_timeout: Duration,
    /// Bound on unpublished-dependency removal retries during install.
    pub max_dependency_removals: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            registry_url: "https://registry.npmjs.org".to_string(),
            cache_root: PathBuf::from("results"),
            deps_dir: PathBuf::from("deps-queue"),
            work_root: std::env::temp_dir(),
            probe_timeout: Duration::from_secs(20),
            fetch_timeout: Duration::from_secs(300),
            install_timeout: Duration::from_secs(900),
            max_dependency_removals: 5,
        }
    }
}
