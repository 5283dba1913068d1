//! Node.js toolchain matching.
//!
//! A faithful rebuild should run under the Node.js line the publisher used.
//! The matcher provisions versions through `volta`; when the exact version
//! cannot be installed it walks a degrade-gracefully ladder — latest release
//! in the same major line, then the next major line (version strings
//! occasionally reference an unreleased or mistyped version) — and as a last
//! resort falls back to whatever toolchain is already active, recording the
//! substitution so consumers can discount the result.
//!
//! Provisioning is never fatal: a host without `volta` simply runs
//! everything on the ambient `node`/`npm`.

use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::nodever::parse_version;
use crate::process::{CommandRequest, CommandRunner};

/// Oldest Node.js line the version manager can still install. Requests
/// below this are clamped up to it.
pub const MIN_PROVISIONABLE_MAJOR: u64 = 4;

/// The toolchain a build will run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    /// Provisioned Node.js version; `None` means the ambient toolchain.
    pub node_version: Option<String>,
    /// The version the publisher recorded, when known.
    pub requested: Option<String>,
    /// True when provisioning failed (or was unavailable) and the ambient
    /// toolchain was substituted for a concrete request.
    pub substituted: bool,
}

impl Toolchain {
    /// The ambient toolchain, used when no version was requested.
    #[must_use]
    pub fn ambient() -> Self {
        Self {
            node_version: None,
            requested: None,
            substituted: false,
        }
    }

    /// Program and argument prefix for running npm under this toolchain.
    /// `volta run --node <version> npm …` when provisioned, plain `npm …`
    /// otherwise.
    #[must_use]
    pub fn npm_invocation(&self) -> (String, Vec<String>) {
        match &self.node_version {
            Some(version) => (
                "volta".to_string(),
                vec![
                    "run".to_string(),
                    "--node".to_string(),
                    version.clone(),
                    "npm".to_string(),
                ],
            ),
            None => ("npm".to_string(), Vec::new()),
        }
    }

    /// Fragment appended to the result strategy string: the node version
    /// actually in use, with the original request noted on substitution.
    #[must_use]
    pub fn strategy_fragment(&self) -> String {
        match (&self.node_version, self.substituted, &self.requested) {
            (Some(version), _, _) => format!("node:{version}"),
            (None, true, Some(requested)) => format!("node:system(requested {requested})"),
            _ => "node:system".to_string(),
        }
    }
}

/// Provisions Node.js toolchains via the version manager.
pub struct ToolchainMatcher<'a> {
    runner: &'a dyn CommandRunner,
    install_timeout: Duration,
}

impl<'a> ToolchainMatcher<'a> {
    /// Create a matcher that provisions through `runner`.
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            install_timeout: Duration::from_secs(300),
        }
    }

    /// Match a toolchain to the publish-time Node.js version.
    ///
    /// Never fails: every error path degrades to the ambient toolchain.
    pub async fn provision(&self, requested: Option<&str>) -> Toolchain {
        let Some(requested) = requested.filter(|r| !r.trim().is_empty()) else {
            return Toolchain::ambient();
        };

        let Some(parsed) = parse_version(requested) else {
            warn!(%requested, "unparseable publish-time node version; using ambient toolchain");
            return Toolchain {
                node_version: None,
                requested: Some(requested.to_string()),
                substituted: true,
            };
        };

        if !self.manager_available().await {
            debug!("version manager unavailable; using ambient toolchain");
            return Toolchain {
                node_version: None,
                requested: Some(requested.to_string()),
                substituted: true,
            };
        }

        // Versions older than the installable floor are clamped up to it.
        let (exact, major) = if parsed.major < MIN_PROVISIONABLE_MAJOR {
            warn!(
                %requested,
                floor = MIN_PROVISIONABLE_MAJOR,
                "publish-time node version below installable floor; clamping"
            );
            (MIN_PROVISIONABLE_MAJOR.to_string(), MIN_PROVISIONABLE_MAJOR)
        } else {
            (
                format!("{}.{}.{}", parsed.major, parsed.minor, parsed.patch),
                parsed.major,
            )
        };

        // Ladder: exact version, latest in the same major line, latest in
        // the next major line. First success wins.
        let candidates = [exact, major.to_string(), (major + 1).to_string()];
        for candidate in &candidates {
            if let Some(installed) = self.try_install(candidate).await {
                info!(%requested, %installed, "provisioned node toolchain");
                return Toolchain {
                    node_version: Some(installed),
                    requested: Some(requested.to_string()),
                    substituted: false,
                };
            }
        }

        warn!(
            %requested,
            "could not provision any matching node version; using ambient toolchain"
        );
        Toolchain {
            node_version: None,
            requested: Some(requested.to_string()),
            substituted: true,
        }
    }

    async fn manager_available(&self) -> bool {
        let req = CommandRequest::new("volta")
            .args(["--version"])
            .timeout(Duration::from_secs(20));
        matches!(self.runner.run(&req).await, Ok(out) if out.success())
    }

    /// Install one candidate; idempotent (reinstalling a present version is
    /// a cache hit for the version manager). Returns the concrete version
    /// that ended up installed.
    async fn try_install(&self, candidate: &str) -> Option<String> {
        let req = CommandRequest::new("volta")
            .args(vec!["install".to_string(), format!("node@{candidate}")])
            .timeout(self.install_timeout);

        match self.runner.run(&req).await {
            Ok(out) if out.success() => {
                Some(parse_installed_version(&out.combined()).unwrap_or_else(|| candidate.to_string()))
            },
            _ => None,
        }
    }
}

/// Pull the concrete `x.y.z` out of version-manager install output, which
/// reports lines like `success: installed and set node@16.20.2 as default`.
#[must_use]
fn parse_installed_version(output: &str) -> Option<String> {
    let re = Regex::new(r"node@(\d+\.\d+\.\d+)").expect("static regex");
    re.captures(output)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeRunner;

    fn matcher(runner: &FakeRunner) -> ToolchainMatcher<'_> {
        ToolchainMatcher::new(runner)
    }

    #[tokio::test]
    async fn no_requested_version_means_ambient_without_probing() {
        let runner = FakeRunner::new();
        let toolchain = matcher(&runner).provision(None).await;
        assert_eq!(toolchain, Toolchain::ambient());
        assert!(runner.invocations().is_empty());
        assert_eq!(toolchain.npm_invocation().0, "npm");
        assert_eq!(toolchain.strategy_fragment(), "node:system");
    }

    #[tokio::test]
    async fn exact_version_is_the_first_attempt() {
        let runner = FakeRunner::new();
        runner.succeed_with("volta --version", "2.0.1");
        runner.succeed_with(
            "install node@16.14.2",
            "success: installed and set node@16.14.2 as default",
        );

        let toolchain = matcher(&runner).provision(Some("16.14.2")).await;
        assert_eq!(toolchain.node_version.as_deref(), Some("16.14.2"));
        assert!(!toolchain.substituted);
        assert_eq!(
            toolchain.npm_invocation(),
            (
                "volta".to_string(),
                vec![
                    "run".to_string(),
                    "--node".to_string(),
                    "16.14.2".to_string(),
                    "npm".to_string()
                ]
            )
        );
    }

    #[tokio::test]
    async fn same_major_line_is_the_second_attempt() {
        let runner = FakeRunner::new();
        runner.succeed_with("volta --version", "2.0.1");
        runner.fail_with("install node@16.99.0", "error: no such version");
        runner.succeed_with(
            "install node@16",
            "success: installed and set node@16.20.2 as default",
        );

        let toolchain = matcher(&runner).provision(Some("16.99.0")).await;
        assert_eq!(toolchain.node_version.as_deref(), Some("16.20.2"));
        assert!(!toolchain.substituted);
    }

    #[tokio::test]
    async fn next_major_line_is_the_third_attempt() {
        let runner = FakeRunner::new();
        runner.succeed_with("volta --version", "2.0.1");
        runner.fail_with("install node@16.99.0", "error: no such version");
        runner.fail_with("install node@16", "error: mirror unreachable");
        runner.succeed_with(
            "install node@17",
            "success: installed and set node@17.9.1 as default",
        );

        let toolchain = matcher(&runner).provision(Some("16.99.0")).await;
        assert_eq!(toolchain.node_version.as_deref(), Some("17.9.1"));
    }

    #[tokio::test]
    async fn exhausted_ladder_substitutes_ambient_toolchain() {
        let runner = FakeRunner::new();
        runner.succeed_with("volta --version", "2.0.1");
        runner.fail_with("install", "error: network down");

        let toolchain = matcher(&runner).provision(Some("16.14.2")).await;
        assert_eq!(toolchain.node_version, None);
        assert!(toolchain.substituted);
        assert_eq!(
            toolchain.strategy_fragment(),
            "node:system(requested 16.14.2)"
        );
    }

    #[tokio::test]
    async fn missing_version_manager_is_a_silent_fallback() {
        let runner = FakeRunner::new();
        runner.fail_with("volta --version", "volta: command not found");

        let toolchain = matcher(&runner).provision(Some("16.14.2")).await;
        assert_eq!(toolchain.node_version, None);
        assert!(toolchain.substituted);
        // Only the availability probe ran; no install attempts.
        assert_eq!(runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn ancient_versions_clamp_to_the_floor() {
        let runner = FakeRunner::new();
        runner.succeed_with("volta --version", "2.0.1");
        runner.succeed_with(
            "install node@4",
            "success: installed and set node@4.9.1 as default",
        );

        let toolchain = matcher(&runner).provision(Some("0.10.48")).await;
        assert_eq!(toolchain.node_version.as_deref(), Some("4.9.1"));
        assert!(runner.saw("install node@4"));
        assert!(!runner.saw("install node@0.10.48"));
    }

    #[test]
    fn installed_version_scrape() {
        assert_eq!(
            parse_installed_version("success: installed and set node@16.20.2 as default"),
            Some("16.20.2".to_string())
        );
        assert_eq!(parse_installed_version("nothing useful here"), None);
    }
}
