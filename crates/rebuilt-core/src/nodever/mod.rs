//! Lenient dotted-version parsing and ordering.
//!
//! Node.js, npm, and this tool all report `major.minor.patch` versions,
//! sometimes with a leading `v`, a pre-release suffix, or missing trailing
//! components. History ordering and the toolchain ladder need a semantic
//! comparison over such strings; full range algebra stays with npm itself.

use std::cmp::Ordering;

/// A parsed dotted version. Missing components default to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTriple {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
    /// Pre-release suffix (the part after `-`), if any.
    pub pre: Option<String>,
}

impl VersionTriple {
    /// True when this version is at least `major.minor.patch` (pre-release
    /// of the floor itself counts as below it).
    #[must_use]
    pub fn at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        let floor = Self {
            major,
            minor,
            patch,
            pre: None,
        };
        self.cmp(&floor) != Ordering::Less
    }
}

impl Ord for VersionTriple {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                // A release sorts above any of its pre-releases.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for VersionTriple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parse a version string leniently.
///
/// Accepts an optional leading `v` or `=`, up to three numeric components,
/// and an optional `-pre` / `+build` suffix (build metadata is discarded).
/// Returns `None` when the first component is not numeric.
#[must_use]
pub fn parse_version(input: &str) -> Option<VersionTriple> {
    let trimmed = input.trim().trim_start_matches(['v', '=']);
    if trimmed.is_empty() {
        return None;
    }

    let (core, pre) = match trimmed.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (trimmed, None),
    };
    let core = core.split('+').next().unwrap_or(core);
    let pre = pre.map(|p| p.split('+').next().unwrap_or(p).to_string());

    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    if parts.next().is_some() {
        return None;
    }

    Some(VersionTriple {
        major,
        minor,
        patch,
        pre,
    })
}

/// Major component of a version string, if parseable.
#[must_use]
pub fn major_of(input: &str) -> Option<u64> {
    parse_version(input).map(|v| v.major)
}

/// Compare two version strings semantically, falling back to a lexical
/// comparison when either side does not parse. Total order either way.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}
