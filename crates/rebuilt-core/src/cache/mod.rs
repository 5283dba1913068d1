//! Persisted result history store.
//!
//! The cache is an explicit key-value boundary — `get(key) -> history`,
//! `put(key, history)` — so the pipeline runs identically against the
//! filesystem store and the in-memory store used in tests. The filesystem
//! layout is one pretty-printed, newline-terminated JSON array per package
//! version, rewritten in full on every put (never appended) so the
//! dedup/ordering invariants always hold on disk, with a temp-file +
//! rename protocol so a crash never leaves a torn file behind.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::record::ResultHistory;

/// Ceiling on a single history file; anything larger is treated as damage.
const MAX_HISTORY_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from the result store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The key would escape the cache root or is empty.
    #[error("invalid cache key {key}: {reason}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A history file exceeds the size ceiling.
    #[error("history file {path} is {size} bytes (max {max})")]
    TooLarge {
        /// File path.
        path: String,
        /// Actual size.
        size: u64,
        /// The ceiling.
        max: u64,
    },

    /// I/O failure.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable context.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization failure.
    #[error("failed to serialize history: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Storage key: package name plus exact version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PackageKey {
    name: String,
    version: String,
}

impl PackageKey {
    /// Build a key, rejecting names/versions that could escape the cache
    /// root when used as path components.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidKey`] for empty or traversal-capable values.
    pub fn new(name: &str, version: &str) -> Result<Self, CacheError> {
        let invalid = |reason: &str| CacheError::InvalidKey {
            key: format!("{name}@{version}"),
            reason: reason.to_string(),
        };

        if name.is_empty() || version.is_empty() {
            return Err(invalid("empty component"));
        }
        if name.split('/').any(|part| part.is_empty() || part == "." || part == "..")
            || name.starts_with('/')
        {
            return Err(invalid("name is not a safe path component"));
        }
        if version.contains('/') || version == "." || version == ".." {
            return Err(invalid("version is not a safe path component"));
        }

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    /// Package name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exact version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Relative file path under the cache root. Scoped names (`@scope/x`)
    /// nest naturally as directories.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.name).join(format!("{}.json", self.version))
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Result history store boundary.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Load the history for `key`; absent or corrupt files read as empty.
    ///
    /// # Errors
    ///
    /// I/O failures other than absence; oversized files.
    async fn get(&self, key: &PackageKey) -> Result<ResultHistory, CacheError>;

    /// Persist the full history for `key`, replacing what was there.
    ///
    /// # Errors
    ///
    /// I/O or serialization failures.
    async fn put(&self, key: &PackageKey, history: &ResultHistory) -> Result<(), CacheError>;
}

/// Filesystem-backed [`ResultStore`].
#[derive(Debug, Clone)]
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    /// Store rooted at `root` (created lazily on first put).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &PackageKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

#[async_trait]
impl ResultStore for FsResultStore {
    async fn get(&self, key: &PackageKey) -> Result<ResultHistory, CacheError> {
        let path = self.path_for(key);

        let mut file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ResultHistory::default());
            },
            Err(e) => return Err(CacheError::io(format!("open {}", path.display()), e)),
        };

        let size = file
            .metadata()
            .map_err(|e| CacheError::io(format!("stat {}", path.display()), e))?
            .len();
        if size > MAX_HISTORY_FILE_SIZE {
            return Err(CacheError::TooLarge {
                path: path.display().to_string(),
                size,
                max: MAX_HISTORY_FILE_SIZE,
            });
        }

        let mut raw = Vec::with_capacity(size as usize);
        file.read_to_end(&mut raw)
            .map_err(|e| CacheError::io(format!("read {}", path.display()), e))?;

        match serde_json::from_slice(&raw) {
            Ok(history) => Ok(history),
            Err(e) => {
                // Corrupt histories read as empty; the next put rewrites
                // the file wholesale anyway.
                warn!(path = %path.display(), error = %e, "corrupt history file; treating as empty");
                Ok(ResultHistory::default())
            },
        }
    }

    async fn put(&self, key: &PackageKey, history: &ResultHistory) -> Result<(), CacheError> {
        let path = self.path_for(key);
        let dir = path
            .parent()
            .expect("key paths always have a parent")
            .to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| CacheError::io(format!("create {}", dir.display()), e))?;

        let mut bytes = serde_json::to_vec_pretty(history)?;
        bytes.push(b'\n');

        // Random temp name in the target directory, write + fsync, then
        // rename into place.
        let temp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| CacheError::io("create temp history file", e))?;
        {
            use std::io::Write;
            let mut file = temp.as_file();
            file.write_all(&bytes)
                .map_err(|e| CacheError::io("write temp history file", e))?;
            file.sync_all()
                .map_err(|e| CacheError::io("fsync temp history file", e))?;
        }
        temp.persist(&path)
            .map_err(|e| CacheError::io(format!("rename into {}", path.display()), e.error))?;

        Ok(())
    }
}

/// In-memory [`ResultStore`] for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<PackageKey, ResultHistory>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn get(&self, key: &PackageKey) -> Result<ResultHistory, CacheError> {
        Ok(self
            .entries
            .lock()
            .expect("store mutex poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn put(&self, key: &PackageKey, history: &ResultHistory) -> Result<(), CacheError> {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .insert(key.clone(), history.clone());
        Ok(())
    }
}
