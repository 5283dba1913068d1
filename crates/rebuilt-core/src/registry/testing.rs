//! Canned registry for tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Packument, Registry, RegistryError};

/// In-memory [`Registry`] serving pre-built packuments and tarball bytes.
#[derive(Default)]
pub struct FakeRegistry {
    packuments: Mutex<BTreeMap<String, Packument>>,
    tarballs: Mutex<BTreeMap<String, Vec<u8>>>,
    attested: Mutex<BTreeMap<String, bool>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `packument` (parsed from JSON) for its package name.
    pub fn add_packument_json(&self, json: &str) {
        let packument: Packument = serde_json::from_str(json).expect("valid packument JSON");
        self.packuments
            .lock()
            .unwrap()
            .insert(packument.name.clone(), packument);
    }

    /// Serve `bytes` for tarball requests to `url`.
    pub fn add_tarball(&self, url: &str, bytes: Vec<u8>) {
        self.tarballs.lock().unwrap().insert(url.to_string(), bytes);
    }

    /// Mark `name@version` as carrying a provenance attestation.
    pub fn set_attested(&self, name: &str, version: &str) {
        self.attested
            .lock()
            .unwrap()
            .insert(format!("{name}@{version}"), true);
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn packument(&self, name: &str) -> Result<Packument, RegistryError> {
        self.packuments
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::PackageNotFound {
                name: name.to_string(),
            })
    }

    async fn download_tarball(&self, url: &str, dest: &Path) -> Result<(), RegistryError> {
        let bytes = self
            .tarballs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| RegistryError::Status {
                status: 404,
                url: url.to_string(),
            })?;
        std::fs::write(dest, bytes).map_err(|source| RegistryError::Write {
            path: dest.display().to_string(),
            source,
        })
    }

    async fn has_attestations(&self, name: &str, version: &str) -> bool {
        self.attested
            .lock()
            .unwrap()
            .get(&format!("{name}@{version}"))
            .copied()
            .unwrap_or(false)
    }
}
