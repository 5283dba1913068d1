//! Content digests for artifacts and tree files.
//!
//! The registry publishes `sha512-<base64>` subresource-integrity strings
//! for tarballs; per-file comparison uses sha-256 hex. Both live here so the
//! encodings stay in one place.

use std::io::Read;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256, Sha512};

/// Prefix of an npm subresource-integrity string produced by this crate.
pub const INTEGRITY_PREFIX: &str = "sha512-";

/// sha-256 of a byte slice, hex-encoded.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(&Sha256::digest(bytes))
}

/// sha-512 subresource-integrity string (`sha512-<base64>`) of a file.
///
/// # Errors
///
/// Returns the underlying I/O error if the file cannot be read.
pub fn sha512_integrity(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!(
        "{INTEGRITY_PREFIX}{}",
        STANDARD.encode(hasher.finalize())
    ))
}

/// Hex encoding, kept local rather than pulling a crate for two call sites.
mod hex {
    use std::fmt::Write;

    pub fn encode(bytes: &[u8]) -> String {
        bytes
            .iter()
            .fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            })
    }
}
