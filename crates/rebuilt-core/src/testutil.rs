//! Shared test fixtures.

use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Write a gzipped tarball at `path` containing `files`, each entry placed
/// under the registry's conventional `package/` wrapper directory.
pub fn write_package_tgz(path: &Path, files: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, bytes) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{name}"), *bytes)
            .unwrap();
    }

    builder.into_inner().unwrap().finish().unwrap();
}
