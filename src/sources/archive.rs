// src/sources/archive.rs

//! Root filesystem archive backend

use super::tarball::{TarOptions, extract_tar};
use super::{SourceBackend, ensure_mount_points, required_header};
use crate::bundle::Bundle;
use crate::compression::open_decoded;
use crate::definition::{BootstrapKind, Definition};
use crate::error::{Error, FetchCause, Result, UnpackCause};
use crate::privilege::ElevatedToken;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct ArchiveBackend {
    source: Option<PathBuf>,
}

impl ArchiveBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Parse a `Checksum` header value (`sha256:<hex>`)
fn expected_sha256(value: &str) -> Result<String> {
    let value = value.trim();
    let hex = value.strip_prefix("sha256:").unwrap_or(value);
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::unpack(
            UnpackCause::Corrupt,
            format!("unsupported checksum: {}", value),
        ));
    }
    Ok(hex.to_ascii_lowercase())
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

impl SourceBackend for ArchiveBackend {
    fn kind(&self) -> BootstrapKind {
        BootstrapKind::Archive
    }

    fn fetch(&mut self, def: &Definition, _token: &ElevatedToken) -> Result<()> {
        let source = def.resolve_path(required_header(def, "from")?);
        if !source.is_file() {
            return Err(Error::fetch(
                FetchCause::NotFound,
                format!("archive {} not found", source.display()),
            ));
        }

        if let Some(checksum) = def.get("checksum") {
            let expected = expected_sha256(checksum)?;
            let actual = sha256_file(&source)?;
            if actual != expected {
                return Err(Error::unpack(
                    UnpackCause::Corrupt,
                    format!(
                        "checksum mismatch for {}: expected sha256:{}, got sha256:{}",
                        source.display(),
                        expected,
                        actual
                    ),
                ));
            }
            debug!("Checksum verified for {}", source.display());
        }

        self.source = Some(source);
        Ok(())
    }

    fn unpack(&mut self, bundle: &mut Bundle, _token: &ElevatedToken) -> Result<()> {
        let source = self.source.take().ok_or_else(|| {
            Error::fetch(FetchCause::NotFound, "unpack called before a successful fetch")
        })?;
        let reader = open_decoded(&source)
            .map_err(|e| Error::unpack(UnpackCause::Corrupt, e.to_string()))?;
        let entries = extract_tar(reader, bundle.rootfs(), TarOptions::default())?;
        ensure_mount_points(bundle.rootfs()).map_err(|e| {
            Error::unpack(UnpackCause::WriteFailed, format!("creating mount points: {}", e))
        })?;

        info!("Extracted {} entries from {}", entries, source.display());
        bundle
            .metadata_mut()
            .record("unpack", format!("archive {}", source.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::PrivilegeCoordinator;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use tempfile::TempDir;

    fn write_tgz(path: &Path) -> Vec<u8> {
        let enc = GzEncoder::new(Vec::new(), Compression::fast());
        let mut builder = tar::Builder::new(enc);
        let data = b"hello\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "etc/motd", &data[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();
        fs::write(path, &bytes).unwrap();
        bytes
    }

    fn def(context: &Path, checksum: Option<&str>) -> Definition {
        let mut builder = Definition::builder()
            .header("Bootstrap", "archive")
            .header("From", "rootfs.tar.gz")
            .context_dir(context);
        if let Some(sum) = checksum {
            builder = builder.header("Checksum", sum);
        }
        builder.build().unwrap()
    }

    fn run(def: &Definition) -> (Result<()>, Bundle) {
        let mut backend = ArchiveBackend::new();
        let mut bundle = Bundle::create(None).unwrap();
        let result = PrivilegeCoordinator::unprivileged().with_elevated(|t| {
            backend.fetch(def, t)?;
            backend.unpack(&mut bundle, t)
        });
        (result, bundle)
    }

    #[test]
    fn test_extracts_and_adds_mount_points() {
        let dir = TempDir::new().unwrap();
        let bytes = write_tgz(&dir.path().join("rootfs.tar.gz"));
        let sum = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));

        let (result, bundle) = run(&def(dir.path(), Some(&sum)));
        result.unwrap();
        assert_eq!(
            fs::read_to_string(bundle.rootfs().join("etc/motd")).unwrap(),
            "hello\n"
        );
        for mp in super::super::MOUNT_POINTS {
            assert!(bundle.rootfs().join(mp).is_dir());
        }
    }

    #[test]
    fn test_checksum_mismatch_leaves_bundle_untouched() {
        let dir = TempDir::new().unwrap();
        write_tgz(&dir.path().join("rootfs.tar.gz"));
        let wrong = format!("sha256:{}", "0".repeat(64));

        let (result, bundle) = run(&def(dir.path(), Some(&wrong)));
        assert!(matches!(result, Err(Error::Unpack { cause: UnpackCause::Corrupt, .. })));
        assert_eq!(fs::read_dir(bundle.rootfs()).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let bytes = write_tgz(&dir.path().join("rootfs.tar.gz"));
        fs::write(dir.path().join("rootfs.tar.gz"), &bytes[..bytes.len() / 2]).unwrap();

        let (result, _bundle) = run(&def(dir.path(), None));
        assert!(matches!(result, Err(Error::Unpack { cause: UnpackCause::Corrupt, .. })));
    }

    #[test]
    fn test_missing_archive() {
        let dir = TempDir::new().unwrap();
        let (result, _bundle) = run(&def(dir.path(), None));
        assert!(matches!(result, Err(Error::Fetch { cause: FetchCause::NotFound, .. })));
    }
}
