// src/assemble/legacy.rs

//! Tar archive assembler

use super::{AssembleOptions, Assembler, ImageFormat, prepare_destination, write_failed};
use crate::bundle::Bundle;
use crate::error::Result;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes the rootfs as a gzip-compressed tar, symlinks kept as links
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyAssembler;

impl Assembler for LegacyAssembler {
    fn format(&self) -> ImageFormat {
        ImageFormat::Legacy
    }

    fn assemble(&self, bundle: &Bundle, dest: &Path, opts: &AssembleOptions) -> Result<PathBuf> {
        let parent = prepare_destination(dest, opts.force)?;
        let temp = tempfile::Builder::new()
            .prefix(".imgbuild-")
            .suffix(".tar.gz")
            .tempfile_in(&parent)
            .map_err(|e| write_failed(parent.display(), e))?;

        let file = temp.reopen().map_err(|e| write_failed(temp.path().display(), e))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", bundle.rootfs())
            .map_err(|e| write_failed(bundle.rootfs().display(), e))?;

        let mut file = builder
            .into_inner()
            .and_then(GzEncoder::finish)
            .map_err(|e| write_failed(temp.path().display(), e))?;
        file.flush().map_err(|e| write_failed(temp.path().display(), e))?;

        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o644))
            .map_err(|e| write_failed(temp.path().display(), e))?;
        temp.persist(dest)
            .map_err(|e| write_failed(dest.display(), e.error))?;
        info!("Wrote {}", dest.display());
        Ok(dest.to_path_buf())
    }
}
