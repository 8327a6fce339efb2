// src/assemble/squashfs.rs

//! Squashfs image assembler

use super::{AssembleOptions, Assembler, ImageFormat, prepare_destination, write_failed};
use crate::bundle::Bundle;
use crate::container::{ContainerError, run_command};
use crate::error::{AssembleCause, Error, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct SquashfsAssembler;

impl SquashfsAssembler {
    /// Configured `mksquashfs`, else the one on PATH
    pub fn locate(opts: &AssembleOptions) -> Result<PathBuf> {
        match &opts.mksquashfs {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(Error::assemble(
                AssembleCause::ToolMissing,
                format!("mksquashfs not found at {}", path.display()),
            )),
            None => which::which("mksquashfs").map_err(|_| {
                Error::assemble(
                    AssembleCause::ToolMissing,
                    "mksquashfs not found on PATH (install squashfs-tools)",
                )
            }),
        }
    }
}

impl Assembler for SquashfsAssembler {
    fn format(&self) -> ImageFormat {
        ImageFormat::Image
    }

    fn preflight(&self, opts: &AssembleOptions) -> Result<()> {
        Self::locate(opts).map(|_| ())
    }

    fn assemble(&self, bundle: &Bundle, dest: &Path, opts: &AssembleOptions) -> Result<PathBuf> {
        let mksquashfs = Self::locate(opts)?;
        let parent = prepare_destination(dest, opts.force)?;

        let temp = tempfile::Builder::new()
            .prefix(".imgbuild-")
            .suffix(".sqfs")
            .tempfile_in(&parent)
            .map_err(|e| write_failed(parent.display(), e))?
            .into_temp_path();

        let mut cmd = Command::new(&mksquashfs);
        cmd.arg(bundle.rootfs())
            .arg(temp.as_os_str())
            .args(["-noappend", "-comp", opts.compression.as_str()]);

        info!("Creating squashfs image ({})", opts.compression);
        let output = run_command(cmd, "mksquashfs", opts.timeout, Some(&opts.cancel))
            .map_err(|e| match e {
                ContainerError::Cancelled => Error::Cancelled,
                other => write_failed("mksquashfs", other),
            })?;
        if !output.success() {
            return Err(write_failed(
                format!("mksquashfs exited with code {}", output.code),
                output.stderr_tail(10),
            ));
        }

        fs::set_permissions(&temp, fs::Permissions::from_mode(0o644))
            .map_err(|e| write_failed(temp.display(), e))?;
        temp.persist(dest)
            .map_err(|e| write_failed(dest.display(), e.error))?;
        Ok(dest.to_path_buf())
    }
}
