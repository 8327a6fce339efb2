// src/assemble/sandbox.rs

//! Writable directory assembler

use super::{AssembleOptions, Assembler, ImageFormat, prepare_destination, write_failed};
use crate::bundle::Bundle;
use crate::error::Result;
use crate::filesystem::move_tree;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Moves the staged rootfs to the destination
///
/// The tree is first moved into a staging directory beside the destination
/// (copying when it lives on another filesystem), then renamed onto it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxAssembler;

impl Assembler for SandboxAssembler {
    fn format(&self) -> ImageFormat {
        ImageFormat::Sandbox
    }

    fn assemble(&self, bundle: &Bundle, dest: &Path, opts: &AssembleOptions) -> Result<PathBuf> {
        let parent = prepare_destination(dest, opts.force)?;
        let staging = tempfile::Builder::new()
            .prefix(".imgbuild-staging-")
            .tempdir_in(&parent)
            .map_err(|e| write_failed(parent.display(), e))?;

        let staged = staging.path().join("rootfs");
        debug!("Staging {} at {}", bundle.rootfs().display(), staged.display());
        move_tree(bundle.rootfs(), &staged).map_err(|e| write_failed(staged.display(), e))?;

        // the previous tree is removed along with the staging directory
        let aside = staging.path().join("previous");
        swap_into_place(&staged, dest, &aside).map_err(|e| write_failed(dest.display(), e))?;

        staging
            .close()
            .map_err(|e| write_failed("removing staging directory", e))?;
        Ok(dest.to_path_buf())
    }
}

/// Rename `staged` onto `dest`, parking an existing `dest` at `aside`
///
/// If the final rename fails the parked tree is put back.
fn swap_into_place(staged: &Path, dest: &Path, aside: &Path) -> io::Result<()> {
    let replacing = fs::symlink_metadata(dest).is_ok();
    if replacing {
        info!("Replacing existing {}", dest.display());
        fs::rename(dest, aside)?;
    }
    if let Err(e) = fs::rename(staged, dest) {
        if replacing && let Err(restore) = fs::rename(aside, dest) {
            warn!(
                "Could not restore {} from {}: {}",
                dest.display(),
                aside.display(),
                restore
            );
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AssembleCause, Error};
    use tempfile::TempDir;

    fn bundle_with(file: &str, content: &str) -> Bundle {
        let bundle = Bundle::create(None).unwrap();
        fs::write(bundle.rootfs().join(file), content).unwrap();
        bundle
    }

    #[test]
    fn test_moves_rootfs_to_destination() {
        let out = TempDir::new().unwrap();
        let dest = out.path().join("sandbox");
        let bundle = bundle_with("hello", "world");

        SandboxAssembler
            .assemble(&bundle, &dest, &AssembleOptions::default())
            .unwrap();
        assert_eq!(fs::read_to_string(dest.join("hello")).unwrap(), "world");
        // only the destination is left beside it
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_refuses_existing_without_force() {
        let out = TempDir::new().unwrap();
        let dest = out.path().join("sandbox");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("keep"), "me").unwrap();
        let bundle = bundle_with("new", "tree");

        let err = SandboxAssembler
            .assemble(&bundle, &dest, &AssembleOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Assemble { cause: AssembleCause::WriteFailed, .. }));
        assert!(dest.join("keep").exists());
        assert!(bundle.rootfs().join("new").exists());
    }

    #[test]
    fn test_force_replaces_existing() {
        let out = TempDir::new().unwrap();
        let dest = out.path().join("sandbox");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("old"), "tree").unwrap();
        let bundle = bundle_with("new", "tree");

        SandboxAssembler
            .assemble(&bundle, &dest, &AssembleOptions::default().with_force(true))
            .unwrap();
        assert!(dest.join("new").exists());
        assert!(!dest.join("old").exists());
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_failed_swap_restores_previous_tree() {
        let out = TempDir::new().unwrap();
        let dest = out.path().join("sandbox");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("old"), "tree").unwrap();
        let aside = out.path().join("previous");

        let missing = out.path().join("never-staged");
        assert!(swap_into_place(&missing, &dest, &aside).is_err());
        assert_eq!(fs::read_to_string(dest.join("old")).unwrap(), "tree");
        assert!(!aside.exists());
    }
}
