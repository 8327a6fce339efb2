// src/bundle/mod.rs

//! Build staging area
//!
//! A [`Bundle`] owns one private temporary directory for the life of a build.
//! The backend populates `rootfs/`, steps mutate it, and the assembler reads
//! it. The orchestrator calls [`Bundle::teardown`] on every exit path; `Drop`
//! removes whatever is left if a caller forgets.

mod metadata;

pub use metadata::{BundleMetadata, HistoryEntry, SIDECAR_DIR};
pub(crate) use metadata::shell_quote;

use crate::error::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Owned staging directory plus accumulated metadata
pub struct Bundle {
    dir: Option<TempDir>,
    path: PathBuf,
    rootfs: PathBuf,
    metadata: BundleMetadata,
    deferred_cleanup: Vec<PathBuf>,
}

impl Bundle {
    /// Create a fresh bundle under `parent` (system temp dir when `None`)
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                tempfile::Builder::new().prefix("imgbuild-").tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix("imgbuild-").tempdir()?,
        };
        let path = dir.path().to_path_buf();
        let rootfs = path.join("rootfs");
        fs::create_dir(&rootfs)?;
        fs::set_permissions(&rootfs, fs::Permissions::from_mode(0o755))?;

        debug!("Created bundle at {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
            rootfs,
            metadata: BundleMetadata::default(),
            deferred_cleanup: Vec::new(),
        })
    }

    /// Bundle directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Staging root filesystem
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn metadata(&self) -> &BundleMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BundleMetadata {
        &mut self.metadata
    }

    /// Private scratch directory inside the bundle
    pub fn scratch_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.path.join(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove `path` during teardown even if it lives outside the bundle
    pub fn defer_cleanup(&mut self, path: impl Into<PathBuf>) {
        self.deferred_cleanup.push(path.into());
    }

    /// Write metadata sidecars into the root filesystem
    pub fn write_metadata(&self) -> Result<bool> {
        Ok(self.metadata.write_sidecars(&self.rootfs)?)
    }

    /// Remove the bundle, or keep it and return its path
    ///
    /// Deferred paths are removed first. A failure to remove any of them, or
    /// the bundle itself, is returned; with `keep` the directory is kept
    /// regardless.
    pub fn teardown(mut self, keep: bool) -> Result<Option<PathBuf>> {
        let leftovers = self.run_deferred_cleanup();
        let Some(dir) = self.dir.take() else {
            return Ok(None);
        };

        let kept = if keep {
            #[allow(deprecated)]
            let kept = dir.into_path();
            info!("Keeping staging directory at {}", kept.display());
            Some(kept)
        } else {
            dir.close()?;
            debug!("Removed bundle {}", self.path.display());
            None
        };

        if !leftovers.is_empty() {
            return Err(std::io::Error::other(format!(
                "could not remove {}",
                leftovers.join(", ")
            ))
            .into());
        }
        Ok(kept)
    }

    /// Remove deferred paths, returning a description of each failure
    fn run_deferred_cleanup(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        for path in self.deferred_cleanup.drain(..) {
            let result = match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
                Ok(_) => fs::remove_file(&path),
                Err(_) => Ok(()),
            };
            if let Err(e) = result {
                warn!("Failed to remove {}: {}", path.display(), e);
                failures.push(format!("{} ({})", path.display(), e));
            }
        }
        failures
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        if self.dir.is_some() {
            let _ = self.run_deferred_cleanup();
        }
    }
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("path", &self.path)
            .field("rootfs", &self.rootfs)
            .finish_non_exhaustive()
    }
}
