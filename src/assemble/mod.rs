// src/assemble/mod.rs

//! Assemblers: turn a finished bundle into the on-disk artifact
//!
//! | Format    | Assembler            | Output |
//! |-----------|----------------------|--------|
//! | `image`   | [`SquashfsAssembler`] | squashfs file via `mksquashfs` |
//! | `sandbox` | [`SandboxAssembler`]  | writable root directory |
//! | `legacy`  | [`LegacyAssembler`]   | gzip-compressed tar |
//!
//! Every assembler writes next to the destination first and moves the
//! result into place, so a failed build never leaves a partial artifact.

mod legacy;
mod sandbox;
mod squashfs;

pub use legacy::LegacyAssembler;
pub use sandbox::SandboxAssembler;
pub use squashfs::SquashfsAssembler;

use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::error::{AssembleCause, Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Output format of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    /// Compressed read-only squashfs image
    #[default]
    Image,
    /// Writable directory tree
    Sandbox,
    /// Gzip-compressed tar archive
    Legacy,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 3] = [Self::Image, Self::Sandbox, Self::Legacy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Sandbox => "sandbox",
            Self::Legacy => "legacy",
        }
    }

    /// External tool the format needs, if any
    pub fn required_tool(&self) -> Option<&'static str> {
        match self {
            Self::Image => Some("mksquashfs"),
            Self::Sandbox | Self::Legacy => None,
        }
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "image" | "squashfs" | "sif" => Ok(Self::Image),
            "sandbox" | "dir" => Ok(Self::Sandbox),
            "legacy" | "tar" | "tar.gz" => Ok(Self::Legacy),
            _ => Err(Error::UnknownFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings shared by all assemblers for one build
#[derive(Debug, Clone)]
pub struct AssembleOptions {
    /// Replace an existing destination
    pub force: bool,
    /// Explicit `mksquashfs` (PATH lookup when unset)
    pub mksquashfs: Option<PathBuf>,
    pub compression: String,
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl AssembleOptions {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            force: false,
            mksquashfs: config.mksquashfs_path.clone(),
            compression: config.squashfs_compression.clone(),
            timeout: config.step_timeout(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self::from_config(&BuildConfig::default())
    }
}

/// Serializes a bundle into one image format
pub trait Assembler: Send + Sync {
    fn format(&self) -> ImageFormat;

    /// Check prerequisites before the build starts
    fn preflight(&self, _opts: &AssembleOptions) -> Result<()> {
        Ok(())
    }

    /// Write the artifact for `bundle` to `dest`, returning its path
    fn assemble(&self, bundle: &Bundle, dest: &Path, opts: &AssembleOptions) -> Result<PathBuf>;
}

/// Image format to assembler
pub struct AssemblerRegistry {
    assemblers: HashMap<ImageFormat, Box<dyn Assembler>>,
}

impl AssemblerRegistry {
    pub fn new() -> Self {
        Self {
            assemblers: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SquashfsAssembler));
        registry.register(Box::new(SandboxAssembler));
        registry.register(Box::new(LegacyAssembler));
        registry
    }

    /// Register (or replace) the assembler for its format
    pub fn register(&mut self, assembler: Box<dyn Assembler>) {
        self.assemblers.insert(assembler.format(), assembler);
    }

    pub fn has(&self, format: ImageFormat) -> bool {
        self.assemblers.contains_key(&format)
    }

    pub fn get(&self, format: ImageFormat) -> Result<&dyn Assembler> {
        self.assemblers
            .get(&format)
            .map(|a| a.as_ref())
            .ok_or_else(|| Error::UnknownFormat(format.to_string()))
    }
}

impl Default for AssemblerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub(crate) fn write_failed(context: impl fmt::Display, e: impl fmt::Display) -> Error {
    Error::assemble(AssembleCause::WriteFailed, format!("{}: {}", context, e))
}

/// Refuse an existing destination unless forced; create its parent
pub(crate) fn prepare_destination(dest: &Path, force: bool) -> Result<PathBuf> {
    if fs::symlink_metadata(dest).is_ok() && !force {
        return Err(Error::assemble(
            AssembleCause::WriteFailed,
            format!("{} already exists (use --force to overwrite)", dest.display()),
        ));
    }
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| write_failed(parent.display(), e))?;
    Ok(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!("image".parse::<ImageFormat>().unwrap(), ImageFormat::Image);
        assert_eq!("SANDBOX".parse::<ImageFormat>().unwrap(), ImageFormat::Sandbox);
        assert_eq!("tar.gz".parse::<ImageFormat>().unwrap(), ImageFormat::Legacy);
        assert!(matches!(
            "qcow2".parse::<ImageFormat>(),
            Err(Error::UnknownFormat(f)) if f == "qcow2"
        ));
    }

    #[test]
    fn test_builtins_cover_every_format() {
        let registry = AssemblerRegistry::with_builtins();
        for format in ImageFormat::ALL {
            assert_eq!(registry.get(format).unwrap().format(), format);
        }
        assert!(matches!(
            AssemblerRegistry::new().get(ImageFormat::Image),
            Err(Error::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_prepare_destination_refuses_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("out");
        fs::write(&dest, "old").unwrap();
        assert!(matches!(
            prepare_destination(&dest, false),
            Err(Error::Assemble { cause: AssembleCause::WriteFailed, .. })
        ));
        assert_eq!(prepare_destination(&dest, true).unwrap(), dir.path());
    }
}
