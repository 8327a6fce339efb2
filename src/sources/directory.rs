// src/sources/directory.rs

//! Local directory backend (`directory`, `localimage`)
//!
//! Copies an existing tree verbatim. Nothing is added, so a build with no
//! sections reproduces the source exactly.

use super::{SourceBackend, required_header};
use crate::bundle::Bundle;
use crate::definition::{BootstrapKind, Definition};
use crate::error::{Error, FetchCause, Result, UnpackCause};
use crate::filesystem::copy_tree;
use crate::privilege::ElevatedToken;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Default)]
pub struct DirectoryBackend {
    source: Option<PathBuf>,
}

impl DirectoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SourceBackend for DirectoryBackend {
    fn kind(&self) -> BootstrapKind {
        BootstrapKind::Directory
    }

    fn fetch(&mut self, def: &Definition, _token: &ElevatedToken) -> Result<()> {
        let source = def.resolve_path(required_header(def, "from")?);
        if !source.is_dir() {
            return Err(Error::fetch(
                FetchCause::NotFound,
                format!("{} is not a directory", source.display()),
            ));
        }
        self.source = Some(source);
        Ok(())
    }

    fn unpack(&mut self, bundle: &mut Bundle, _token: &ElevatedToken) -> Result<()> {
        let source = self.source.take().ok_or_else(|| {
            Error::fetch(FetchCause::NotFound, "unpack called before a successful fetch")
        })?;
        let copied = copy_tree(&source, bundle.rootfs()).map_err(|e| {
            Error::unpack(
                UnpackCause::WriteFailed,
                format!("copying {}: {}", source.display(), e),
            )
        })?;
        info!("Copied {} entries from {}", copied, source.display());
        bundle
            .metadata_mut()
            .record("unpack", format!("directory {}", source.display()));
        Ok(())
    }
}
