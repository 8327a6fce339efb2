// src/steps/files.rs

//! `%files` copies from the build context into the rootfs

use crate::definition::{Definition, FileCopy};
use crate::error::{Error, FileCopyCause, Result};
use crate::filesystem::{copy_path, resolve_in_root};
use crate::privilege::ElevatedToken;
use std::path::{Path, PathBuf};
use tracing::debug;

fn has_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Expand a source pattern against the build context
fn expand_source(def: &Definition, source: &str) -> Result<Vec<PathBuf>> {
    let resolved = def.resolve_path(source);

    if !has_glob(source) {
        if std::fs::symlink_metadata(&resolved).is_err() {
            return Err(Error::file_copy(
                FileCopyCause::NotFound,
                source,
                format!("{} does not exist", resolved.display()),
            ));
        }
        return Ok(vec![resolved]);
    }

    let pattern = resolved.to_string_lossy();
    let matches: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| Error::file_copy(FileCopyCause::NotFound, source, e.to_string()))?
        .filter_map(|entry| entry.ok())
        .collect();

    if matches.is_empty() {
        return Err(Error::file_copy(
            FileCopyCause::NotFound,
            source,
            format!("no files match {}", pattern),
        ));
    }
    Ok(matches)
}

/// Copy one `%files` entry, returning the number of files written
pub fn copy_entry(
    def: &Definition,
    entry: &FileCopy,
    rootfs: &Path,
    _token: &ElevatedToken,
) -> Result<u64> {
    let sources = expand_source(def, &entry.source)?;
    // links already in the rootfs resolve as they would inside it
    let dest = resolve_in_root(rootfs, &entry.dest, true).map_err(|e| {
        Error::file_copy(FileCopyCause::WriteFailed, &entry.dest, e.to_string())
    })?;

    // several matches, an existing directory or a trailing slash all mean
    // "copy into"
    let into_dir = sources.len() > 1 || entry.dest.ends_with('/') || dest.is_dir();

    let mut written = 0;
    for source in &sources {
        let target = match (into_dir, source.file_name()) {
            (true, Some(name)) => dest.join(name),
            _ => dest.clone(),
        };
        debug!("Copying {} to {}", source.display(), target.display());
        written += copy_path(source, &target).map_err(|e| {
            Error::file_copy(
                FileCopyCause::WriteFailed,
                source.display().to_string(),
                e.to_string(),
            )
        })?;
    }
    Ok(written)
}
