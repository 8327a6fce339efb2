// src/filesystem/path.rs

//! Path sanitization for paths that must stay inside a root
//!
//! Destinations in `%files`, archive members and image layer entries are all
//! resolved relative to the staging rootfs; none of them may climb out of it.
//! Symlinks already inside the rootfs are resolved the way they would be
//! from inside a chroot: absolute targets restart at the rootfs and `..`
//! stops at it.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Symlink hops allowed while resolving one path (same limit as Linux)
const MAX_SYMLINK_HOPS: usize = 40;

/// Normalize an untrusted path into a relative one
///
/// Leading slashes and `.` components are dropped; any `..` component is
/// rejected. An empty result means the root itself.
pub fn sanitize_path(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                warn!("Path traversal attempt detected: {}", path.display());
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path escapes root: {}", path.display()),
                ));
            }
        }
    }

    Ok(normalized)
}

/// Join an untrusted path onto `root`
pub fn safe_join(root: impl AsRef<Path>, path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let root = root.as_ref();
    let joined = root.join(sanitize_path(path)?);
    if !joined.starts_with(root) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path escapes root: {}", joined.display()),
        ));
    }
    Ok(joined)
}

/// Resolve an untrusted path against `root` as if `root` were `/`
///
/// Every existing component is checked for symlinks; a link is replaced by
/// its target, re-rooted when absolute. The final component is followed only
/// when `follow_final` is set. Components that do not exist yet are appended
/// as they are, so the result is always a path below `root`.
pub fn resolve_in_root(
    root: impl AsRef<Path>,
    path: impl AsRef<Path>,
    follow_final: bool,
) -> io::Result<PathBuf> {
    let root = root.as_ref();
    let mut pending: VecDeque<OsString> = sanitize_path(path)?
        .iter()
        .map(|c| c.to_os_string())
        .collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = root.join(&resolved).join(&part);
        let is_final = pending.is_empty();
        let is_link = fs::symlink_metadata(&candidate).is_ok_and(|m| m.file_type().is_symlink());

        if !is_link || (is_final && !follow_final) {
            resolved.push(&part);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("too many levels of symbolic links: {}", candidate.display()),
            ));
        }
        let target = fs::read_link(&candidate)?;
        if target.is_absolute() {
            resolved.clear();
        }
        for component in target.components().rev() {
            match component {
                Component::Normal(c) => pending.push_front(c.to_os_string()),
                Component::ParentDir => pending.push_front(OsString::from("..")),
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
    }

    Ok(root.join(resolved))
}
