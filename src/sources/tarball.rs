// src/sources/tarball.rs

//! Tar extraction into a root filesystem
//!
//! Shared by the archive backend and OCI layer application. Entries are
//! confined to the root; a read failure in the stream is reported as a
//! corrupt source, a failure writing the tree as a write failure.

use crate::error::{Error, Result, UnpackCause};
use crate::filesystem::{resolve_in_root, sanitize_path};
use std::fs;
use std::cell::Cell;
use std::io::{self, Read};
use std::path::Path;
use std::rc::Rc;
use tar::{Archive, EntryType};
use tracing::{debug, warn};

/// OCI whiteout prefix
const WHITEOUT_PREFIX: &str = ".wh.";

/// OCI opaque directory marker
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Extraction behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct TarOptions {
    /// Interpret `.wh.` entries as deletions (image layers)
    pub whiteouts: bool,
}

impl TarOptions {
    pub fn layer() -> Self {
        Self { whiteouts: true }
    }
}

fn corrupt(context: &str, e: impl std::fmt::Display) -> Error {
    Error::unpack(UnpackCause::Corrupt, format!("{}: {}", context, e))
}

/// Remembers whether the source stream itself failed
struct TrackedReader<R> {
    inner: R,
    failed: Rc<Cell<bool>>,
}

impl<R: Read> Read for TrackedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| self.failed.set(true))
    }
}

fn classify(context: &str, e: io::Error, read_failed: bool) -> Error {
    let stream_error = matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput
    );
    if read_failed || stream_error {
        corrupt(context, e)
    } else {
        Error::unpack(UnpackCause::WriteFailed, format!("{}: {}", context, e))
    }
}

/// Extract a tar stream into `rootfs`, returning the number of entries
pub fn extract_tar<R: Read>(reader: R, rootfs: &Path, opts: TarOptions) -> Result<usize> {
    let as_root = nix::unistd::geteuid().is_root();
    let read_failed = Rc::new(Cell::new(false));
    let mut archive = Archive::new(TrackedReader {
        inner: reader,
        failed: Rc::clone(&read_failed),
    });
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(as_root);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    let mut count = 0usize;
    let entries = archive.entries().map_err(|e| corrupt("reading archive", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt("reading archive entry", e))?;
        let raw_path = entry
            .path()
            .map_err(|e| corrupt("entry path", e))?
            .into_owned();
        let rel = sanitize_path(&raw_path).map_err(|e| corrupt("entry path", e))?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if opts.whiteouts && name.starts_with(WHITEOUT_PREFIX) {
            // a lower layer may have turned the parent into a link
            let parent = resolve_in_root(rootfs, rel.parent().unwrap_or(Path::new("")), true)
                .map_err(|e| classify("whiteout", e, false))?;
            if name == OPAQUE_MARKER {
                clear_dir(&parent).map_err(|e| classify("opaque whiteout", e, false))?;
            } else {
                let victim = parent.join(&name[WHITEOUT_PREFIX.len()..]);
                remove_any(&victim).map_err(|e| classify("whiteout", e, false))?;
            }
            count += 1;
            continue;
        }

        let entry_type = entry.header().entry_type();
        if !as_root && matches!(entry_type, EntryType::Char | EntryType::Block) {
            warn!("Skipping device node {} (requires root)", rel.display());
            continue;
        }

        // replace a file with a directory (or the reverse) from a lower layer
        let target =
            resolve_in_root(rootfs, &rel, false).map_err(|e| classify("entry path", e, false))?;
        if let Ok(existing) = fs::symlink_metadata(&target) {
            let want_dir = entry_type == EntryType::Directory;
            if existing.is_dir() && !want_dir {
                fs::remove_dir_all(&target).map_err(|e| classify("replacing directory", e, false))?;
            } else if !existing.is_dir() && want_dir {
                fs::remove_file(&target).map_err(|e| classify("replacing file", e, false))?;
            }
        }

        let unpacked = entry
            .unpack_in(rootfs)
            .map_err(|e| classify(&rel.display().to_string(), e, read_failed.get()))?;
        if !unpacked {
            debug!("Skipped entry outside root: {}", raw_path.display());
            continue;
        }
        count += 1;
    }

    Ok(count)
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    if !fs::symlink_metadata(dir).is_ok_and(|m| m.is_dir()) {
        return Ok(());
    }
    for child in fs::read_dir(dir)? {
        remove_any(&child?.path())?;
    }
    Ok(())
}
