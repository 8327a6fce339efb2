// src/filesystem/copy.rs

//! Tree copies that keep file modes, symlinks and special files

use nix::sys::stat::{Mode, SFlag, mknod};
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt, lchown, symlink};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Copy the contents of `src` into `dst`, creating `dst` if needed
///
/// Symlinks are recreated, not followed. Ownership and device nodes are
/// preserved only when running as root.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let as_root = nix::unistd::geteuid().is_root();
    let mut dirs: Vec<(PathBuf, fs::Metadata)> = Vec::new();
    let mut copied = 0u64;

    make_real_dir(dst)?;

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;

        if meta.is_dir() {
            make_real_dir(&target)?;
            dirs.push((target, meta));
            continue;
        }

        copy_entry(entry.path(), &target, &meta, as_root)?;
        copied += 1;
    }

    // directory modes last so read-only directories can still be filled
    for (dir, meta) in dirs.iter().rev() {
        fs::set_permissions(dir, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        if as_root {
            preserve_owner(dir, meta);
        }
    }

    debug!("Copied {} entries from {} to {}", copied, src.display(), dst.display());
    Ok(copied)
}

/// Copy a single path (file, symlink or directory) to `dst`
pub fn copy_path(src: &Path, dst: &Path) -> io::Result<u64> {
    let meta = src.symlink_metadata()?;
    if meta.is_dir() {
        return copy_tree(src, dst);
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    copy_entry(src, dst, &meta, nix::unistd::geteuid().is_root())?;
    Ok(1)
}

/// Move a tree, falling back to copy-and-delete across filesystems
pub fn move_tree(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!("Cross-device move, copying {} to {}", src.display(), dst.display());
            copy_tree(src, dst)?;
            fs::remove_dir_all(src)
        }
        Err(e) => Err(e),
    }
}

fn copy_entry(src: &Path, dst: &Path, meta: &fs::Metadata, as_root: bool) -> io::Result<()> {
    let file_type = meta.file_type();

    if let Ok(existing) = dst.symlink_metadata() {
        if existing.is_dir() {
            fs::remove_dir(dst)?;
        } else {
            fs::remove_file(dst)?;
        }
    }

    if file_type.is_symlink() {
        symlink(fs::read_link(src)?, dst)?;
    } else if file_type.is_file() {
        fs::copy(src, dst)?;
        fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    } else if file_type.is_char_device() || file_type.is_block_device() || file_type.is_fifo() {
        if !as_root && !file_type.is_fifo() {
            warn!("Skipping device node {} (requires root)", src.display());
            return Ok(());
        }
        let kind = if file_type.is_char_device() {
            SFlag::S_IFCHR
        } else if file_type.is_block_device() {
            SFlag::S_IFBLK
        } else {
            SFlag::S_IFIFO
        };
        mknod(
            dst,
            kind,
            Mode::from_bits_truncate(meta.mode() & 0o7777),
            meta.rdev(),
        )
        .map_err(io::Error::from)?;
    } else {
        warn!("Skipping unsupported file type at {}", src.display());
        return Ok(());
    }

    if as_root {
        preserve_owner(dst, meta);
    }
    Ok(())
}

/// Create `dir` as a real directory, replacing a symlink or file in its place
///
/// Writing through an existing link would land wherever the link points,
/// which for a rootfs may be outside of it.
fn make_real_dir(dir: &Path) -> io::Result<()> {
    match dir.symlink_metadata() {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {
            debug!("Replacing non-directory at {}", dir.display());
            fs::remove_file(dir)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(dir)
}

fn preserve_owner(path: &Path, meta: &fs::Metadata) {
    if let Err(e) = lchown(path, Some(meta.uid()), Some(meta.gid())) {
        debug!("lchown {} failed: {}", path.display(), e);
    }
}
