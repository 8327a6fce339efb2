// src/sources/busybox.rs

//! Minimal root filesystem around a static busybox binary

use super::{FetchContext, SourceBackend};
use crate::bundle::Bundle;
use crate::definition::{BootstrapKind, Definition};
use crate::error::{Error, FetchCause, Result, UnpackCause};
use crate::fetch::HttpClient;
use crate::privilege::ElevatedToken;
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

const DIRECTORIES: &[&str] = &[
    "bin", "dev", "etc", "home", "proc", "root", "sys", "tmp", "usr/bin", "usr/sbin", "var",
];

/// Applets linked into `/bin`
const APPLETS: &[&str] = &[
    "sh", "ash", "ls", "cat", "cp", "mv", "rm", "mkdir", "rmdir", "ln", "chmod", "chown",
    "echo", "env", "grep", "sed", "awk", "find", "head", "tail", "touch", "sleep", "ps",
    "kill", "mount", "umount", "vi", "wget", "tar", "gzip", "id", "uname", "true", "false",
];

const PASSWD: &str = "root:x:0:0:root:/root:/bin/sh\nnobody:x:65534:65534:nobody:/:/bin/false\n";
const GROUP: &str = "root:x:0:\nnogroup:x:65534:\n";
const HOSTS: &str = "127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n";

pub struct BusyboxBackend {
    ctx: FetchContext,
    scratch: Option<TempDir>,
}

impl BusyboxBackend {
    pub fn new(ctx: FetchContext) -> Self {
        Self { ctx, scratch: None }
    }

    fn binary_path(&self) -> Option<PathBuf> {
        self.scratch.as_ref().map(|d| d.path().join("busybox"))
    }
}

fn write_failed(context: &Path, e: std::io::Error) -> Error {
    Error::unpack(UnpackCause::WriteFailed, format!("{}: {}", context.display(), e))
}

impl SourceBackend for BusyboxBackend {
    fn kind(&self) -> BootstrapKind {
        BootstrapKind::Busybox
    }

    fn fetch(&mut self, def: &Definition, _token: &ElevatedToken) -> Result<()> {
        let url = def
            .get("mirrorurl")
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(self.ctx.config.busybox_url.as_str())
            .to_string();

        let scratch = self.ctx.scratch_dir("imgbuild-busybox-")?;
        let dest = scratch.path().join("busybox");

        if url.starts_with("http://") || url.starts_with("https://") {
            let client = HttpClient::new()?;
            client.download_file(&url, &dest, None)?;
        } else {
            let local = url.strip_prefix("file://").unwrap_or(&url);
            let source = def.resolve_path(local);
            if !source.is_file() {
                return Err(Error::fetch(
                    FetchCause::NotFound,
                    format!("busybox binary not found at {}", source.display()),
                ));
            }
            debug!("Copying busybox from {}", source.display());
            fs::copy(&source, &dest)?;
        }

        self.scratch = Some(scratch);
        Ok(())
    }

    fn unpack(&mut self, bundle: &mut Bundle, _token: &ElevatedToken) -> Result<()> {
        let binary = self.binary_path().ok_or_else(|| {
            Error::fetch(FetchCause::NotFound, "unpack called before a successful fetch")
        })?;
        let rootfs = bundle.rootfs().to_path_buf();

        for dir in DIRECTORIES {
            let path = rootfs.join(dir);
            fs::create_dir_all(&path).map_err(|e| write_failed(&path, e))?;
        }
        fs::set_permissions(rootfs.join("tmp"), fs::Permissions::from_mode(0o1777))
            .map_err(|e| write_failed(&rootfs.join("tmp"), e))?;

        let installed = rootfs.join("bin/busybox");
        fs::copy(&binary, &installed).map_err(|e| write_failed(&installed, e))?;
        fs::set_permissions(&installed, fs::Permissions::from_mode(0o755))
            .map_err(|e| write_failed(&installed, e))?;

        for applet in APPLETS {
            let link = rootfs.join("bin").join(applet);
            if fs::symlink_metadata(&link).is_err() {
                symlink("busybox", &link).map_err(|e| write_failed(&link, e))?;
            }
        }

        for (name, content) in [("passwd", PASSWD), ("group", GROUP), ("hosts", HOSTS)] {
            let path = rootfs.join("etc").join(name);
            fs::write(&path, content).map_err(|e| write_failed(&path, e))?;
        }

        // scratch copy is no longer needed
        self.scratch = None;
        info!("Installed busybox with {} applets", APPLETS.len());
        bundle.metadata_mut().record("bootstrap", "busybox");
        Ok(())
    }
}
