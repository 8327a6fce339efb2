// tests/common/mod.rs

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use imgbuild::{
    AssembleOptions, Assembler, AssemblerRegistry, BackendRegistry, BuildConfig, Bundle,
    ImageFormat, Orchestrator, PrivilegeCoordinator, PrivilegeLevel, PrivilegeOps,
};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use walkdir::WalkDir;

/// Privilege ops that only record what was asked of them
#[derive(Default)]
pub struct RecordingPrivilege {
    level: AtomicU32,
    pub calls: Mutex<Vec<&'static str>>,
}

impl PrivilegeOps for RecordingPrivilege {
    fn current(&self) -> PrivilegeLevel {
        PrivilegeLevel(self.level.load(Ordering::SeqCst))
    }

    fn elevate(&self) -> Result<PrivilegeLevel, String> {
        self.calls.lock().unwrap().push("elevate");
        Ok(PrivilegeLevel(self.level.swap(0, Ordering::SeqCst)))
    }

    fn restore(&self, previous: PrivilegeLevel) -> Result<(), String> {
        self.calls.lock().unwrap().push("restore");
        self.level.store(previous.0, Ordering::SeqCst);
        Ok(())
    }

    fn process_wide(&self) -> bool {
        false
    }
}

/// Assembler that writes a marker file and counts its invocations
pub struct CountingAssembler {
    format: ImageFormat,
    pub calls: Arc<AtomicUsize>,
}

impl CountingAssembler {
    pub fn new(format: ImageFormat) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                format,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl Assembler for CountingAssembler {
    fn format(&self) -> ImageFormat {
        self.format
    }

    fn assemble(
        &self,
        bundle: &Bundle,
        dest: &Path,
        _opts: &AssembleOptions,
    ) -> imgbuild::Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::write(dest, bundle.rootfs().display().to_string())?;
        Ok(dest.to_path_buf())
    }
}

/// Orchestrator over the built-in backends with a mock privilege layer
pub fn orchestrator(assemblers: AssemblerRegistry) -> (Orchestrator, Arc<RecordingPrivilege>) {
    let ops = Arc::new(RecordingPrivilege::default());
    let orchestrator = Orchestrator::new(
        BackendRegistry::with_builtins(),
        assemblers,
        PrivilegeCoordinator::new(ops.clone()),
    );
    (orchestrator, ops)
}

/// Built-in assemblers with `stub` taking over its format
pub fn assemblers_with(stub: CountingAssembler) -> AssemblerRegistry {
    let mut registry = AssemblerRegistry::with_builtins();
    registry.register(Box::new(stub));
    registry
}

/// Host-side steps, staging under `tmp`
pub fn test_config(tmp: &Path) -> BuildConfig {
    BuildConfig::default()
        .with_tmp_dir(tmp)
        .with_isolation(false)
        .with_step_timeout(Duration::from_secs(30))
}

/// A small tree with nested dirs, an executable and a symlink
pub fn populate_tree(root: &Path) {
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::create_dir_all(root.join("usr/bin")).unwrap();
    fs::write(root.join("etc/hostname"), "imgbuild\n").unwrap();
    fs::write(root.join("usr/bin/tool"), "#!/bin/sh\necho tool\n").unwrap();
    fs::set_permissions(root.join("usr/bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
    symlink("usr/bin", root.join("bin")).unwrap();
}

/// Relative path to (type, mode, content or link target) for every entry
pub fn listing(root: &Path) -> BTreeMap<PathBuf, (String, u32, Vec<u8>)> {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let meta = entry.path().symlink_metadata().unwrap();
            let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
            let ft = meta.file_type();
            let (kind, data) = if ft.is_symlink() {
                let target = fs::read_link(entry.path()).unwrap();
                ("link", target.into_os_string().into_encoded_bytes())
            } else if ft.is_dir() {
                ("dir", Vec::new())
            } else {
                ("file", fs::read(entry.path()).unwrap())
            };
            let mode = if ft.is_symlink() { 0 } else { meta.permissions().mode() & 0o7777 };
            (rel, (kind.to_string(), mode, data))
        })
        .collect()
}

/// Number of entries directly inside `dir` (zero when it does not exist)
pub fn entry_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
