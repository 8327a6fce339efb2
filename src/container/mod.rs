// src/container/mod.rs

//! Script and tool execution for build steps
//!
//! `%post` scripts run inside the staging root filesystem: the child unshares
//! a private mount namespace, bind-mounts `/proc`, `/sys`, `/dev` and the
//! host resolver files, then chroots into the rootfs. The mounts disappear
//! with the namespace, so nothing has to be unmounted afterwards.
//!
//! Every external process goes through [`run_command`]: stdin is null,
//! output is captured and logged line by line, a timeout kills the child,
//! and a cancelled build sends SIGTERM (then SIGKILL after a grace period).

use crate::cancel::CancelToken;
use crate::filesystem::resolve_in_root;
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Gid, Pid, Uid, chdir, chroot, setresgid, setresuid};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// PATH given to chrooted scripts
pub const CONTAINER_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Process execution errors
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("failed to start {0}")]
    Spawn(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("namespace isolation unavailable: {0}")]
    IsolationUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exit status and captured output of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, -1 when killed by a signal
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Last few stderr lines, for error messages
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Host path to bind into the root filesystem
#[derive(Debug, Clone)]
pub struct BindMount {
    /// Source path on host
    pub source: PathBuf,
    /// Target path inside the rootfs
    pub target: PathBuf,
    pub writable: bool,
}

impl BindMount {
    pub fn readonly(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            writable: false,
        }
    }

    pub fn writable(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            writable: true,
        }
    }
}

/// How scripts are executed against the rootfs
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Chroot into the rootfs inside a private mount namespace
    pub isolate_mount: bool,
    /// Fail instead of running host-side when isolation is unavailable
    pub require_isolation: bool,
    pub bind_mounts: Vec<BindMount>,
    pub timeout: Duration,
}

impl ContainerConfig {
    /// Chrooted execution with the standard pseudo-filesystems
    ///
    /// Isolation is required unless relaxed with
    /// [`with_required_isolation`](Self::with_required_isolation).
    pub fn for_build(timeout: Duration) -> Self {
        Self {
            isolate_mount: true,
            require_isolation: true,
            bind_mounts: default_bind_mounts(),
            timeout,
        }
    }

    /// Host-side execution with the rootfs as working directory
    pub fn host(timeout: Duration) -> Self {
        Self {
            isolate_mount: false,
            require_isolation: false,
            bind_mounts: Vec::new(),
            timeout,
        }
    }

    pub fn add_bind_mount(&mut self, mount: BindMount) {
        self.bind_mounts.push(mount);
    }

    pub fn with_required_isolation(mut self, required: bool) -> Self {
        self.require_isolation = required;
        self
    }
}

fn default_bind_mounts() -> Vec<BindMount> {
    vec![
        BindMount::writable("/proc", "/proc"),
        BindMount::writable("/sys", "/sys"),
        BindMount::writable("/dev", "/dev"),
        BindMount::readonly("/etc/resolv.conf", "/etc/resolv.conf"),
        BindMount::readonly("/etc/hosts", "/etc/hosts"),
    ]
}

/// Script runner bound to one root filesystem
pub struct Sandbox {
    config: ContainerConfig,
    rootfs: PathBuf,
}

impl Sandbox {
    pub fn new(config: ContainerConfig, rootfs: impl Into<PathBuf>) -> Self {
        Self {
            config,
            rootfs: rootfs.into(),
        }
    }

    /// Run `script` with `interpreter` against the rootfs
    pub fn execute(
        &self,
        label: &str,
        interpreter: &str,
        script: &str,
        env: &[(&str, &str)],
        cancel: Option<&CancelToken>,
    ) -> Result<ProcessOutput, ContainerError> {
        if self.config.isolate_mount {
            if isolation_available() {
                return self.execute_isolated(label, interpreter, script, env, cancel);
            }
            if self.config.require_isolation {
                return Err(ContainerError::IsolationUnavailable(
                    "chroot and mount namespaces need root".to_string(),
                ));
            }
            warn!("Namespace isolation not available, running %{} host-side", label);
        }

        let mut env: Vec<(&str, &str)> = env.to_vec();
        let rootfs = self.rootfs.to_string_lossy();
        env.push(("IMGBUILD_ROOTFS", rootfs.as_ref()));
        run_host_script(
            label,
            interpreter,
            script,
            &env,
            &self.rootfs,
            self.config.timeout,
            cancel,
        )
    }

    fn execute_isolated(
        &self,
        label: &str,
        interpreter: &str,
        script: &str,
        env: &[(&str, &str)],
        cancel: Option<&CancelToken>,
    ) -> Result<ProcessOutput, ContainerError> {
        let inner = Path::new(interpreter);
        let interp_in_root = self.rootfs.join(inner.strip_prefix("/").unwrap_or(inner));
        if fs::symlink_metadata(&interp_in_root).is_err() {
            return Err(ContainerError::Spawn(format!(
                "interpreter {} not found in root filesystem",
                interpreter
            )));
        }

        let mut script_file = tempfile::Builder::new()
            .prefix(".imgbuild-")
            .suffix(".sh")
            .tempfile_in(&self.rootfs)?;
        script_file.write_all(script.as_bytes())?;
        script_file.flush()?;
        fs::set_permissions(script_file.path(), fs::Permissions::from_mode(0o700))?;
        let script_in_root = Path::new("/").join(
            script_file
                .path()
                .file_name()
                .ok_or_else(|| ContainerError::Spawn("script path has no file name".to_string()))?,
        );

        let (mounts, placeholders) = self.prepare_mounts()?;
        let rootfs = self.rootfs.clone();

        let mut cmd = Command::new(interpreter);
        cmd.arg(&script_in_root)
            .env_clear()
            .env("PATH", CONTAINER_PATH)
            .env("HOME", "/root")
            .env("TERM", "dumb");
        for (key, value) in env {
            cmd.env(key, value);
        }

        // SAFETY: the closure only makes syscalls on data prepared before fork
        unsafe {
            cmd.pre_exec(move || enter_root(&rootfs, &mounts));
        }

        debug!("Running %{} chrooted into {}", label, self.rootfs.display());
        let result = run_command(cmd, label, self.config.timeout, cancel);

        for placeholder in placeholders {
            let _ = fs::remove_file(placeholder);
        }
        drop(script_file);
        result
    }

    /// Resolve bind targets inside the rootfs and create mount points
    ///
    /// Returns the mounts to perform and placeholder files to remove after.
    fn prepare_mounts(&self) -> Result<(Vec<BindMount>, Vec<PathBuf>), ContainerError> {
        let mut mounts = Vec::new();
        let mut placeholders = Vec::new();

        for bm in &self.config.bind_mounts {
            if !bm.source.exists() {
                debug!("Skipping bind mount, source doesn't exist: {:?}", bm.source);
                continue;
            }
            // mount(2) follows links in the target, so resolve them here
            // the way the chroot will see them
            let target = resolve_in_root(&self.rootfs, &bm.target, true)?;

            if bm.source.is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if !target.exists() {
                    File::create(&target)?;
                    placeholders.push(target.clone());
                }
            }

            mounts.push(BindMount {
                source: bm.source.clone(),
                target,
                writable: bm.writable,
            });
        }
        Ok((mounts, placeholders))
    }
}

/// Child side of an isolated run: private mounts, bind mounts, chroot
fn enter_root(rootfs: &Path, mounts: &[BindMount]) -> std::io::Result<()> {
    unshare(CloneFlags::CLONE_NEWNS)?;
    mount::<str, str, str, str>(None, "/", None, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None)?;

    for bm in mounts {
        mount::<Path, Path, str, str>(
            Some(bm.source.as_path()),
            &bm.target,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )?;
        if !bm.writable {
            // best effort
            let _ = mount::<str, Path, str, str>(
                None,
                &bm.target,
                None,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                None,
            );
        }
    }

    chroot(rootfs)?;
    chdir("/")?;
    Ok(())
}

/// Run a script on the host with `workdir` as current directory
pub fn run_host_script(
    label: &str,
    interpreter: &str,
    script: &str,
    env: &[(&str, &str)],
    workdir: &Path,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<ProcessOutput, ContainerError> {
    if !Path::new(interpreter).exists() && which::which(interpreter).is_err() {
        return Err(ContainerError::Spawn(format!(
            "interpreter not found: {}",
            interpreter
        )));
    }

    let temp_dir = TempDir::new()?;
    let script_path = temp_dir.path().join("script.sh");
    {
        let mut f = File::create(&script_path)?;
        f.write_all(script.as_bytes())?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o700))?;
    }

    let mut cmd = Command::new(interpreter);
    cmd.arg(&script_path).current_dir(workdir);
    for (key, value) in env {
        cmd.env(key, value);
    }
    run_command(cmd, label, timeout, cancel)
}

/// Run a prepared command to completion
pub fn run_command(
    mut cmd: Command,
    label: &str,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<ProcessOutput, ContainerError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let ruid = nix::unistd::getuid();
    let euid = nix::unistd::geteuid();
    if needs_full_root(ruid, euid) {
        // shells reset the effective uid to the real one when they differ
        // SAFETY: only async-signal-safe syscalls run in the child
        unsafe {
            cmd.pre_exec(become_root);
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ContainerError::Spawn(format!("{}: {}", label, e)))?;

    let stdout_reader = child.stdout.take().map(|out| spawn_reader(out, label, false));
    let stderr_reader = child.stderr.take().map(|err| spawn_reader(err, label, true));

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
            break status;
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            info!("Cancelling {}", label);
            terminate(&mut child);
            return Err(ContainerError::Cancelled);
        }
        if Instant::now() >= deadline {
            warn!("{} exceeded {:?}, killing", label, timeout);
            terminate(&mut child);
            return Err(ContainerError::TimedOut(timeout));
        }
    };

    let stdout = stdout_reader.map(join_reader).unwrap_or_default();
    let stderr = stderr_reader.map(join_reader).unwrap_or_default();

    Ok(ProcessOutput {
        code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

/// True when a child would start with an effective uid of root but a
/// different real uid, which `sh` and `bash` treat as setuid and drop
fn needs_full_root(ruid: Uid, euid: Uid) -> bool {
    euid.is_root() && !ruid.is_root()
}

/// Child side of an elevated run: make every id root
fn become_root() -> std::io::Result<()> {
    let root_gid = Gid::from_raw(0);
    let root_uid = Uid::from_raw(0);
    setresgid(root_gid, root_gid, root_gid)?;
    setresuid(root_uid, root_uid, root_uid)?;
    Ok(())
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, label: &str, is_stderr: bool) -> JoinHandle<String> {
    let label = label.to_string();
    std::thread::spawn(move || {
        let mut captured = String::new();
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            if is_stderr {
                warn!("[{}] {}", label, line);
            } else {
                info!("[{}] {}", label, line);
            }
            captured.push_str(&line);
            captured.push('\n');
        }
        captured
    })
}

fn join_reader(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// SIGTERM, then SIGKILL if the child ignores it
fn terminate(child: &mut Child) {
    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);
    match child.wait_timeout(TERM_GRACE) {
        Ok(Some(_)) => {}
        _ => {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Check if chroot and mount namespaces can be used
pub fn isolation_available() -> bool {
    nix::unistd::geteuid().is_root()
}
