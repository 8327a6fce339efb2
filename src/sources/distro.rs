// src/sources/distro.rs

//! Distribution bootstrap backends (`debootstrap`, `yum`/`dnf`, `zypper`)
//!
//! These run an external installer straight into the rootfs, so fetch and
//! unpack are a single step.

use super::{FetchContext, SourceBackend, ensure_mount_points, required_header};
use crate::bundle::Bundle;
use crate::container::{ContainerError, run_command};
use crate::definition::{BootstrapKind, Definition};
use crate::error::{Error, FetchCause, Result, UnpackCause};
use crate::privilege::ElevatedToken;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

const DEFAULT_DEBIAN_MIRROR: &str = "http://deb.debian.org/debian";
const STDERR_TAIL_LINES: usize = 20;

/// External installer used for a distro bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistroTool {
    Debootstrap,
    Dnf,
    Yum,
    Zypper,
}

impl DistroTool {
    pub fn program(&self) -> &'static str {
        match self {
            Self::Debootstrap => "debootstrap",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
        }
    }

    /// Tools that can serve `kind`, in order of preference
    pub fn candidates(kind: BootstrapKind) -> &'static [DistroTool] {
        match kind {
            BootstrapKind::Debootstrap => &[Self::Debootstrap],
            BootstrapKind::Yum => &[Self::Dnf, Self::Yum],
            BootstrapKind::Zypper => &[Self::Zypper],
            _ => &[],
        }
    }

    /// Locate the first installed candidate for `kind`
    pub fn locate(kind: BootstrapKind) -> Option<(DistroTool, PathBuf)> {
        Self::candidates(kind)
            .iter()
            .find_map(|tool| which::which(tool.program()).ok().map(|p| (*tool, p)))
    }

    /// Argument lists to run, in order, to populate `rootfs`
    pub fn invocations(&self, def: &Definition, rootfs: &Path) -> Result<Vec<Vec<String>>> {
        let root = rootfs.display().to_string();
        let include = include_list(def);

        let plan = match self {
            Self::Debootstrap => {
                let suite = required_header(def, "osversion")?;
                let mirror = def.get("mirrorurl").unwrap_or(DEFAULT_DEBIAN_MIRROR);
                let mut args = vec!["--variant=minbase".to_string()];
                if !include.is_empty() {
                    args.push(format!("--include={}", include.join(",")));
                }
                args.extend([suite.to_string(), root, mirror.to_string()]);
                vec![args]
            }
            Self::Dnf | Self::Yum => {
                let mut args = vec![
                    "-y".to_string(),
                    format!("--installroot={}", root),
                    "--setopt=install_weak_deps=False".to_string(),
                ];
                if let Some(version) = def.get("osversion") {
                    args.push(format!("--releasever={}", version));
                }
                if let Some(mirror) = def.get("mirrorurl") {
                    args.push(format!("--repofrompath=imgbuild,{}", mirror));
                    args.push("--repo=imgbuild".to_string());
                }
                args.push("install".to_string());
                args.push("basesystem".to_string());
                args.extend(include);
                vec![args]
            }
            Self::Zypper => {
                let mirror = required_header(def, "mirrorurl")?;
                let base = vec![
                    "--non-interactive".to_string(),
                    "--root".to_string(),
                    root,
                ];
                let with = |extra: &[&str]| {
                    let mut args = base.clone();
                    args.extend(extra.iter().map(|s| s.to_string()));
                    args
                };
                let mut install = with(&["install", "--no-recommends", "aaa_base"]);
                install.extend(include);
                vec![
                    with(&["addrepo", mirror, "imgbuild"]),
                    with(&["--gpg-auto-import-keys", "refresh"]),
                    install,
                ]
            }
        };
        Ok(plan)
    }
}

impl fmt::Display for DistroTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// `Include` header split on whitespace and commas
fn include_list(def: &Definition) -> Vec<String> {
    def.get("include")
        .map(|v| {
            v.split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct DistroBackend {
    kind: BootstrapKind,
    ctx: FetchContext,
    program: Option<(DistroTool, PathBuf)>,
}

impl DistroBackend {
    pub fn new(kind: BootstrapKind, ctx: FetchContext) -> Self {
        Self {
            kind,
            ctx,
            program: None,
        }
    }

    /// Use a specific executable instead of searching PATH
    pub fn with_program(mut self, tool: DistroTool, path: impl Into<PathBuf>) -> Self {
        self.program = Some((tool, path.into()));
        self
    }

    fn resolve_program(&self) -> Result<(DistroTool, PathBuf)> {
        if let Some((tool, path)) = &self.program {
            if !path.exists() {
                return Err(Error::unpack(
                    UnpackCause::ToolMissing,
                    format!("{} not found at {}", tool, path.display()),
                ));
            }
            return Ok((*tool, path.clone()));
        }
        DistroTool::locate(self.kind).ok_or_else(|| {
            let names: Vec<_> = DistroTool::candidates(self.kind)
                .iter()
                .map(DistroTool::program)
                .collect();
            Error::unpack(
                UnpackCause::ToolMissing,
                format!("bootstrap {} needs {} on PATH", self.kind, names.join(" or ")),
            )
        })
    }

    fn run(&self, tool: DistroTool, program: &Path, args: &[String]) -> Result<()> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command(
            cmd,
            tool.program(),
            self.ctx.config.step_timeout(),
            Some(&self.ctx.cancel),
        )
        .map_err(|e| match e {
            ContainerError::Spawn(msg) => Error::unpack(UnpackCause::ToolMissing, msg),
            ContainerError::Cancelled => Error::Cancelled,
            ContainerError::TimedOut(after) => Error::fetch(
                FetchCause::Network,
                format!("{} timed out after {:?}", tool, after),
            ),
            ContainerError::Io(e) => Error::Io(e),
            other => Error::unpack(UnpackCause::WriteFailed, other.to_string()),
        })?;

        if !output.success() {
            return Err(Error::fetch(
                FetchCause::Network,
                format!(
                    "{} exited with code {}: {}",
                    tool,
                    output.code,
                    output.stderr_tail(STDERR_TAIL_LINES)
                ),
            ));
        }
        Ok(())
    }
}

impl SourceBackend for DistroBackend {
    fn kind(&self) -> BootstrapKind {
        self.kind
    }

    fn is_fused(&self) -> bool {
        true
    }

    fn fetch(&mut self, _def: &Definition, _token: &ElevatedToken) -> Result<()> {
        Ok(())
    }

    fn unpack(&mut self, _bundle: &mut Bundle, _token: &ElevatedToken) -> Result<()> {
        Ok(())
    }

    fn fetch_unpack(
        &mut self,
        def: &Definition,
        bundle: &mut Bundle,
        _token: &ElevatedToken,
    ) -> Result<()> {
        let (tool, program) = self.resolve_program()?;
        let rootfs = bundle.rootfs().to_path_buf();
        let plan = tool.invocations(def, &rootfs)?;

        for args in &plan {
            info!("Running {} {}", tool, args.join(" "));
            self.run(tool, &program, args)?;
        }
        ensure_mount_points(&rootfs)?;

        bundle.metadata_mut().record(
            "bootstrap",
            format!("{} {}", tool, def.get("osversion").unwrap_or_default()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::BuildConfig;
    use crate::privilege::PrivilegeCoordinator;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn def(pairs: &[(&str, &str)]) -> Definition {
        pairs
            .iter()
            .fold(Definition::builder(), |b, (k, v)| b.header(k, v))
            .build()
            .unwrap()
    }

    fn backend(kind: BootstrapKind) -> DistroBackend {
        DistroBackend::new(
            kind,
            FetchContext::from_config(BuildConfig::default(), CancelToken::new()),
        )
    }

    #[test]
    fn test_debootstrap_arguments() {
        let d = def(&[
            ("Bootstrap", "debootstrap"),
            ("OSVersion", "bookworm"),
            ("Include", "curl, ca-certificates vim"),
        ]);
        let plan = DistroTool::Debootstrap
            .invocations(&d, Path::new("/tmp/root"))
            .unwrap();
        assert_eq!(
            plan,
            vec![vec![
                "--variant=minbase".to_string(),
                "--include=curl,ca-certificates,vim".to_string(),
                "bookworm".to_string(),
                "/tmp/root".to_string(),
                DEFAULT_DEBIAN_MIRROR.to_string(),
            ]]
        );
    }

    #[test]
    fn test_debootstrap_requires_suite() {
        let d = def(&[("Bootstrap", "debootstrap")]);
        let err = DistroTool::Debootstrap
            .invocations(&d, Path::new("/r"))
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { cause: FetchCause::NotFound, .. }));
    }

    #[test]
    fn test_dnf_arguments() {
        let d = def(&[
            ("Bootstrap", "dnf"),
            ("OSVersion", "40"),
            ("MirrorURL", "http://mirror/fedora/40/"),
        ]);
        let plan = DistroTool::Dnf.invocations(&d, Path::new("/r")).unwrap();
        let args = &plan[0];
        assert!(args.contains(&"--installroot=/r".to_string()));
        assert!(args.contains(&"--releasever=40".to_string()));
        assert!(args.contains(&"--repofrompath=imgbuild,http://mirror/fedora/40/".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("basesystem"));
    }

    #[test]
    fn test_zypper_runs_three_steps() {
        let d = def(&[("Bootstrap", "zypper"), ("MirrorURL", "http://mirror/oss")]);
        let plan = DistroTool::Zypper.invocations(&d, Path::new("/r")).unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan[0].contains(&"addrepo".to_string()));
        assert!(plan[2].contains(&"aaa_base".to_string()));
    }

    #[test]
    fn test_missing_tool() {
        let d = def(&[("Bootstrap", "debootstrap"), ("OSVersion", "bookworm")]);
        let mut backend = backend(BootstrapKind::Debootstrap)
            .with_program(DistroTool::Debootstrap, "/nonexistent/debootstrap");
        let mut bundle = Bundle::create(None).unwrap();
        let err = PrivilegeCoordinator::unprivileged()
            .with_elevated(|t| backend.fetch_unpack(&d, &mut bundle, t))
            .unwrap_err();
        assert!(matches!(err, Error::Unpack { cause: UnpackCause::ToolMissing, .. }));
    }

    #[test]
    fn test_failing_tool_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("debootstrap");
        fs::write(&fake, "#!/bin/sh\necho 'E: mirror unreachable' >&2\nexit 1\n").unwrap();
        fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();

        let d = def(&[("Bootstrap", "debootstrap"), ("OSVersion", "bookworm")]);
        let mut backend = backend(BootstrapKind::Debootstrap).with_program(DistroTool::Debootstrap, &fake);
        let mut bundle = Bundle::create(None).unwrap();
        let err = PrivilegeCoordinator::unprivileged()
            .with_elevated(|t| backend.fetch_unpack(&d, &mut bundle, t))
            .unwrap_err();
        match err {
            Error::Fetch { cause, message } => {
                assert_eq!(cause, FetchCause::Network);
                assert!(message.contains("mirror unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_successful_tool_adds_mount_points() {
        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("debootstrap");
        fs::write(&fake, "#!/bin/sh\nmkdir -p \"$3/etc\"\n").unwrap();
        fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();

        let d = def(&[("Bootstrap", "debootstrap"), ("OSVersion", "bookworm")]);
        let mut backend = backend(BootstrapKind::Debootstrap).with_program(DistroTool::Debootstrap, &fake);
        let mut bundle = Bundle::create(None).unwrap();
        PrivilegeCoordinator::unprivileged()
            .with_elevated(|t| backend.fetch_unpack(&d, &mut bundle, t))
            .unwrap();
        assert!(bundle.rootfs().join("etc").is_dir());
        assert!(bundle.rootfs().join("proc").is_dir());
    }
}
