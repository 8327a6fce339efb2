// src/steps/mod.rs

//! Step executor
//!
//! Runs a definition's sections in file order against an unpacked bundle.
//! `%setup`, `%post` and `%files` mutate the filesystem and run inside a
//! privilege scope; the metadata sections only update the bundle metadata.
//! The first failing section stops the run.

mod files;

pub use files::copy_entry;

use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::container::{ContainerConfig, ContainerError, ProcessOutput, Sandbox, run_host_script};
use crate::definition::{DEFAULT_INTERPRETER, Definition, Section, SectionKind};
use crate::error::{Error, Result, StepCause};
use crate::privilege::{ElevatedToken, PrivilegeCoordinator};
use std::time::Duration;
use tracing::{debug, info};

const STDERR_TAIL_LINES: usize = 10;

/// How script sections are executed
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Chroot `%post` into the rootfs inside a private mount namespace
    pub isolate: bool,
    /// Fail when isolation was requested but is unavailable
    pub require_isolation: bool,
    pub timeout: Duration,
}

impl StepOptions {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            isolate: config.isolate_steps,
            require_isolation: config.require_isolation,
            timeout: config.step_timeout(),
        }
    }
}

impl Default for StepOptions {
    fn default() -> Self {
        Self::from_config(&BuildConfig::default())
    }
}

pub struct StepExecutor {
    options: StepOptions,
    cancel: CancelToken,
}

impl StepExecutor {
    pub fn new(options: StepOptions, cancel: CancelToken) -> Self {
        Self { options, cancel }
    }

    /// Run every section of `def` in order, returning how many ran
    pub fn run(
        &self,
        def: &Definition,
        bundle: &mut Bundle,
        privilege: &PrivilegeCoordinator,
    ) -> Result<usize> {
        let mut executed = 0;
        for section in def.sections() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let kind = section.kind();
            if kind.is_privileged() {
                privilege.with_elevated(|token| self.run_privileged(def, section, bundle, token))?;
            } else {
                record_metadata(section, bundle);
            }

            bundle
                .metadata_mut()
                .record("steps", describe(section));
            executed += 1;
        }
        info!("Ran {} sections", executed);
        Ok(executed)
    }

    fn run_privileged(
        &self,
        def: &Definition,
        section: &Section,
        bundle: &mut Bundle,
        token: &ElevatedToken,
    ) -> Result<()> {
        match section.kind() {
            SectionKind::Setup => self.run_setup(def, section, bundle, token),
            SectionKind::Post => self.run_post(section, bundle, token),
            SectionKind::Files => {
                for entry in section.files() {
                    if self.cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    copy_entry(def, entry, bundle.rootfs(), token)?;
                }
                Ok(())
            }
            other => {
                debug!("%{} needs no privileges", other);
                record_metadata(section, bundle);
                Ok(())
            }
        }
    }

    /// `%setup` runs on the host with the rootfs and context exported
    fn run_setup(
        &self,
        def: &Definition,
        section: &Section,
        bundle: &Bundle,
        _token: &ElevatedToken,
    ) -> Result<()> {
        let rootfs = bundle.rootfs().to_string_lossy();
        let context = def.context_dir().to_string_lossy();
        let env = [
            ("IMGBUILD_ROOTFS", rootfs.as_ref()),
            ("IMGBUILD_CONTEXT", context.as_ref()),
        ];
        info!("Running %setup");
        let output = run_host_script(
            "setup",
            section.interpreter(),
            section.text(),
            &env,
            def.context_dir(),
            self.options.timeout,
            Some(&self.cancel),
        );
        check_output("setup", output)
    }

    /// `%post` runs inside the rootfs
    fn run_post(&self, section: &Section, bundle: &Bundle, _token: &ElevatedToken) -> Result<()> {
        let config = if self.options.isolate {
            ContainerConfig::for_build(self.options.timeout)
                .with_required_isolation(self.options.require_isolation)
        } else {
            ContainerConfig::host(self.options.timeout)
        };
        let sandbox = Sandbox::new(config, bundle.rootfs());
        info!("Running %post");
        let output = sandbox.execute(
            "post",
            section.interpreter(),
            section.text(),
            &[],
            Some(&self.cancel),
        );
        check_output("post", output)
    }
}

/// Translate a process result into a step result
fn check_output(section: &str, output: std::result::Result<ProcessOutput, ContainerError>) -> Result<()> {
    let output = output.map_err(|e| {
        let cause = match &e {
            ContainerError::Spawn(_) | ContainerError::Io(_) => StepCause::SpawnFailed,
            ContainerError::TimedOut(_) => StepCause::TimedOut,
            ContainerError::Cancelled => StepCause::Cancelled,
            ContainerError::IsolationUnavailable(_) => StepCause::IsolationUnavailable,
        };
        Error::step(section, cause, e.to_string())
    })?;

    if !output.success() {
        return Err(Error::step(
            section,
            StepCause::ScriptFailed { code: output.code },
            output.stderr_tail(STDERR_TAIL_LINES),
        ));
    }
    Ok(())
}

/// Apply a metadata-only section to the bundle
fn record_metadata(section: &Section, bundle: &mut Bundle) {
    let meta = bundle.metadata_mut();
    match section.kind() {
        SectionKind::Environment => meta.append_environment(section.text()),
        SectionKind::Labels => {
            for (key, value) in section.labels() {
                meta.set_label(key, value);
            }
        }
        SectionKind::Runscript => meta.runscript = Some(script_body(section)),
        SectionKind::Test => meta.test = Some(script_body(section)),
        SectionKind::Help => meta.help = Some(format!("{}\n", section.text())),
        SectionKind::Setup | SectionKind::Post | SectionKind::Files => {}
    }
}

/// Script text with a shebang for a non-default interpreter
fn script_body(section: &Section) -> String {
    match section.interpreter() {
        DEFAULT_INTERPRETER => section.text().to_string(),
        interpreter => format!("#!{}\n{}", interpreter, section.text()),
    }
}

fn describe(section: &Section) -> String {
    match section.kind() {
        SectionKind::Files => format!("%files ({} entries)", section.files().len()),
        kind if section.args().is_empty() => format!("%{}", kind),
        kind => format!("%{} {}", kind, section.args()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FileCopyCause;
    use std::fs;
    use tempfile::TempDir;

    fn host_executor() -> StepExecutor {
        let options = StepOptions {
            isolate: false,
            require_isolation: false,
            timeout: Duration::from_secs(30),
        };
        StepExecutor::new(options, CancelToken::new())
    }

    fn run(def: &Definition) -> (Result<usize>, Bundle) {
        let mut bundle = Bundle::create(None).unwrap();
        let result = host_executor().run(def, &mut bundle, &PrivilegeCoordinator::unprivileged());
        (result, bundle)
    }

    #[test]
    fn test_sections_run_in_order() {
        let context = TempDir::new().unwrap();
        let def = Definition::builder()
            .header("Bootstrap", "scratch")
            .section(SectionKind::Setup, "", "echo setup > \"$IMGBUILD_ROOTFS/order\"")
            .section(SectionKind::Post, "", "echo post >> order")
            .section(SectionKind::Environment, "", "export A=1")
            .section(SectionKind::Labels, "", "Author someone\nVersion 1.0")
            .section(SectionKind::Runscript, "-c /bin/bash", "echo run")
            .section(SectionKind::Help, "", "usage text")
            .context_dir(context.path())
            .build()
            .unwrap();

        let (result, bundle) = run(&def);
        assert_eq!(result.unwrap(), 6);
        assert_eq!(
            fs::read_to_string(bundle.rootfs().join("order")).unwrap(),
            "setup\npost\n"
        );

        let meta = bundle.metadata();
        assert_eq!(meta.environment, "export A=1\n");
        assert_eq!(meta.labels.get("Version").map(String::as_str), Some("1.0"));
        assert_eq!(meta.runscript.as_deref(), Some("#!/bin/bash\necho run"));
        assert_eq!(meta.help.as_deref(), Some("usage text\n"));
        assert_eq!(meta.history.len(), 6);
    }

    #[test]
    fn test_setup_sees_context() {
        let context = TempDir::new().unwrap();
        fs::write(context.path().join("seed"), "x").unwrap();
        let def = Definition::builder()
            .header("Bootstrap", "scratch")
            .section(
                SectionKind::Setup,
                "",
                "cp \"$IMGBUILD_CONTEXT/seed\" \"$IMGBUILD_ROOTFS/seed\"",
            )
            .context_dir(context.path())
            .build()
            .unwrap();
        let (result, bundle) = run(&def);
        result.unwrap();
        assert!(bundle.rootfs().join("seed").is_file());
    }

    #[test]
    fn test_failing_post_stops_later_sections() {
        let def = Definition::builder()
            .header("Bootstrap", "scratch")
            .section(SectionKind::Post, "", "echo broken >&2\nexit 3")
            .section(SectionKind::Post, "", "touch never")
            .build()
            .unwrap();

        let (result, bundle) = run(&def);
        match result.unwrap_err() {
            Error::StepExecution {
                section,
                cause,
                message,
            } => {
                assert_eq!(section, "post");
                assert_eq!(cause, StepCause::ScriptFailed { code: 3 });
                assert!(message.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!bundle.rootfs().join("never").exists());
    }

    #[test]
    fn test_missing_interpreter_is_spawn_failure() {
        let def = Definition::builder()
            .header("Bootstrap", "scratch")
            .section(SectionKind::Post, "-c /nonexistent/shell", "true")
            .build()
            .unwrap();
        let (result, _bundle) = run(&def);
        assert!(matches!(
            result,
            Err(Error::StepExecution { cause: StepCause::SpawnFailed, .. })
        ));
    }

    #[test]
    fn test_timeout() {
        let options = StepOptions {
            isolate: false,
            require_isolation: false,
            timeout: Duration::from_millis(300),
        };
        let def = Definition::builder()
            .header("Bootstrap", "scratch")
            .section(SectionKind::Post, "", "sleep 30")
            .build()
            .unwrap();
        let mut bundle = Bundle::create(None).unwrap();
        let err = StepExecutor::new(options, CancelToken::new())
            .run(&def, &mut bundle, &PrivilegeCoordinator::unprivileged())
            .unwrap_err();
        assert!(matches!(err, Error::StepExecution { cause: StepCause::TimedOut, .. }));
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let def = Definition::builder()
            .header("Bootstrap", "scratch")
            .section(SectionKind::Post, "", "touch ran")
            .build()
            .unwrap();
        let mut bundle = Bundle::create(None).unwrap();
        let err = StepExecutor::new(StepOptions::default(), cancel)
            .run(&def, &mut bundle, &PrivilegeCoordinator::unprivileged())
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!bundle.rootfs().join("ran").exists());
    }

    #[test]
    fn test_files_missing_source() {
        let context = TempDir::new().unwrap();
        let def = Definition::builder()
            .header("Bootstrap", "scratch")
            .files([("missing.txt", "/missing.txt")])
            .context_dir(context.path())
            .build()
            .unwrap();
        let (result, _bundle) = run(&def);
        assert!(matches!(
            result,
            Err(Error::FileCopy { cause: FileCopyCause::NotFound, .. })
        ));
    }

    #[test]
    fn test_default_options_never_run_post_on_host() {
        if crate::container::isolation_available() {
            return;
        }
        let def = Definition::builder()
            .header("Bootstrap", "scratch")
            .section(SectionKind::Post, "", "touch \"$IMGBUILD_ROOTFS/ran\"")
            .build()
            .unwrap();
        let mut bundle = Bundle::create(None).unwrap();
        let err = StepExecutor::new(StepOptions::default(), CancelToken::new())
            .run(&def, &mut bundle, &PrivilegeCoordinator::unprivileged())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StepExecution { cause: StepCause::IsolationUnavailable, .. }
        ));
        assert!(!bundle.rootfs().join("ran").exists());
    }

    #[test]
    fn test_isolation_required_but_unavailable() {
        if crate::container::isolation_available() {
            return;
        }
        let options = StepOptions {
            isolate: true,
            require_isolation: true,
            timeout: Duration::from_secs(5),
        };
        let def = Definition::builder()
            .header("Bootstrap", "scratch")
            .section(SectionKind::Post, "", "true")
            .build()
            .unwrap();
        let mut bundle = Bundle::create(None).unwrap();
        let err = StepExecutor::new(options, CancelToken::new())
            .run(&def, &mut bundle, &PrivilegeCoordinator::unprivileged())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StepExecution { cause: StepCause::IsolationUnavailable, .. }
        ));
    }
}
