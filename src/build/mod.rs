// src/build/mod.rs

//! Build orchestration
//!
//! [`Orchestrator::build`] drives one definition through
//! `Created -> Fetching -> Unpacking -> RunningSteps -> Assembling -> Done`.
//! Backend and assembler selection happens before anything touches disk.
//! Each phase runs once; the first error moves the build to `Failed`, the
//! remaining phases are skipped and the bundle is torn down. Cancellation is
//! honored between phases and by running child processes.

mod state;

pub use state::{BuildState, PhaseLog, Transition};

use crate::assemble::{AssembleOptions, Assembler, AssemblerRegistry, ImageFormat};
use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::definition::{BootstrapKind, Definition};
use crate::error::{AssembleCause, Error, Result};
use crate::fetch::{CredentialProvider, LayoutResolver, Resolver, TokenCredentials};
use crate::privilege::PrivilegeCoordinator;
use crate::sources::{BackendRegistry, FetchContext, SourceBackend};
use crate::steps::{StepExecutor, StepOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Per-build settings
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub dest: PathBuf,
    pub format: ImageFormat,
    /// Keep the staging directory after the build
    pub keep_tmp: bool,
    /// Replace an existing destination
    pub force: bool,
    pub config: BuildConfig,
    pub cancel: CancelToken,
}

impl BuildOptions {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            format: ImageFormat::default(),
            keep_tmp: false,
            force: false,
            config: BuildConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_keep_tmp(mut self, keep: bool) -> Self {
        self.keep_tmp = keep;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of a successful build
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub artifact: PathBuf,
    pub format: ImageFormat,
    pub bootstrap: BootstrapKind,
    pub sections_run: usize,
    pub transitions: Vec<Transition>,
    /// Staging directory, when it was kept
    pub kept_bundle: Option<PathBuf>,
    /// Set when staging could not be fully removed
    pub teardown_error: Option<String>,
}

/// Terminal error of a build
#[derive(Error, Debug)]
#[error("build failed while {phase}: {error}")]
pub struct BuildFailure {
    pub phase: BuildState,
    #[source]
    pub error: Error,
    pub transitions: Vec<Transition>,
    pub kept_bundle: Option<PathBuf>,
    pub teardown_error: Option<String>,
}

impl BuildFailure {
    fn before_start(error: Error) -> Self {
        Self {
            phase: BuildState::Created,
            error,
            transitions: Vec::new(),
            kept_bundle: None,
            teardown_error: None,
        }
    }
}

/// Drives builds with a fixed set of backends, assemblers and privileges
pub struct Orchestrator {
    backends: BackendRegistry,
    assemblers: AssemblerRegistry,
    privilege: PrivilegeCoordinator,
    resolver: Option<Arc<dyn Resolver>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl Orchestrator {
    pub fn new(
        backends: BackendRegistry,
        assemblers: AssemblerRegistry,
        privilege: PrivilegeCoordinator,
    ) -> Self {
        Self {
            backends,
            assemblers,
            privilege,
            resolver: None,
            credentials: None,
        }
    }

    /// Built-in backends and assemblers with the process credentials
    pub fn for_process() -> Result<Self> {
        Ok(Self::new(
            BackendRegistry::with_builtins(),
            AssemblerRegistry::with_builtins(),
            PrivilegeCoordinator::for_process()?,
        ))
    }

    /// Use `resolver` instead of a layout resolver over the configured store
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use `credentials` instead of the environment token lookup
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn privilege(&self) -> &PrivilegeCoordinator {
        &self.privilege
    }

    fn fetch_context(&self, def: &Definition, opts: &BuildOptions) -> FetchContext {
        let resolver = self.resolver.clone().unwrap_or_else(|| {
            Arc::new(
                LayoutResolver::new(opts.config.layout_store.clone()).with_base(def.context_dir()),
            )
        });
        // read now, before any elevated scope
        let credentials = self
            .credentials
            .clone()
            .unwrap_or_else(|| Arc::new(TokenCredentials::from_env(None).preload()));
        FetchContext::new(opts.config.clone(), resolver, credentials, opts.cancel.clone())
    }

    /// Run one build to completion
    pub fn build(
        &self,
        def: &Definition,
        opts: &BuildOptions,
    ) -> std::result::Result<BuildReport, BuildFailure> {
        // selection and preflight: nothing has been written yet
        let kind = def.bootstrap_kind().map_err(BuildFailure::before_start)?;
        if !self.backends.has(kind) {
            return Err(BuildFailure::before_start(Error::UnknownBootstrap(
                kind.to_string(),
            )));
        }
        let assembler = self
            .assemblers
            .get(opts.format)
            .map_err(BuildFailure::before_start)?;
        let assemble_opts = AssembleOptions::from_config(&opts.config)
            .with_force(opts.force)
            .with_cancel(opts.cancel.clone());
        assembler
            .preflight(&assemble_opts)
            .map_err(BuildFailure::before_start)?;

        let ctx = self.fetch_context(def, opts);
        let mut backend = self
            .backends
            .create(kind, &ctx)
            .map_err(BuildFailure::before_start)?;
        let mut bundle =
            Bundle::create(opts.config.tmp_dir.as_deref()).map_err(BuildFailure::before_start)?;

        info!(
            "Building {} image from {} bootstrap into {}",
            opts.format,
            kind,
            opts.dest.display()
        );

        let mut log = PhaseLog::new();
        let outcome = self.run_phases(
            def,
            &mut bundle,
            backend.as_mut(),
            assembler,
            &assemble_opts,
            opts,
            &mut log,
        );
        // release anything the backend still holds before the bundle goes
        drop(backend);

        match outcome {
            Ok((artifact, sections_run)) => {
                let (kept_bundle, teardown_error) = self.teardown(bundle, opts.keep_tmp);
                Ok(BuildReport {
                    artifact,
                    format: opts.format,
                    bootstrap: kind,
                    sections_run,
                    transitions: log.into_transitions(),
                    kept_bundle,
                    teardown_error,
                })
            }
            Err(error) => {
                let phase = log.fail();
                warn!("Build failed while {}: {}", phase, error);
                let (kept_bundle, teardown_error) = self.teardown(bundle, opts.keep_tmp);
                Err(BuildFailure {
                    phase,
                    error,
                    transitions: log.into_transitions(),
                    kept_bundle,
                    teardown_error,
                })
            }
        }
    }

    /// Remove (or keep) the bundle with the privileges that populated it
    ///
    /// Returns the kept path and a description of anything left behind.
    fn teardown(&self, bundle: Bundle, keep: bool) -> (Option<PathBuf>, Option<String>) {
        let path = bundle.path().to_path_buf();
        match self.privilege.with_elevated(move |_| bundle.teardown(keep)) {
            Ok(kept) => (kept, None),
            Err(e) => {
                warn!("Failed to clean up staging directory {}: {}", path.display(), e);
                ((keep && path.exists()).then_some(path), Some(e.to_string()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phases(
        &self,
        def: &Definition,
        bundle: &mut Bundle,
        backend: &mut dyn SourceBackend,
        assembler: &dyn Assembler,
        assemble_opts: &AssembleOptions,
        opts: &BuildOptions,
        log: &mut PhaseLog,
    ) -> Result<(PathBuf, usize)> {
        let cancel = &opts.cancel;

        enter(log, cancel, BuildState::Fetching)?;
        if backend.is_fused() {
            debug!("{} fetches and unpacks in one step", backend.kind());
            enter(log, cancel, BuildState::Unpacking)?;
            self.privilege
                .with_elevated(|token| backend.fetch_unpack(def, bundle, token))?;
        } else {
            self.privilege
                .with_elevated(|token| backend.fetch(def, token))?;
            enter(log, cancel, BuildState::Unpacking)?;
            self.privilege
                .with_elevated(|token| backend.unpack(bundle, token))?;
        }

        enter(log, cancel, BuildState::RunningSteps)?;
        let executor = StepExecutor::new(StepOptions::from_config(&opts.config), cancel.clone());
        let sections_run = executor.run(def, bundle, &self.privilege)?;

        enter(log, cancel, BuildState::Assembling)?;
        let embedded = bundle.write_metadata().map_err(|e| {
            Error::assemble(AssembleCause::WriteFailed, format!("writing metadata: {}", e))
        })?;
        if embedded {
            debug!("Embedded metadata into {}", bundle.rootfs().display());
        }
        let artifact = assembler.assemble(bundle, &opts.dest, assemble_opts)?;

        log.advance();
        info!("Built {}", artifact.display());
        Ok((artifact, sections_run))
    }
}

/// Advance to `expected` unless the build was cancelled
fn enter(log: &mut PhaseLog, cancel: &CancelToken, expected: BuildState) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let entered = log.advance();
    debug_assert_eq!(entered, Some(expected));
    Ok(())
}

/// Convenience wrapper: parse a definition file and build it
pub fn build_file(
    orchestrator: &Orchestrator,
    path: &Path,
    opts: &BuildOptions,
) -> std::result::Result<BuildReport, BuildFailure> {
    let def = Definition::from_file(path)
        .map_err(|e| BuildFailure::before_start(Error::MalformedDefinition(e)))?;
    orchestrator.build(&def, opts)
}
