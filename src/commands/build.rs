// src/commands/build.rs

//! `imgbuild build`

use crate::cli::{BuildArgs, GlobalArgs};
use anyhow::{Context, Result};
use imgbuild::fetch::TokenCredentials;
use imgbuild::{
    AssemblerRegistry, BackendRegistry, BuildConfig, BuildFailure, BuildOptions, CancelToken,
    ImageFormat, Orchestrator, PrivilegeCoordinator,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Layer CLI flags over the loaded configuration
fn effective_config(global: &GlobalArgs, args: &BuildArgs) -> Result<BuildConfig> {
    let mut config = BuildConfig::load(global.config.as_deref())?;
    if let Some(dir) = &args.tmpdir {
        config = config.with_tmp_dir(dir);
    }
    if let Some(store) = &args.layout_store {
        config = config.with_layout_store(store);
    }
    debug!("Effective configuration: {:?}", config);
    Ok(config)
}

/// Set up privileges; any setuid-root effective uid is dropped here
fn orchestrator(args: &BuildArgs) -> Result<Orchestrator> {
    let privilege = if args.unprivileged {
        PrivilegeCoordinator::unprivileged_process()?
    } else {
        PrivilegeCoordinator::for_process()?
    };
    Ok(Orchestrator::new(
        BackendRegistry::with_builtins(),
        AssemblerRegistry::with_builtins(),
        privilege,
    ))
}

/// Build one definition file into `args.dest`
pub fn cmd_build(global: &GlobalArgs, args: &BuildArgs) -> Result<()> {
    let format: ImageFormat = args.format_name().parse()?;

    // user-supplied files are only opened once privileges are dropped
    let orchestrator = orchestrator(args)?;
    let config = effective_config(global, args)?;
    let credentials = TokenCredentials::from_env(args.tokenfile.clone()).preload();
    let orchestrator = orchestrator.with_credentials(Arc::new(credentials));
    let cancel = CancelToken::with_signals().context("Failed to install signal handlers")?;

    let opts = BuildOptions::new(&args.dest)
        .with_format(format)
        .with_keep_tmp(args.keep_tmp)
        .with_force(args.force)
        .with_config(config)
        .with_cancel(cancel);

    info!("Building {} from {}", args.dest.display(), args.definition.display());
    let report = imgbuild::build::build_file(&orchestrator, &args.definition, &opts)
        .inspect_err(report_leftovers)?;

    println!("Built {} image: {}", report.format, report.artifact.display());
    println!("  Bootstrap: {}", report.bootstrap);
    println!("  Sections run: {}", report.sections_run);
    for transition in &report.transitions {
        debug!(
            "{} -> {} after {}ms",
            transition.from, transition.to, transition.duration_ms
        );
    }
    if let Some(kept) = &report.kept_bundle {
        println!("  Staging kept at: {}", kept.display());
    }
    if let Some(error) = &report.teardown_error {
        eprintln!("Warning: staging cleanup incomplete: {}", error);
    }
    Ok(())
}

fn report_leftovers(failure: &BuildFailure) {
    if let Some(kept) = &failure.kept_bundle {
        eprintln!("Staging kept at: {}", kept.display());
    }
    if let Some(error) = &failure.teardown_error {
        eprintln!("Warning: staging cleanup incomplete: {}", error);
    }
}
