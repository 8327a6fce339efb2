// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use imgbuild::{BuildFailure, ErrorCategory};
use std::process::ExitCode;
use tracing::error;

/// Exit code for a failed command
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(failure) = err.downcast_ref::<BuildFailure>() {
        return failure.error.category().exit_code();
    }
    if let Some(err) = err.downcast_ref::<imgbuild::Error>() {
        return err.category().exit_code();
    }
    ErrorCategory::Other.exit_code()
}

/// Whether the privilege state can no longer be trusted
fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BuildFailure>()
        .map(|f| f.error.is_fatal_for_process())
        .or_else(|| err.downcast_ref::<imgbuild::Error>().map(imgbuild::Error::is_fatal_for_process))
        .unwrap_or(false)
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Some(Commands::Build(args)) => commands::cmd_build(&cli.global, args),
        Some(Commands::Check) => commands::cmd_check(),
        None => {
            println!("imgbuild v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'imgbuild --help' for usage information");
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.global.log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            if is_fatal(&err) {
                eprintln!("imgbuild: privileges could not be restored, aborting");
                std::process::abort();
            }
            ExitCode::from(exit_code(&err) as u8)
        }
    }
}
