// src/cli/mod.rs
//! CLI definitions for imgbuild
//!
//! Argument parsing only; the handlers live in the `commands` module.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "imgbuild")]
#[command(author = "imgbuild contributors")]
#[command(version)]
#[command(about = "Build container filesystem images from definition files", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Show debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Show trace output
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Only show warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Only show errors
    #[arg(short, long, global = true)]
    pub silent: bool,

    /// Configuration file (default: $XDG_CONFIG_HOME/imgbuild/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl GlobalArgs {
    /// Log filter directive implied by the verbosity flags
    pub fn log_level(&self) -> &'static str {
        if self.silent {
            "error"
        } else if self.quiet {
            "warn"
        } else if self.debug {
            "trace"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build an image from a definition file
    Build(BuildArgs),

    /// List the external tools this host provides
    Check,
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Path to the definition file
    pub definition: PathBuf,

    /// Where to write the image
    pub dest: PathBuf,

    /// Output format: image, sandbox, legacy
    #[arg(short, long, default_value = "image")]
    pub format: String,

    /// Shorthand for --format sandbox
    #[arg(long, conflicts_with = "format")]
    pub sandbox: bool,

    /// Keep the staging directory after the build
    #[arg(long)]
    pub keep_tmp: bool,

    /// Overwrite an existing destination
    #[arg(long)]
    pub force: bool,

    /// Never switch privileges, even when running as root
    #[arg(long)]
    pub unprivileged: bool,

    /// Parent directory for staging
    #[arg(long, value_name = "DIR")]
    pub tmpdir: Option<PathBuf>,

    /// Registry token file
    #[arg(long, value_name = "FILE")]
    pub tokenfile: Option<PathBuf>,

    /// Directory of local OCI layouts for bare image references
    #[arg(long, value_name = "DIR")]
    pub layout_store: Option<PathBuf>,
}

impl BuildArgs {
    /// Requested format name, honoring the --sandbox shorthand
    pub fn format_name(&self) -> &str {
        if self.sandbox { "sandbox" } else { &self.format }
    }
}
