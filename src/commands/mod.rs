// src/commands/mod.rs
//! Command handlers for the imgbuild CLI

mod build;
mod check;

pub use build::cmd_build;
pub use check::cmd_check;
