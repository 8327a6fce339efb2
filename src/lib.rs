// src/lib.rs

//! imgbuild: container filesystem images from definition files
//!
//! A build takes a parsed [`Definition`], fetches and unpacks its base
//! through a source backend, runs the definition's sections against the
//! staged root filesystem, and assembles the result into the requested
//! format.
//!
//! # Architecture
//!
//! - Definition: immutable header plus ordered sections
//! - Bundle: the one owned staging directory of a build
//! - Backends and assemblers: closed sets dispatched through registries
//! - Privileges: scoped elevation handed out as a capability token
//! - Orchestrator: the state machine tying the phases together

pub mod assemble;
pub mod build;
pub mod bundle;
pub mod cancel;
pub mod compression;
pub mod config;
pub mod container;
pub mod definition;
mod error;
pub mod fetch;
pub mod filesystem;
pub mod privilege;
pub mod sources;
pub mod steps;
pub mod tools;

pub use assemble::{AssembleOptions, Assembler, AssemblerRegistry, ImageFormat};
pub use build::{BuildFailure, BuildOptions, BuildReport, BuildState, Orchestrator};
pub use bundle::{Bundle, BundleMetadata};
pub use cancel::CancelToken;
pub use config::BuildConfig;
pub use definition::{BootstrapKind, Definition, DefinitionError, SectionKind};
pub use error::{
    AssembleCause, Error, ErrorCategory, FetchCause, FileCopyCause, PrivilegeCause, Result,
    StepCause, UnpackCause,
};
pub use privilege::{ElevatedToken, PrivilegeCoordinator, PrivilegeLevel, PrivilegeOps};
pub use sources::{BackendRegistry, FetchContext, SourceBackend};
