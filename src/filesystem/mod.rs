// src/filesystem/mod.rs

//! Filesystem helpers shared by backends, steps and assemblers

pub mod copy;
pub mod path;

pub use copy::{copy_path, copy_tree, move_tree};
pub use path::{resolve_in_root, safe_join, sanitize_path};
