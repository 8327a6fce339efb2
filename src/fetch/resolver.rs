// src/fetch/resolver.rs

//! Local OCI layout resolution

use super::{ResolveError, Resolver};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolves references against the filesystem
///
/// Accepted forms:
/// - `oci:<path>` / `oci-archive:<path>` / a plain existing path
/// - `[docker://]name[:tag]`, looked up as `<store>/<name>/<tag>` (a layout
///   directory) or `<store>/<name>/<tag>.tar`
#[derive(Debug, Clone, Default)]
pub struct LayoutResolver {
    store: Option<PathBuf>,
    base: PathBuf,
}

impl LayoutResolver {
    pub fn new(store: Option<PathBuf>) -> Self {
        Self {
            store,
            base: PathBuf::from("."),
        }
    }

    /// Directory relative paths are resolved against
    pub fn with_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = base.into();
        self
    }

    fn local_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        }
    }
}

impl Resolver for LayoutResolver {
    fn resolve(&self, reference: &str, token: Option<&str>) -> Result<PathBuf, ResolveError> {
        debug!(
            "Resolving {} ({})",
            reference,
            if token.is_some() { "with credential" } else { "anonymous" }
        );

        if let Some(path) = reference
            .strip_prefix("oci:")
            .or_else(|| reference.strip_prefix("oci-archive:"))
        {
            let path = self.local_path(path);
            return if path.exists() {
                Ok(path)
            } else {
                Err(ResolveError::NotFound(path.display().to_string()))
            };
        }

        let plain = self.local_path(reference);
        if plain.exists() {
            return Ok(plain);
        }

        let bare = reference.strip_prefix("docker://").unwrap_or(reference);
        let (name, tag) = split_reference(bare);

        let Some(store) = &self.store else {
            return Err(ResolveError::NotFound(format!(
                "{} (no layout store configured for remote references)",
                reference
            )));
        };

        let dir = store.join(name).join(tag);
        if dir.join("index.json").is_file() {
            return Ok(dir);
        }
        let archive = store.join(name).join(format!("{}.tar", tag));
        if archive.is_file() {
            return Ok(archive);
        }

        Err(ResolveError::NotFound(format!(
            "{} not present in {}",
            reference,
            store.display()
        )))
    }
}

/// Split `name[:tag|@digest]`; the tag defaults to `latest`
fn split_reference(reference: &str) -> (&str, &str) {
    if let Some((name, digest)) = reference.split_once('@') {
        return (name, digest);
    }
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(i) => (&reference[..last_slash + i], &reference[last_slash + i + 1..]),
        None => (reference, "latest"),
    }
}

/// Registry host a reference points at (`docker.io` when implicit)
pub fn registry_host(reference: &str) -> &str {
    let bare = reference.strip_prefix("docker://").unwrap_or(reference);
    match bare.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first
        }
        _ => "docker.io",
    }
}
