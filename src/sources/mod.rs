// src/sources/mod.rs

//! Source backends
//!
//! One backend per bootstrap kind, each implementing the fetch/unpack
//! contract of [`SourceBackend`]. Backends are built per build from the
//! [`BackendRegistry`], so anything they fetch lives only as long as the
//! backend instance. Both phases run inside the privilege scope and take the
//! [`ElevatedToken`] as proof.
//!
//! | Bootstrap              | Backend              | Phases |
//! |------------------------|----------------------|--------|
//! | `docker`, `oci`        | [`RegistryBackend`]  | fetch, unpack |
//! | `debootstrap`, `yum`, `zypper` | [`DistroBackend`] | fused |
//! | `busybox`              | [`BusyboxBackend`]   | fetch, unpack |
//! | `directory`            | [`DirectoryBackend`] | fetch, unpack |
//! | `archive`              | [`ArchiveBackend`]   | fetch, unpack |
//! | `scratch`              | [`ScratchBackend`]   | fused |

mod archive;
mod busybox;
mod directory;
mod distro;
mod oci;
mod registry;
mod scratch;
mod tarball;

pub use archive::ArchiveBackend;
pub use busybox::BusyboxBackend;
pub use directory::DirectoryBackend;
pub use distro::{DistroBackend, DistroTool};
pub use oci::OciLayout;
pub use registry::RegistryBackend;
pub use scratch::ScratchBackend;
pub use tarball::{TarOptions, extract_tar};

use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::definition::{BootstrapKind, Definition};
use crate::error::{Error, Result};
use crate::fetch::{CredentialProvider, LayoutResolver, Resolver, TokenCredentials};
use crate::privilege::ElevatedToken;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Mount points created for kinds that need them
pub const MOUNT_POINTS: &[&str] = &["dev", "proc", "sys", "tmp"];

/// Everything a backend may use to obtain material
#[derive(Clone)]
pub struct FetchContext {
    pub config: BuildConfig,
    pub resolver: Arc<dyn Resolver>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub cancel: CancelToken,
}

impl FetchContext {
    pub fn new(
        config: BuildConfig,
        resolver: Arc<dyn Resolver>,
        credentials: Arc<dyn CredentialProvider>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            resolver,
            credentials,
            cancel,
        }
    }

    /// Local layout resolver and token credentials from the environment
    pub fn from_config(config: BuildConfig, cancel: CancelToken) -> Self {
        let resolver = Arc::new(LayoutResolver::new(config.layout_store.clone()));
        let credentials = Arc::new(TokenCredentials::from_env(None));
        Self::new(config, resolver, credentials, cancel)
    }

    /// Backend-private scratch directory, removed when dropped
    pub fn scratch_dir(&self, prefix: &str) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match &self.config.tmp_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

/// Two-phase source contract
pub trait SourceBackend {
    /// Bootstrap kind this instance was created for
    fn kind(&self) -> BootstrapKind;

    /// Obtain raw material without touching the bundle
    fn fetch(&mut self, def: &Definition, token: &ElevatedToken) -> Result<()>;

    /// Materialize fetched material into `bundle.rootfs()`
    fn unpack(&mut self, bundle: &mut Bundle, token: &ElevatedToken) -> Result<()>;

    /// Whether fetch and unpack happen in one call
    fn is_fused(&self) -> bool {
        false
    }

    /// Fused entry point; the default runs both phases back to back
    fn fetch_unpack(
        &mut self,
        def: &Definition,
        bundle: &mut Bundle,
        token: &ElevatedToken,
    ) -> Result<()> {
        self.fetch(def, token)?;
        self.unpack(bundle, token)
    }
}

/// Creates a backend instance for one build
pub type BackendFactory = Arc<dyn Fn(BootstrapKind, &FetchContext) -> Box<dyn SourceBackend> + Send + Sync>;

/// Bootstrap kind to backend constructor
pub struct BackendRegistry {
    factories: HashMap<BootstrapKind, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry with all built-in backends
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        self.register(BootstrapKind::Docker, registry_backend);
        self.register(BootstrapKind::Oci, registry_backend);
        self.register(BootstrapKind::Debootstrap, distro_backend);
        self.register(BootstrapKind::Yum, distro_backend);
        self.register(BootstrapKind::Zypper, distro_backend);
        self.register(BootstrapKind::Busybox, |_, ctx| {
            Box::new(BusyboxBackend::new(ctx.clone()))
        });
        self.register(BootstrapKind::Directory, |_, _| Box::new(DirectoryBackend::new()));
        self.register(BootstrapKind::Archive, |_, _| Box::new(ArchiveBackend::new()));
        self.register(BootstrapKind::Scratch, |_, _| Box::new(ScratchBackend));
    }

    /// Register (or replace) the backend for `kind`
    pub fn register<F>(&mut self, kind: BootstrapKind, factory: F)
    where
        F: Fn(BootstrapKind, &FetchContext) -> Box<dyn SourceBackend> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn has(&self, kind: BootstrapKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn registered_kinds(&self) -> Vec<BootstrapKind> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Instantiate the backend for `kind`
    pub fn create(&self, kind: BootstrapKind, ctx: &FetchContext) -> Result<Box<dyn SourceBackend>> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| Error::UnknownBootstrap(kind.to_string()))?;
        Ok(factory(kind, ctx))
    }
}

fn registry_backend(kind: BootstrapKind, ctx: &FetchContext) -> Box<dyn SourceBackend> {
    Box::new(RegistryBackend::new(kind, ctx.clone()))
}

fn distro_backend(kind: BootstrapKind, ctx: &FetchContext) -> Box<dyn SourceBackend> {
    Box::new(DistroBackend::new(kind, ctx.clone()))
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Required header value, as a fetch error when absent
pub(crate) fn required_header<'a>(def: &'a Definition, key: &str) -> Result<&'a str> {
    def.get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::fetch(
                crate::error::FetchCause::NotFound,
                format!("bootstrap {} requires a {} header", def.bootstrap(), key),
            )
        })
}

/// Create the standard mount point directories if missing
pub(crate) fn ensure_mount_points(rootfs: &Path) -> std::io::Result<()> {
    for dir in MOUNT_POINTS {
        let path = rootfs.join(dir);
        if fs::symlink_metadata(&path).is_err() {
            fs::create_dir_all(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_cover_every_kind() {
        let registry = BackendRegistry::with_builtins();
        for kind in BootstrapKind::ALL {
            assert!(registry.has(kind), "missing backend for {}", kind);
        }
    }

    #[test]
    fn test_create_reports_kind() {
        let registry = BackendRegistry::with_builtins();
        let ctx = FetchContext::from_config(BuildConfig::default(), CancelToken::new());
        let backend = registry.create(BootstrapKind::Yum, &ctx).unwrap();
        assert_eq!(backend.kind(), BootstrapKind::Yum);
        assert!(backend.is_fused());
    }

    #[test]
    fn test_empty_registry_rejects() {
        let registry = BackendRegistry::new();
        let ctx = FetchContext::from_config(BuildConfig::default(), CancelToken::new());
        assert!(matches!(
            registry.create(BootstrapKind::Scratch, &ctx),
            Err(Error::UnknownBootstrap(_))
        ));
    }
}
