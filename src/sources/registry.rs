// src/sources/registry.rs

//! Registry image backend (`docker`, `oci`)

use super::oci::OciLayout;
use super::{FetchContext, SourceBackend, required_header};
use crate::bundle::Bundle;
use crate::definition::{BootstrapKind, Definition};
use crate::error::{Error, FetchCause, Result};
use crate::fetch::registry_host;
use crate::privilege::ElevatedToken;
use tracing::{debug, info};

pub struct RegistryBackend {
    kind: BootstrapKind,
    ctx: FetchContext,
    reference: Option<String>,
    layout: Option<OciLayout>,
}

impl RegistryBackend {
    pub fn new(kind: BootstrapKind, ctx: FetchContext) -> Self {
        Self {
            kind,
            ctx,
            reference: None,
            layout: None,
        }
    }
}

impl SourceBackend for RegistryBackend {
    fn kind(&self) -> BootstrapKind {
        self.kind
    }

    fn fetch(&mut self, def: &Definition, _token: &ElevatedToken) -> Result<()> {
        let reference = required_header(def, "from")?.to_string();
        let host = registry_host(&reference);
        let token = self.ctx.credentials.credential_for(host)?;
        debug!(
            "Fetching {} from {} ({})",
            reference,
            host,
            if token.is_some() { "authenticated" } else { "anonymous" }
        );

        let path = self.ctx.resolver.resolve(&reference, token.as_deref())?;
        let scratch = if path.is_dir() {
            None
        } else {
            Some(self.ctx.scratch_dir("imgbuild-layout-")?)
        };
        let layout = OciLayout::open(&path, scratch)?;
        info!("Resolved {} to {}", reference, path.display());

        self.reference = Some(reference);
        self.layout = Some(layout);
        Ok(())
    }

    fn unpack(&mut self, bundle: &mut Bundle, _token: &ElevatedToken) -> Result<()> {
        // dropping the layout removes any extracted archive copy
        let layout = self.layout.take().ok_or_else(|| {
            Error::fetch(FetchCause::NotFound, "unpack called before a successful fetch")
        })?;
        let reference = self.reference.take().unwrap_or_default();

        let rootfs = bundle.rootfs().to_path_buf();
        let layers = layout.apply(&rootfs, bundle.metadata_mut())?;
        bundle
            .metadata_mut()
            .record("unpack", format!("{} ({} layers)", reference, layers));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::oci::test_support::{layer, write_layout};
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::BuildConfig;
    use crate::error::UnpackCause;
    use crate::fetch::{CredentialProvider, LayoutResolver, ResolveError, Resolver};
    use crate::privilege::PrivilegeCoordinator;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct RecordingResolver {
        inner: LayoutResolver,
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    impl Resolver for RecordingResolver {
        fn resolve(&self, reference: &str, token: Option<&str>) -> std::result::Result<PathBuf, ResolveError> {
            self.seen
                .lock()
                .unwrap()
                .push((reference.to_string(), token.map(str::to_string)));
            self.inner.resolve(reference, token)
        }
    }

    struct FixedToken;

    impl CredentialProvider for FixedToken {
        fn credential_for(
            &self,
            _target: &str,
        ) -> std::result::Result<Option<String>, crate::fetch::AuthError> {
            Ok(Some("secret".to_string()))
        }
    }

    fn definition(from: &str) -> Definition {
        Definition::builder()
            .header("Bootstrap", "docker")
            .header("From", from)
            .build()
            .unwrap()
    }

    #[test]
    fn test_fetch_and_unpack_from_store() {
        let store = TempDir::new().unwrap();
        let image_dir = store.path().join("library/demo/1.0");
        std::fs::create_dir_all(&image_dir).unwrap();
        write_layout(
            &image_dir,
            &[layer(&[("etc/demo", b"1")])],
            &serde_json::json!({"config": {"Labels": {"v": "1.0"}}}),
        );

        let resolver = Arc::new(RecordingResolver {
            inner: LayoutResolver::new(Some(store.path().to_path_buf())),
            seen: Mutex::new(Vec::new()),
        });
        let ctx = FetchContext::new(
            BuildConfig::default(),
            resolver.clone(),
            Arc::new(FixedToken),
            CancelToken::new(),
        );
        let mut backend = RegistryBackend::new(BootstrapKind::Docker, ctx);
        let mut bundle = Bundle::create(None).unwrap();
        let coordinator = PrivilegeCoordinator::unprivileged();

        coordinator
            .with_elevated(|token| {
                backend.fetch(&definition("library/demo:1.0"), token)?;
                backend.unpack(&mut bundle, token)
            })
            .unwrap();

        assert!(bundle.rootfs().join("etc/demo").exists());
        assert_eq!(bundle.metadata().labels.get("v").map(String::as_str), Some("1.0"));
        let seen = resolver.seen.lock().unwrap();
        assert_eq!(seen[0], ("library/demo:1.0".to_string(), Some("secret".to_string())));
    }

    #[test]
    fn test_missing_reference_is_not_found() {
        let ctx = FetchContext::from_config(BuildConfig::default(), CancelToken::new());
        let mut backend = RegistryBackend::new(BootstrapKind::Oci, ctx);
        let coordinator = PrivilegeCoordinator::unprivileged();
        let err = coordinator
            .with_elevated(|token| backend.fetch(&definition("nothing/here:1"), token))
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { cause: FetchCause::NotFound, .. }));
    }

    #[test]
    fn test_layout_without_index_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let ctx = FetchContext::from_config(BuildConfig::default(), CancelToken::new());
        let mut backend = RegistryBackend::new(BootstrapKind::Oci, ctx);
        let coordinator = PrivilegeCoordinator::unprivileged();
        let reference = format!("oci:{}", dir.path().display());
        let err = coordinator
            .with_elevated(|token| backend.fetch(&definition(&reference), token))
            .unwrap_err();
        assert!(matches!(err, Error::Unpack { cause: UnpackCause::Corrupt, .. }));
    }
}
