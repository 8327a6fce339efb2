// src/sources/oci.rs

//! OCI image layout reading
//!
//! A layout is a directory holding `index.json` and `blobs/<alg>/<hex>`, or
//! a tar archive of one. Manifests are resolved through at most one nested
//! image index. Every blob read is checked against its SHA-256 digest.

use super::tarball::{TarOptions, extract_tar};
use crate::bundle::{BundleMetadata, shell_quote};
use crate::compression::open_decoded;
use crate::error::{Error, Result, UnpackCause};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const PREFERRED_OS: &str = "linux";
const PREFERRED_ARCH: &str = "amd64";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
}

#[derive(Debug, Deserialize)]
struct Index {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: Option<RuntimeConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RuntimeConfig {
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
}

fn corrupt(message: impl Into<String>) -> Error {
    Error::unpack(UnpackCause::Corrupt, message)
}

/// An opened image layout
#[derive(Debug)]
pub struct OciLayout {
    root: PathBuf,
    // Holds the extracted copy when the layout came as an archive
    _extracted: Option<TempDir>,
}

impl OciLayout {
    /// Open a layout directory, or extract a layout archive into `scratch`
    pub fn open(path: &Path, scratch: Option<TempDir>) -> Result<Self> {
        if path.is_dir() {
            return Self::from_dir(path.to_path_buf(), None);
        }

        let scratch = match scratch {
            Some(dir) => dir,
            None => TempDir::new()?,
        };
        debug!("Extracting layout archive {}", path.display());
        let reader = open_decoded(path).map_err(|e| corrupt(e.to_string()))?;
        extract_tar(reader, scratch.path(), TarOptions::default())?;
        let root = scratch.path().to_path_buf();
        Self::from_dir(root, Some(scratch))
    }

    fn from_dir(root: PathBuf, extracted: Option<TempDir>) -> Result<Self> {
        if !root.join("index.json").is_file() {
            return Err(corrupt(format!(
                "{} is not an OCI image layout (no index.json)",
                root.display()
            )));
        }
        Ok(Self {
            root,
            _extracted: extracted,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob a digest names
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (alg, hex) = digest
            .split_once(':')
            .ok_or_else(|| corrupt(format!("malformed digest: {}", digest)))?;
        if alg.is_empty() || hex.is_empty() || hex.contains('/') || alg.contains('/') {
            return Err(corrupt(format!("malformed digest: {}", digest)));
        }
        Ok(self.root.join("blobs").join(alg).join(hex))
    }

    /// Check a blob's content against its digest
    pub fn verify_blob(&self, desc: &Descriptor) -> Result<PathBuf> {
        let path = self.blob_path(&desc.digest)?;
        let mut file = File::open(&path)
            .map_err(|e| corrupt(format!("missing blob {}: {}", desc.digest, e)))?;

        let Some(expected) = desc.digest.strip_prefix("sha256:") else {
            warn!("Cannot verify non-sha256 digest {}", desc.digest);
            return Ok(path);
        };

        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)
            .map_err(|e| corrupt(format!("reading blob {}: {}", desc.digest, e)))?;
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(corrupt(format!(
                "digest mismatch for blob {}: got sha256:{}",
                desc.digest, actual
            )));
        }
        Ok(path)
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, desc: &Descriptor) -> Result<T> {
        let path = self.verify_blob(desc)?;
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        serde_json::from_slice(&data).map_err(|e| corrupt(format!("blob {}: {}", desc.digest, e)))
    }

    fn read_index_file(&self) -> Result<Index> {
        let data = fs::read(self.root.join("index.json"))?;
        serde_json::from_slice(&data).map_err(|e| corrupt(format!("index.json: {}", e)))
    }

    /// Pick the image manifest, descending into one nested index
    fn manifest(&self) -> Result<Manifest> {
        let index = self.read_index_file()?;
        let desc = pick_manifest(&index.manifests)
            .ok_or_else(|| corrupt("image index lists no manifests"))?;

        let value: serde_json::Value = self.read_json(desc)?;
        if value.get("manifests").is_some() {
            let nested: Index =
                serde_json::from_value(value).map_err(|e| corrupt(format!("nested index: {}", e)))?;
            let inner = pick_manifest(&nested.manifests)
                .ok_or_else(|| corrupt("nested image index lists no manifests"))?;
            return self.read_json(inner);
        }
        serde_json::from_value(value).map_err(|e| corrupt(format!("manifest {}: {}", desc.digest, e)))
    }

    /// Apply every layer to `rootfs` and merge the image config into `metadata`
    ///
    /// Returns the number of layers applied.
    pub fn apply(&self, rootfs: &Path, metadata: &mut BundleMetadata) -> Result<usize> {
        let manifest = self.manifest()?;

        for (i, layer) in manifest.layers.iter().enumerate() {
            info!(
                "Applying layer {}/{} {}",
                i + 1,
                manifest.layers.len(),
                layer.digest
            );
            let path = self.verify_blob(layer)?;
            let reader = open_decoded(&path).map_err(|e| corrupt(e.to_string()))?;
            extract_tar(reader, rootfs, TarOptions::layer())?;
        }

        let config: ImageConfig = self.read_json(&manifest.config)?;
        if let Some(runtime) = config.config {
            merge_runtime_config(runtime, metadata);
        }
        Ok(manifest.layers.len())
    }
}

fn pick_manifest(manifests: &[Descriptor]) -> Option<&Descriptor> {
    manifests
        .iter()
        .find(|d| {
            d.platform
                .as_ref()
                .is_some_and(|p| p.os == PREFERRED_OS && p.architecture == PREFERRED_ARCH)
        })
        .or_else(|| manifests.first())
}

fn merge_runtime_config(runtime: RuntimeConfig, metadata: &mut BundleMetadata) {
    if let Some(env) = &runtime.env {
        metadata.append_env_vars(env.iter().map(String::as_str));
    }
    if let Some(labels) = runtime.labels {
        for (key, value) in labels {
            metadata.set_label(key, value);
        }
    }

    if metadata.runscript.is_none() {
        let argv: Vec<String> = runtime
            .entrypoint
            .unwrap_or_default()
            .into_iter()
            .chain(runtime.cmd.unwrap_or_default())
            .collect();
        if !argv.is_empty() {
            let quoted: Vec<String> = argv.iter().map(|a| shell_quote(a)).collect();
            metadata.runscript = Some(format!("exec {} \"$@\"\n", quoted.join(" ")));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    fn config() -> serde_json::Value {
        serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin:/bin", "LANG=C.UTF-8"],
                "Labels": {"org.example.name": "demo"},
                "Entrypoint": ["/bin/app"],
                "Cmd": ["--serve", "it's"],
            }
        })
    }

    #[test]
    fn test_apply_layers_and_config() {
        let layout = TempDir::new().unwrap();
        let lower = layer(&[("etc/os-release", b"ID=demo\n"), ("etc/old", b"x")]);
        let upper = layer(&[("etc/.wh.old", b""), ("usr/bin/app", b"#!/bin/sh\n")]);
        write_layout(layout.path(), &[lower, upper], &config());

        let rootfs = TempDir::new().unwrap();
        let mut meta = BundleMetadata::default();
        let opened = OciLayout::open(layout.path(), None).unwrap();
        let applied = opened.apply(rootfs.path(), &mut meta).unwrap();

        assert_eq!(applied, 2);
        assert!(rootfs.path().join("etc/os-release").exists());
        assert!(rootfs.path().join("usr/bin/app").exists());
        assert!(!rootfs.path().join("etc/old").exists());
        assert!(meta.environment.contains("export LANG=C.UTF-8"));
        assert_eq!(meta.labels.get("org.example.name").map(String::as_str), Some("demo"));
        assert_eq!(
            meta.runscript.as_deref(),
            Some("exec /bin/app --serve 'it'\\''s' \"$@\"\n")
        );
    }

    #[test]
    fn test_digest_mismatch_is_corrupt() {
        let layout = TempDir::new().unwrap();
        write_layout(layout.path(), &[layer(&[("a", b"a")])], &config());

        // tamper with the layer blob
        let blobs = layout.path().join("blobs/sha256");
        let index: serde_json::Value =
            serde_json::from_slice(&fs::read(layout.path().join("index.json")).unwrap()).unwrap();
        let manifest_hex = index["manifests"][0]["digest"]
            .as_str()
            .unwrap()
            .trim_start_matches("sha256:")
            .to_string();
        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(blobs.join(&manifest_hex)).unwrap()).unwrap();
        let layer_hex = manifest["layers"][0]["digest"]
            .as_str()
            .unwrap()
            .trim_start_matches("sha256:")
            .to_string();
        fs::write(blobs.join(layer_hex), b"tampered").unwrap();

        let rootfs = TempDir::new().unwrap();
        let opened = OciLayout::open(layout.path(), None).unwrap();
        let err = opened
            .apply(rootfs.path(), &mut BundleMetadata::default())
            .unwrap_err();
        assert!(matches!(err, Error::Unpack { cause: UnpackCause::Corrupt, .. }));
    }

    #[test]
    fn test_not_a_layout() {
        let dir = TempDir::new().unwrap();
        let err = OciLayout::open(dir.path(), None).unwrap_err();
        assert!(matches!(err, Error::Unpack { cause: UnpackCause::Corrupt, .. }));
    }

    #[test]
    fn test_blob_path_rejects_traversal() {
        let layout = TempDir::new().unwrap();
        write_layout(layout.path(), &[], &config());
        let opened = OciLayout::open(layout.path(), None).unwrap();
        assert!(opened.blob_path("sha256:../../etc/passwd").is_err());
        assert!(opened.blob_path("nocolon").is_err());
    }

    #[test]
    fn test_pick_prefers_linux_amd64() {
        let descs: Vec<Descriptor> = serde_json::from_value(serde_json::json!([
            {"digest": "sha256:aa", "platform": {"os": "linux", "architecture": "arm64"}},
            {"digest": "sha256:bb", "platform": {"os": "linux", "architecture": "amd64"}},
        ]))
        .unwrap();
        assert_eq!(pick_manifest(&descs).unwrap().digest, "sha256:bb");
        assert_eq!(pick_manifest(&descs[..1]).unwrap().digest, "sha256:aa");
    }
}
