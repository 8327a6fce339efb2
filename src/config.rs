// src/config.rs

//! Build configuration
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! an optional TOML file (`$XDG_CONFIG_HOME/imgbuild/config.toml` or an
//! explicit `--config` path), then `IMGBUILD_*` environment variables.
//! Command-line flags are applied on top by the caller with the `with_*`
//! builders.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default timeout for a single build step or bootstrap tool (1 hour)
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 3600;

/// Static busybox binary used when a definition gives no `MirrorURL`
pub const DEFAULT_BUSYBOX_URL: &str =
    "https://www.busybox.net/downloads/binaries/1.35.0-x86_64-linux-musl/busybox";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "IMGBUILD_";

/// Pipeline-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Parent directory for bundle staging (system temp dir when unset)
    pub tmp_dir: Option<PathBuf>,

    /// Timeout in seconds for each script section or external tool
    pub step_timeout_secs: u64,

    /// Run `%post` inside a private mount namespace chrooted into the rootfs
    pub isolate_steps: bool,

    /// Fail instead of running `%post` host-side when isolation is
    /// unavailable; only `isolate_steps = false` opts into host execution
    pub require_isolation: bool,

    /// Explicit path to `mksquashfs` (looked up on PATH when unset)
    pub mksquashfs_path: Option<PathBuf>,

    /// Compressor passed to `mksquashfs -comp`
    pub squashfs_compression: String,

    /// Default busybox download location
    pub busybox_url: String,

    /// Directory of local OCI layouts used to resolve bare image references
    pub layout_store: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tmp_dir: None,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            isolate_steps: true,
            require_isolation: true,
            mksquashfs_path: None,
            squashfs_compression: "gzip".to_string(),
            busybox_url: DEFAULT_BUSYBOX_URL.to_string(),
            layout_store: None,
        }
    }
}

impl BuildConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("imgbuild").join("config.toml"))
    }

    /// Load defaults, the config file and environment overrides
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `IMGBUILD_*` overrides using the given lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(dir) = var("TMPDIR") {
            self.tmp_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = var("STEP_TIMEOUT") {
            self.step_timeout_secs = secs
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid {}STEP_TIMEOUT: {}", ENV_PREFIX, secs)))?;
        }
        if let Some(path) = var("MKSQUASHFS") {
            self.mksquashfs_path = Some(PathBuf::from(path));
        }
        if let Some(comp) = var("SQUASHFS_COMP") {
            self.squashfs_compression = comp;
        }
        if let Some(url) = var("BUSYBOX_URL") {
            self.busybox_url = url;
        }
        if let Some(store) = var("LAYOUT_STORE") {
            self.layout_store = Some(PathBuf::from(store));
        }
        if let Some(flag) = var("REQUIRE_ISOLATION") {
            self.require_isolation = matches!(flag.trim(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = Some(dir.into());
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_secs = timeout.as_secs();
        self
    }

    /// Run script sections host-side instead of chrooted
    pub fn with_isolation(mut self, isolate: bool) -> Self {
        self.isolate_steps = isolate;
        self
    }

    pub fn with_layout_store(mut self, store: impl Into<PathBuf>) -> Self {
        self.layout_store = Some(store.into());
        self
    }

    pub fn with_mksquashfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.mksquashfs_path = Some(path.into());
        self
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BuildConfig::default();
        assert_eq!(config.step_timeout(), Duration::from_secs(3600));
        assert_eq!(config.squashfs_compression, "gzip");
        assert!(config.isolate_steps);
        assert!(config.require_isolation);
        assert!(config.tmp_dir.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BuildConfig::from_toml("squashfs_compression = \"zstd\"\n").unwrap();
        assert_eq!(config.squashfs_compression, "zstd");
        assert_eq!(config.step_timeout_secs, DEFAULT_STEP_TIMEOUT_SECS);
        assert_eq!(config.busybox_url, DEFAULT_BUSYBOX_URL);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("IMGBUILD_TMPDIR", "/scratch"),
            ("IMGBUILD_STEP_TIMEOUT", "90"),
            ("IMGBUILD_REQUIRE_ISOLATION", "no"),
        ]
        .into_iter()
        .collect();

        let mut config = BuildConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.tmp_dir, Some(PathBuf::from("/scratch")));
        assert_eq!(config.step_timeout_secs, 90);
        assert!(!config.require_isolation);
    }

    #[test]
    fn test_env_bad_timeout() {
        let mut config = BuildConfig::default();
        let result = config.apply_env(|k| {
            (k == "IMGBUILD_STEP_TIMEOUT").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file_missing() {
        let result = BuildConfig::from_file(Path::new("/nonexistent/imgbuild.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builder() {
        let config = BuildConfig::new()
            .with_tmp_dir("/var/tmp")
            .with_step_timeout(Duration::from_secs(5))
            .with_isolation(false);
        assert_eq!(config.tmp_dir, Some(PathBuf::from("/var/tmp")));
        assert_eq!(config.step_timeout_secs, 5);
        assert!(!config.isolate_steps);
    }
}
