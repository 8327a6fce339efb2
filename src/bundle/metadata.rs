// src/bundle/metadata.rs

//! Metadata accumulated while a bundle is built

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::warn;

/// Sidecar directory inside the root filesystem
pub const SIDECAR_DIR: &str = ".imgbuild.d";

/// One build history record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub description: String,
}

/// Environment, labels and scripts embedded into the final image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// Shell text sourced at container start, in definition order
    pub environment: String,
    pub labels: BTreeMap<String, String>,
    pub runscript: Option<String>,
    pub test: Option<String>,
    pub help: Option<String>,
    pub history: Vec<HistoryEntry>,
}

impl BundleMetadata {
    /// Append an `%environment` body
    pub fn append_environment(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        if !self.environment.is_empty() && !self.environment.ends_with('\n') {
            self.environment.push('\n');
        }
        self.environment.push_str(text);
        if !self.environment.ends_with('\n') {
            self.environment.push('\n');
        }
    }

    /// Record `KEY=VALUE` pairs (from an image config) as exports
    ///
    /// Values are single-quoted so they are taken literally when sourced.
    pub fn append_env_vars<'a, I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut text = String::new();
        for var in vars {
            let Some((key, value)) = var.split_once('=') else {
                continue;
            };
            if !is_env_name(key) {
                warn!("Skipping environment variable with invalid name: {}", key);
                continue;
            }
            text.push_str(&format!("export {}={}\n", key, shell_quote(value)));
        }
        self.append_environment(&text);
    }

    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    pub fn record(&mut self, phase: &str, description: impl Into<String>) {
        self.history.push(HistoryEntry {
            timestamp: Utc::now(),
            phase: phase.to_string(),
            description: description.into(),
        });
    }

    /// True when the definition contributed nothing to embed
    pub fn is_empty(&self) -> bool {
        self.environment.is_empty()
            && self.labels.is_empty()
            && self.runscript.is_none()
            && self.test.is_none()
            && self.help.is_none()
    }

    /// Write sidecar files into `<rootfs>/.imgbuild.d`
    ///
    /// Returns false without touching the tree when there is nothing to
    /// embed, so a plain copy stays identical to its source.
    pub fn write_sidecars(&self, rootfs: &Path) -> io::Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }

        let dir = rootfs.join(SIDECAR_DIR);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                warn!("Replacing non-directory {} in rootfs", SIDECAR_DIR);
                fs::remove_file(&dir)?;
                fs::create_dir(&dir)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(&dir)?,
            Err(e) => return Err(e),
        }
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;

        if !self.environment.is_empty() {
            write_file(&dir.join("environment"), &self.environment, 0o644)?;
        }
        if !self.labels.is_empty() {
            write_file(&dir.join("labels.json"), &to_json(&self.labels)?, 0o644)?;
        }
        if let Some(runscript) = &self.runscript {
            write_file(&dir.join("runscript"), &script_text(runscript), 0o755)?;
        }
        if let Some(test) = &self.test {
            write_file(&dir.join("test"), &script_text(test), 0o755)?;
        }
        if let Some(help) = &self.help {
            write_file(&dir.join("help"), help, 0o644)?;
        }
        write_file(&dir.join("history.json"), &to_json(&self.history)?, 0o644)?;

        Ok(true)
    }
}

fn to_json<T: Serialize>(value: &T) -> io::Result<String> {
    serde_json::to_string_pretty(value).map_err(io::Error::other)
}

fn script_text(body: &str) -> String {
    if body.starts_with("#!") {
        format!("{}\n", body.trim_end())
    } else {
        format!("#!/bin/sh\n{}\n", body.trim_end())
    }
}

/// Quote `arg` for a POSIX shell, leaving plain words alone
pub(crate) fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/-_.=:,+@".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// never writes through a link left in the rootfs
fn write_file(path: &Path, content: &str, mode: u32) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}
