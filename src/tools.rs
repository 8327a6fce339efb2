// src/tools.rs

//! Host tool discovery
//!
//! Backends and assemblers that shell out look their tools up on PATH at
//! build time; this module reports the same lookup up front.

use crate::assemble::ImageFormat;
use crate::definition::BootstrapKind;
use std::path::PathBuf;

/// One external tool and where it was found
#[derive(Debug, Clone)]
pub struct ToolStatus {
    pub name: &'static str,
    pub package: &'static str,
    pub purpose: &'static str,
    pub path: Option<PathBuf>,
}

impl ToolStatus {
    pub fn is_present(&self) -> bool {
        self.path.is_some()
    }
}

const KNOWN_TOOLS: &[(&str, &str, &str)] = &[
    ("mksquashfs", "squashfs-tools", "image format"),
    ("debootstrap", "debootstrap", "debootstrap bootstrap"),
    ("dnf", "dnf", "yum/dnf bootstrap"),
    ("yum", "yum", "yum/dnf bootstrap (fallback)"),
    ("zypper", "zypper", "zypper bootstrap"),
];

/// External tools the builder may call
#[derive(Debug, Clone)]
pub struct HostTools {
    tools: Vec<ToolStatus>,
}

impl HostTools {
    /// Look every known tool up on PATH
    pub fn check() -> Self {
        let tools = KNOWN_TOOLS
            .iter()
            .map(|(name, package, purpose)| ToolStatus {
                name,
                package,
                purpose,
                path: which::which(name).ok(),
            })
            .collect();
        Self { tools }
    }

    pub fn tools(&self) -> &[ToolStatus] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolStatus> {
        self.tools.iter().find(|t| t.name == name)
    }

    fn present(&self, name: &str) -> bool {
        self.get(name).is_some_and(ToolStatus::is_present)
    }

    /// Whether a bootstrap kind can run on this host
    pub fn supports_bootstrap(&self, kind: BootstrapKind) -> bool {
        match kind {
            BootstrapKind::Debootstrap => self.present("debootstrap"),
            BootstrapKind::Yum => self.present("dnf") || self.present("yum"),
            BootstrapKind::Zypper => self.present("zypper"),
            _ => true,
        }
    }

    /// Whether an output format can be produced on this host
    pub fn supports_format(&self, format: ImageFormat) -> bool {
        format.required_tool().is_none_or(|tool| self.present(tool))
    }

    pub fn missing(&self) -> Vec<&'static str> {
        self.tools
            .iter()
            .filter(|t| !t.is_present())
            .map(|t| t.name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_lists_every_known_tool() {
        let tools = HostTools::check();
        assert_eq!(tools.tools().len(), KNOWN_TOOLS.len());
        assert!(tools.get("mksquashfs").is_some());
        assert!(tools.get("gcc").is_none());
    }

    #[test]
    fn test_toolless_kinds_always_supported() {
        let tools = HostTools::check();
        for kind in [
            BootstrapKind::Directory,
            BootstrapKind::Archive,
            BootstrapKind::Scratch,
            BootstrapKind::Busybox,
            BootstrapKind::Docker,
        ] {
            assert!(tools.supports_bootstrap(kind));
        }
        assert!(tools.supports_format(ImageFormat::Sandbox));
        assert!(tools.supports_format(ImageFormat::Legacy));
    }
}
