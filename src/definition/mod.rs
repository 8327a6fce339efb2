// src/definition/mod.rs

//! Definition model
//!
//! A [`Definition`] is the parsed, read-only form of a build recipe: an
//! ordered header of `Key: value` pairs followed by typed sections. Nothing
//! downstream can mutate it; the orchestrator hands out shared references
//! only.
//!
//! ```text
//! Bootstrap: directory
//! From: ./rootfs
//!
//! %files
//!     app.conf /etc/app.conf
//!
//! %post
//!     echo configured > /etc/motd
//! ```

mod parser;

pub use parser::parse;

use crate::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Interpreter used for script sections without `-c`
pub const DEFAULT_INTERPRETER: &str = "/bin/sh";

/// Definition parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("line {line}: unknown section %{name}")]
    UnknownSection { line: usize, name: String },

    #[error("line {line}: files entry must be `source [dest]`, got {content:?}")]
    MalformedFilesLine { line: usize, content: String },

    #[error("line {line}: header entry must be `Key: value`, got {content:?}")]
    MalformedHeaderLine { line: usize, content: String },

    #[error("definition has no header before its first section")]
    MissingHeader,

    #[error("header is missing the required Bootstrap key")]
    MissingBootstrap,

    #[error("cannot read definition {0}")]
    Io(String),
}

/// Section kinds recognized in a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Setup,
    Post,
    Files,
    Environment,
    Labels,
    Runscript,
    Test,
    Help,
}

impl SectionKind {
    pub const ALL: [SectionKind; 8] = [
        Self::Setup,
        Self::Post,
        Self::Files,
        Self::Environment,
        Self::Labels,
        Self::Runscript,
        Self::Test,
        Self::Help,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Post => "post",
            Self::Files => "files",
            Self::Environment => "environment",
            Self::Labels => "labels",
            Self::Runscript => "runscript",
            Self::Test => "test",
            Self::Help => "help",
        }
    }

    /// Sections that touch the filesystem and can fail at build time
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Setup | Self::Post | Self::Files)
    }

    /// Sections that run inside the privilege scope
    pub fn is_privileged(&self) -> bool {
        self.is_executable()
    }
}

impl FromStr for SectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == lower)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bootstrap kinds with a registered source backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapKind {
    Docker,
    Oci,
    Debootstrap,
    Yum,
    Zypper,
    Busybox,
    Directory,
    Archive,
    Scratch,
}

impl BootstrapKind {
    pub const ALL: [BootstrapKind; 9] = [
        Self::Docker,
        Self::Oci,
        Self::Debootstrap,
        Self::Yum,
        Self::Zypper,
        Self::Busybox,
        Self::Directory,
        Self::Archive,
        Self::Scratch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Oci => "oci",
            Self::Debootstrap => "debootstrap",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
            Self::Busybox => "busybox",
            Self::Directory => "directory",
            Self::Archive => "archive",
            Self::Scratch => "scratch",
        }
    }
}

impl FromStr for BootstrapKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "oci" => Ok(Self::Oci),
            "debootstrap" => Ok(Self::Debootstrap),
            "yum" | "dnf" => Ok(Self::Yum),
            "zypper" => Ok(Self::Zypper),
            "busybox" => Ok(Self::Busybox),
            "directory" | "localimage" => Ok(Self::Directory),
            "archive" => Ok(Self::Archive),
            "scratch" => Ok(Self::Scratch),
            _ => Err(Error::UnknownBootstrap(s.trim().to_string())),
        }
    }
}

impl fmt::Display for BootstrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `%files` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCopy {
    pub source: String,
    pub dest: String,
}

impl FileCopy {
    pub fn new(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
        }
    }
}

/// Section content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionBody {
    /// Script or metadata text, kept verbatim
    Text(String),
    /// Parsed `%files` pairs
    Files(Vec<FileCopy>),
}

/// A typed definition section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    kind: SectionKind,
    args: String,
    body: SectionBody,
}

impl Section {
    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    /// Remainder of the `%name` line
    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn body(&self) -> &SectionBody {
        &self.body
    }

    /// Body text for non-`files` sections
    pub fn text(&self) -> &str {
        match &self.body {
            SectionBody::Text(text) => text,
            SectionBody::Files(_) => "",
        }
    }

    pub fn files(&self) -> &[FileCopy] {
        match &self.body {
            SectionBody::Files(files) => files,
            SectionBody::Text(_) => &[],
        }
    }

    /// Interpreter requested with `-c <shell>`, or `/bin/sh`
    pub fn interpreter(&self) -> &str {
        let mut tokens = self.args.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "-c"
                && let Some(shell) = tokens.next()
            {
                return shell;
            }
        }
        DEFAULT_INTERPRETER
    }

    /// `%labels` body as key/value pairs
    pub fn labels(&self) -> Vec<(String, String)> {
        self.text()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| match l.split_once(char::is_whitespace) {
                Some((key, value)) => (key.to_string(), value.trim().to_string()),
                None => (l.to_string(), String::new()),
            })
            .collect()
    }
}

/// Ordered header with case-insensitive keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    /// Insert or replace; a replaced key keeps its original position
    fn insert(&mut self, key: &str, value: &str) {
        let key = key.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key, value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parsed build recipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    header: Header,
    sections: Vec<Section>,
    context_dir: Option<PathBuf>,
}

impl Definition {
    /// Start building a definition programmatically
    pub fn builder() -> DefinitionBuilder {
        DefinitionBuilder::default()
    }

    /// Read and parse a definition file
    ///
    /// The file's directory becomes the build context for relative paths.
    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DefinitionError::Io(format!("{}: {}", path.display(), e)))?;
        let mut def = parse(&content)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        def.context_dir = Some(dir.to_path_buf());
        Ok(def)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Header value by case-insensitive key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.header.get(key)
    }

    /// Raw `Bootstrap` value; always present on a parsed definition
    pub fn bootstrap(&self) -> &str {
        self.header.get("bootstrap").unwrap_or_default()
    }

    /// Validated bootstrap kind
    pub fn bootstrap_kind(&self) -> crate::Result<BootstrapKind> {
        self.bootstrap().parse()
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn sections_of(&self, kind: SectionKind) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(move |s| s.kind == kind)
    }

    /// Directory relative paths are resolved against
    pub fn context_dir(&self) -> &Path {
        self.context_dir.as_deref().unwrap_or_else(|| Path::new("."))
    }

    /// Resolve a path from the definition against the build context
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.context_dir().join(path)
        }
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.header.iter() {
            writeln!(f, "{}: {}", key, value)?;
        }
        for section in &self.sections {
            writeln!(f)?;
            if section.args.is_empty() {
                writeln!(f, "%{}", section.kind)?;
            } else {
                writeln!(f, "%{} {}", section.kind, section.args)?;
            }
            match &section.body {
                SectionBody::Text(text) if text.is_empty() => {}
                SectionBody::Text(text) => writeln!(f, "{}", text)?,
                SectionBody::Files(files) => {
                    for copy in files {
                        if copy.source == copy.dest {
                            writeln!(f, "    {}", copy.source)?;
                        } else {
                            writeln!(f, "    {} {}", copy.source, copy.dest)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Programmatic construction with the same invariants as [`parse`]
#[derive(Debug, Default)]
pub struct DefinitionBuilder {
    header: Header,
    sections: Vec<Section>,
    context_dir: Option<PathBuf>,
}

impl DefinitionBuilder {
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.header.insert(key, value);
        self
    }

    /// Add a text section (anything but `files`)
    pub fn section(mut self, kind: SectionKind, args: &str, text: &str) -> Self {
        let body = if kind == SectionKind::Files {
            SectionBody::Files(Vec::new())
        } else {
            SectionBody::Text(text.trim_end().to_string())
        };
        self.sections.push(Section {
            kind,
            args: args.trim().to_string(),
            body,
        });
        self
    }

    pub fn files<I, S, D>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<String>,
        D: Into<String>,
    {
        let files = pairs
            .into_iter()
            .map(|(s, d)| FileCopy::new(s, d))
            .collect();
        self.sections.push(Section {
            kind: SectionKind::Files,
            args: String::new(),
            body: SectionBody::Files(files),
        });
        self
    }

    pub fn context_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.context_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Definition, DefinitionError> {
        if self.header.is_empty() {
            return Err(DefinitionError::MissingHeader);
        }
        if self.header.get("bootstrap").is_none() {
            return Err(DefinitionError::MissingBootstrap);
        }
        Ok(Definition {
            header: self.header,
            sections: self.sections,
            context_dir: self.context_dir,
        })
    }
}
