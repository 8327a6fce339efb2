// src/error.rs

//! Error taxonomy for the build pipeline
//!
//! Every phase reports failures through [`Error`]. Each variant carries a
//! cause kind so callers (and the CLI exit code mapping) can tell a missing
//! tool from a failed write without parsing messages.

use crate::definition::DefinitionError;
use std::fmt;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Why a fetch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCause {
    Network,
    NotFound,
    Auth,
}

/// Why an unpack failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackCause {
    Corrupt,
    ToolMissing,
    WriteFailed,
}

/// Why a `files` copy failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCopyCause {
    NotFound,
    WriteFailed,
}

/// Why a script section failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCause {
    /// The script ran and exited non-zero (or was killed by a signal, code -1)
    ScriptFailed { code: i32 },
    TimedOut,
    Cancelled,
    SpawnFailed,
    IsolationUnavailable,
}

/// Why a privilege transition failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeCause {
    Denied,
    RestoreFailed,
    Reentrant,
}

/// Why assembling the final image failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssembleCause {
    ToolMissing,
    WriteFailed,
}

macro_rules! cause_display {
    ($ty:ty { $($variant:pat => $text:expr),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($variant => f.write_str($text)),+
                }
            }
        }
    };
}

cause_display!(FetchCause {
    FetchCause::Network => "network",
    FetchCause::NotFound => "not found",
    FetchCause::Auth => "auth",
});

cause_display!(UnpackCause {
    UnpackCause::Corrupt => "corrupt",
    UnpackCause::ToolMissing => "tool missing",
    UnpackCause::WriteFailed => "write failed",
});

cause_display!(FileCopyCause {
    FileCopyCause::NotFound => "not found",
    FileCopyCause::WriteFailed => "write failed",
});

cause_display!(PrivilegeCause {
    PrivilegeCause::Denied => "denied",
    PrivilegeCause::RestoreFailed => "restore failed",
    PrivilegeCause::Reentrant => "reentrant",
});

cause_display!(AssembleCause {
    AssembleCause::ToolMissing => "tool missing",
    AssembleCause::WriteFailed => "write failed",
});

impl fmt::Display for StepCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScriptFailed { code } => write!(f, "script failed with exit code {}", code),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::SpawnFailed => f.write_str("spawn failed"),
            Self::IsolationUnavailable => f.write_str("isolation unavailable"),
        }
    }
}

/// Build pipeline error
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed definition: {0}")]
    MalformedDefinition(#[from] DefinitionError),

    #[error("unknown bootstrap kind: {0}")]
    UnknownBootstrap(String),

    #[error("no assembler registered for format: {0}")]
    UnknownFormat(String),

    #[error("fetch failed ({cause}): {message}")]
    Fetch { cause: FetchCause, message: String },

    #[error("unpack failed ({cause}): {message}")]
    Unpack { cause: UnpackCause, message: String },

    #[error("file copy failed ({cause}) for {path}: {message}")]
    FileCopy {
        cause: FileCopyCause,
        path: String,
        message: String,
    },

    #[error("%{section} failed ({cause}): {message}")]
    StepExecution {
        section: String,
        cause: StepCause,
        message: String,
    },

    #[error("privilege error ({cause}): {message}")]
    Privilege {
        cause: PrivilegeCause,
        message: String,
    },

    #[error("assemble failed ({cause}): {message}")]
    Assemble {
        cause: AssembleCause,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse failure category, one per distinct CLI exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Fetch,
    Unpack,
    Step,
    Privilege,
    Assemble,
    Cancelled,
    Other,
}

impl ErrorCategory {
    /// Process exit code for this category
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Other => 1,
            Self::Validation => 2,
            Self::Fetch => 3,
            Self::Unpack => 4,
            Self::Step => 5,
            Self::Privilege => 6,
            Self::Assemble => 7,
            Self::Cancelled => 8,
        }
    }
}

impl Error {
    pub fn fetch(cause: FetchCause, message: impl Into<String>) -> Self {
        Self::Fetch {
            cause,
            message: message.into(),
        }
    }

    pub fn unpack(cause: UnpackCause, message: impl Into<String>) -> Self {
        Self::Unpack {
            cause,
            message: message.into(),
        }
    }

    pub fn file_copy(cause: FileCopyCause, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FileCopy {
            cause,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn step(section: impl Into<String>, cause: StepCause, message: impl Into<String>) -> Self {
        Self::StepExecution {
            section: section.into(),
            cause,
            message: message.into(),
        }
    }

    pub fn privilege(cause: PrivilegeCause, message: impl Into<String>) -> Self {
        Self::Privilege {
            cause,
            message: message.into(),
        }
    }

    pub fn assemble(cause: AssembleCause, message: impl Into<String>) -> Self {
        Self::Assemble {
            cause,
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedDefinition(_) | Self::UnknownBootstrap(_) | Self::UnknownFormat(_) => {
                ErrorCategory::Validation
            }
            Self::Config(_) => ErrorCategory::Validation,
            Self::Fetch { .. } => ErrorCategory::Fetch,
            Self::Unpack { .. } => ErrorCategory::Unpack,
            Self::StepExecution {
                cause: StepCause::Cancelled,
                ..
            } => ErrorCategory::Cancelled,
            Self::FileCopy { .. } | Self::StepExecution { .. } => ErrorCategory::Step,
            Self::Privilege { .. } => ErrorCategory::Privilege,
            Self::Assemble { .. } => ErrorCategory::Assemble,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Io(_) => ErrorCategory::Other,
        }
    }

    /// Privilege state can no longer be trusted; the process must not carry on
    pub fn is_fatal_for_process(&self) -> bool {
        matches!(
            self,
            Self::Privilege {
                cause: PrivilegeCause::RestoreFailed,
                ..
            }
        )
    }
}
