// src/fetch/credentials.rs

//! Registry credentials
//!
//! Token lookup order, highest priority first: an explicit `--tokenfile`,
//! the `IMGBUILD_TOKEN` environment variable, then `~/.imgbuild/token`.

use crate::error::{Error, FetchCause};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Environment variable holding a registry token
pub const TOKEN_ENV: &str = "IMGBUILD_TOKEN";

/// Credential lookup errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("cannot read token file {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("token file {0} is empty")]
    Empty(String),

    #[error("{0}")]
    Preloaded(String),
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        Error::fetch(FetchCause::Auth, err.to_string())
    }
}

/// Supplies a token for a registry host
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` means anonymous access
    fn credential_for(&self, target: &str) -> Result<Option<String>, AuthError>;
}

/// Token from file or environment
#[derive(Debug, Clone, Default)]
pub struct TokenCredentials {
    explicit_file: Option<PathBuf>,
    env_token: Option<String>,
    default_file: Option<PathBuf>,
}

impl TokenCredentials {
    pub fn new(
        explicit_file: Option<PathBuf>,
        env_token: Option<String>,
        default_file: Option<PathBuf>,
    ) -> Self {
        Self {
            explicit_file,
            env_token: env_token.filter(|t| !t.trim().is_empty()),
            default_file,
        }
    }

    /// Standard lookup using the process environment and home directory
    pub fn from_env(explicit_file: Option<PathBuf>) -> Self {
        Self::new(
            explicit_file,
            std::env::var(TOKEN_ENV).ok(),
            Self::default_token_path(),
        )
    }

    pub fn default_token_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".imgbuild").join("token"))
    }

    /// Resolve the token now, with the caller's current privileges
    ///
    /// The lookup result (token, anonymous or error) is replayed for every
    /// later request, so no file is opened inside an elevated scope.
    pub fn preload(&self) -> PreloadedToken {
        PreloadedToken(self.credential_for("all registries").map_err(|e| e.to_string()))
    }
}

/// Token looked up once, ahead of time
#[derive(Debug, Clone)]
pub struct PreloadedToken(Result<Option<String>, String>);

impl CredentialProvider for PreloadedToken {
    fn credential_for(&self, _target: &str) -> Result<Option<String>, AuthError> {
        self.0.clone().map_err(AuthError::Preloaded)
    }
}

fn read_token(path: &Path) -> Result<String, AuthError> {
    let content = fs::read_to_string(path).map_err(|source| AuthError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    let token = content.trim();
    if token.is_empty() {
        return Err(AuthError::Empty(path.display().to_string()));
    }
    Ok(token.to_string())
}

impl CredentialProvider for TokenCredentials {
    fn credential_for(&self, target: &str) -> Result<Option<String>, AuthError> {
        if let Some(path) = &self.explicit_file {
            debug!("Using token file {} for {}", path.display(), target);
            return read_token(path).map(Some);
        }
        if let Some(token) = &self.env_token {
            debug!("Using {} for {}", TOKEN_ENV, target);
            return Ok(Some(token.trim().to_string()));
        }
        if let Some(path) = &self.default_file
            && path.exists()
        {
            debug!("Using default token file {} for {}", path.display(), target);
            return match read_token(path) {
                Ok(token) => Ok(Some(token)),
                Err(AuthError::Empty(_)) => Ok(None),
                Err(e) => Err(e),
            };
        }
        Ok(None)
    }
}
