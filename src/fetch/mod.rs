// src/fetch/mod.rs

//! Collaborators used by source backends to obtain material
//!
//! - [`Resolver`] turns an image reference into a local OCI layout
//! - [`CredentialProvider`] supplies a token for a registry host
//! - [`HttpClient`] downloads seed files such as a static busybox

mod credentials;
mod http;
mod resolver;

pub use credentials::{AuthError, CredentialProvider, PreloadedToken, TOKEN_ENV, TokenCredentials};
pub use http::HttpClient;
pub use resolver::{LayoutResolver, registry_host};

use crate::error::{Error, FetchCause};
use std::path::PathBuf;
use thiserror::Error;

/// Why a reference could not be resolved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        let (cause, message) = match err {
            ResolveError::Network(m) => (FetchCause::Network, m),
            ResolveError::NotFound(m) => (FetchCause::NotFound, m),
            ResolveError::Auth(m) => (FetchCause::Auth, m),
        };
        Error::fetch(cause, message)
    }
}

/// Resolve an image reference to a local artifact
///
/// The returned path is either an OCI image layout directory or a tar
/// archive of one. The token is passed through unexamined.
pub trait Resolver: Send + Sync {
    fn resolve(&self, reference: &str, token: Option<&str>) -> Result<PathBuf, ResolveError>;
}
