// src/fetch/http.rs

//! HTTP downloads for bootstrap seeds

use super::ResolveError;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default timeout for HTTP requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum attempts for transport-level failures
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Blocking HTTP client with retry on connection errors
pub struct HttpClient {
    client: Client,
    max_retries: u32,
}

impl HttpClient {
    pub fn new() -> Result<Self, ResolveError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("imgbuild/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ResolveError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Download `url` to `dest_path` through a temporary file
    ///
    /// HTTP status errors are not retried; 404 maps to not-found and
    /// 401/403 to an auth failure.
    pub fn download_file(
        &self,
        url: &str,
        dest_path: &Path,
        token: Option<&str>,
    ) -> Result<u64, ResolveError> {
        info!("Downloading {} to {}", url, dest_path.display());
        let io_err = |e: io::Error| ResolveError::Network(format!("{}: {e}", dest_path.display()));

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.client.get(url);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }

            match request.send() {
                Ok(mut response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let message = format!("HTTP {} from {}", status, url);
                        return Err(match status {
                            StatusCode::NOT_FOUND => ResolveError::NotFound(message),
                            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                                ResolveError::Auth(message)
                            }
                            _ => ResolveError::Network(message),
                        });
                    }

                    let temp_path = dest_path.with_extension("part");
                    let mut file = File::create(&temp_path).map_err(io_err)?;
                    let written = match io::copy(&mut response, &mut file) {
                        Ok(n) => n,
                        Err(e) => {
                            let _ = fs::remove_file(&temp_path);
                            return Err(ResolveError::Network(format!(
                                "failed to read body from {}: {e}",
                                url
                            )));
                        }
                    };
                    fs::rename(&temp_path, dest_path).map_err(io_err)?;

                    info!("Downloaded {} bytes", written);
                    return Ok(written);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(ResolveError::Network(format!(
                            "failed to download {} after {attempt} attempts: {e}",
                            url
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}
