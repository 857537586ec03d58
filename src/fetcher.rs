//! # Wallpaper Fetcher
//!
//! Downloads an image from a URL, decodes it and hands it to the desktop.
//!
//! ## Pipeline
//! 1. GET the URL (non-2xx status → [`FetchError::HttpStatus`], transport
//!    failure or empty body → [`FetchError::Network`])
//! 2. Decode the bytes on a blocking worker ([`FetchError::Decode`])
//! 3. Apply through the [`WallpaperSetter`] ([`FetchError::Apply`])
//!
//! Nothing is retried here, and nothing touches the current wallpaper unless
//! every earlier step succeeded.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::config::WallpaperTarget;

/// Why a fetch-and-apply attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server responded with HTTP {code}")]
    HttpStatus { code: u16 },
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("wallpaper was rejected: {0}")]
    Apply(String),
}

/// Why an attempt was deliberately not made or not finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No URL configured
    EmptyUrl,
    /// A newer run started before this one reached the apply step
    Superseded,
}

/// Result of one download-decode-apply attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    Failure(FetchError),
    Skipped(SkipReason),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Minimal HTTP GET seam so the pipeline can be exercised without a network.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Fetches `url`. Transport failures are reported as [`FetchError::Network`];
    /// any HTTP status (including errors) is returned as a response.
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError>;
}

/// The desktop's wallpaper-setting capability.
///
/// `apply` blocks (it writes files and runs helper processes), so the fetcher
/// calls it from a blocking worker.
pub trait WallpaperSetter: Send + Sync {
    fn apply(&self, image: &DynamicImage, target: WallpaperTarget) -> Result<(), String>;
}

/// [`HttpClient`] backed by reqwest with its default timeouts.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            // The body of an error response is of no use to us
            return Ok(HttpResponse { status: status.as_u16(), body: Vec::new() });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(format!("failed to read response body: {e}")))?;

        Ok(HttpResponse { status: status.as_u16(), body: body.to_vec() })
    }
}

/// Download, decode and apply pipeline.
///
/// Applies are serialized, so two runs can never be mid-apply at once.
#[derive(Clone)]
pub struct WallpaperFetcher {
    http: Arc<dyn HttpClient>,
    setter: Arc<dyn WallpaperSetter>,
    apply_lock: Arc<Mutex<()>>,
}

impl WallpaperFetcher {
    pub fn new(http: Arc<dyn HttpClient>, setter: Arc<dyn WallpaperSetter>) -> Self {
        Self { http, setter, apply_lock: Arc::new(Mutex::new(())) }
    }

    /// Runs the whole pipeline for `url` and applies the result to `target`.
    pub async fn fetch_and_apply(&self, url: &str, target: WallpaperTarget) -> FetchOutcome {
        self.fetch_and_apply_unless(url, target, || false).await
    }

    /// Like [`fetch_and_apply`](Self::fetch_and_apply), but skips the apply
    /// step when `superseded` returns true. It is checked after decoding and
    /// again once this run holds the apply lock.
    pub async fn fetch_and_apply_unless<F>(&self, url: &str, target: WallpaperTarget, superseded: F) -> FetchOutcome
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let image = match self.fetch_image(url).await {
            Ok(image) => image,
            Err(e) => {
                warn!(url = %url, error = %e, "wallpaper download failed");
                return FetchOutcome::Failure(e);
            }
        };

        if superseded() {
            info!(url = %url, "a newer update started, discarding this image");
            return FetchOutcome::Skipped(SkipReason::Superseded);
        }

        match self.apply(image, target, superseded).await {
            Ok(true) => {
                info!(url = %url, %target, "wallpaper applied");
                FetchOutcome::Success
            }
            Ok(false) => {
                info!(url = %url, "a newer update applied first, discarding this image");
                FetchOutcome::Skipped(SkipReason::Superseded)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "wallpaper apply failed");
                FetchOutcome::Failure(e)
            }
        }
    }

    /// Downloads and decodes the image at `url`.
    pub async fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError> {
        debug!(url = %url, "downloading wallpaper");
        let response = self.http.get(url).await?;

        if !(200..300).contains(&response.status) {
            return Err(FetchError::HttpStatus { code: response.status });
        }

        if response.body.is_empty() {
            return Err(FetchError::Network("empty response body".to_string()));
        }

        debug!(bytes = response.body.len(), "decoding wallpaper");
        let body = response.body;
        tokio::task::spawn_blocking(move || image::load_from_memory(&body))
            .await
            .map_err(|e| FetchError::Decode(format!("decoder task failed: {e}")))?
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Returns `Ok(false)` if the run was superseded while waiting for the lock.
    async fn apply<F>(&self, image: DynamicImage, target: WallpaperTarget, superseded: F) -> Result<bool, FetchError>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let setter = self.setter.clone();
        let lock = self.apply_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if superseded() {
                return Ok(false);
            }
            setter.apply(&image, target).map(|()| true)
        })
        .await
        .map_err(|e| FetchError::Apply(format!("apply task failed: {e}")))?
        .map_err(FetchError::Apply)
    }
}
