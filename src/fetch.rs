use crate::config::{HTTP_TIMEOUT, USER_AGENT};
use crate::models::{ImageManifest, ImageMeta};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Status used when a request never produced an HTTP response
pub const NO_RESPONSE: u16 = 0;

/// Result of one download attempt for a whole manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub status: u16,
    /// On 429: what went wrong with the entries before the throttled one
    pub error: Option<String>,
    /// On 429: the entries not fetched yet. Empty means "retry everything".
    pub remaining: ImageManifest,
}

impl FetchOutcome {
    pub fn ok() -> Self {
        Self::with_status(200, None)
    }

    pub fn with_status(status: u16, error: Option<String>) -> Self {
        Self {
            status,
            error,
            remaining: ImageManifest::new(),
        }
    }

    pub fn rate_limited(remaining: ImageManifest) -> Self {
        Self {
            status: 429,
            error: None,
            remaining,
        }
    }
}

/// Downloads every image of a manifest into its planned path.
pub trait ImageFetcher: Send + Sync {
    fn download(&self, images: &ImageManifest, image_dir: &Path, title: &str) -> Result<FetchOutcome>;
}

pub struct HttpImageFetcher {
    client: Client,
}

impl HttpImageFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn fetch_one(&self, meta: &ImageMeta) -> Result<StatusCode> {
        let response = self
            .client
            .get(&meta.url)
            .send()
            .with_context(|| format!("Request to {} failed", meta.url))?;

        let status = response.status();
        if !status.is_success() {
            return Ok(status);
        }

        let bytes = response
            .bytes()
            .with_context(|| format!("Failed to read body from {}", meta.url))?;
        fs::write(&meta.path, &bytes)
            .with_context(|| format!("Failed to write image to {:?}", meta.path))?;
        Ok(status)
    }
}

/// Joins per-image failures and missing identifiers into one message.
fn summarize(failures: &[String], missing: &[&str]) -> Option<String> {
    let mut parts = failures.to_vec();
    if !missing.is_empty() {
        parts.push(format!("not found: {}", missing.join(", ")));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn download(&self, images: &ImageManifest, image_dir: &Path, title: &str) -> Result<FetchOutcome> {
        fs::create_dir_all(image_dir)
            .with_context(|| format!("Failed to create image directory: {:?}", image_dir))?;

        let mut missing = Vec::new();
        let mut failures = Vec::new();
        let mut failure_status = None;

        let entries: Vec<_> = images.iter().collect();
        for (idx, (id, meta)) in entries.iter().enumerate() {
            match self.fetch_one(meta) {
                Ok(StatusCode::TOO_MANY_REQUESTS) => {
                    debug!(title, image = %id, "Rate limited");
                    let remaining = entries[idx..]
                        .iter()
                        .map(|(k, v)| ((*k).clone(), (*v).clone()))
                        .collect();
                    // Entries before the 429 are settled and leave the task here.
                    return Ok(FetchOutcome {
                        error: summarize(&failures, &missing),
                        ..FetchOutcome::rate_limited(remaining)
                    });
                }
                Ok(StatusCode::NOT_FOUND) => missing.push(id.as_str()),
                Ok(status) if status.is_success() => {
                    debug!(title, image = %id, "Image downloaded");
                }
                Ok(status) => {
                    failures.push(format!("{id}: HTTP {}", status.as_u16()));
                    failure_status.get_or_insert(status.as_u16());
                }
                Err(e) => {
                    warn!(title, image = %id, error = %e, "Image fetch failed");
                    failures.push(format!("{id}: {e:#}"));
                    failure_status.get_or_insert(NO_RESPONSE);
                }
            }
        }

        let message = summarize(&failures, &missing);
        if let Some(status) = failure_status {
            return Ok(FetchOutcome::with_status(status, message));
        }
        if message.is_some() {
            return Ok(FetchOutcome::with_status(404, message));
        }
        Ok(FetchOutcome::ok())
    }
}
