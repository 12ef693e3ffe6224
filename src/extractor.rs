use crate::config::DEFAULT_IMAGE_BASE_URL;
use crate::content;
use crate::models::{ImageManifest, ImageMeta};
use anyhow::{Context, Result};
use reqwest::Url;
use std::path::Path;

/// Per-page text collaborators used by the extraction workers.
///
/// Implementations must be pure with respect to their inputs; the same page
/// always produces the same output.
pub trait PageExtractor: Send + Sync {
    /// Finds image references and plans where each one is downloaded to.
    /// References that cannot be planned are described in the returned error.
    fn extract_images(&self, raw_text: &str, image_dir: &Path) -> (ImageManifest, Option<String>);

    fn extract_categories(&self, raw_text: &str) -> Vec<String>;

    fn clean(&self, text: &str) -> Result<String>;
}

/// Regex-based wikitext collaborators with Commons `Special:FilePath` URLs.
#[derive(Debug, Clone)]
pub struct WikitextExtractor {
    image_base_url: Url,
}

impl WikitextExtractor {
    pub fn new(image_base_url: &str) -> Result<Self> {
        let image_base_url = Url::parse(image_base_url)
            .with_context(|| format!("Invalid image base URL: {}", image_base_url))?;
        if image_base_url.cannot_be_a_base() {
            anyhow::bail!("Image base URL cannot carry a path: {}", image_base_url);
        }
        Ok(Self { image_base_url })
    }

    fn image_url(&self, file_name: &str) -> Url {
        let mut url = self.image_base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(file_name);
        }
        url
    }
}

impl Default for WikitextExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_BASE_URL).expect("default image base URL is valid")
    }
}

/// Canonical on-disk name for a referenced file, or why it has none.
fn storage_name(reference: &str) -> std::result::Result<String, &'static str> {
    let name = reference.trim().replace(' ', "_");
    if name.is_empty() || name == "." || name == ".." {
        return Err("empty file name");
    }
    if name.contains(['/', '\\']) || name.contains('\0') {
        return Err("file name contains a path separator");
    }
    Ok(name)
}

impl PageExtractor for WikitextExtractor {
    fn extract_images(&self, raw_text: &str, image_dir: &Path) -> (ImageManifest, Option<String>) {
        let mut manifest = ImageManifest::new();
        let mut problems = Vec::new();

        for reference in content::image_references(raw_text) {
            match storage_name(&reference) {
                Ok(file_name) => {
                    let meta = ImageMeta {
                        url: self.image_url(&file_name).to_string(),
                        path: image_dir.join(&file_name),
                        file_name,
                    };
                    manifest.insert(reference, meta);
                }
                Err(reason) => problems.push(format!("{reference:?}: {reason}")),
            }
        }

        let error = if problems.is_empty() {
            None
        } else {
            Some(format!("Unusable image references: {}", problems.join("; ")))
        };
        (manifest, error)
    }

    fn extract_categories(&self, raw_text: &str) -> Vec<String> {
        content::extract_categories(raw_text)
    }

    fn clean(&self, text: &str) -> Result<String> {
        Ok(content::clean_text(text))
    }
}
