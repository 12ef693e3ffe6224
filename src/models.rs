use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// One dump page that passed the namespace filter and carried body text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub title: String,
    pub raw_text: String,
    pub namespace: i64,
}

/// Download metadata for one referenced image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub url: String,
    pub file_name: String,
    pub path: PathBuf,
}

/// Image identifier (file name as referenced in the page) to its metadata
pub type ImageManifest = BTreeMap<String, ImageMeta>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Images {
    None,
    Manifest(ImageManifest),
}

impl Images {
    pub fn from_manifest(manifest: ImageManifest) -> Self {
        if manifest.is_empty() {
            Images::None
        } else {
            Images::Manifest(manifest)
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Images::None)
    }
}

/// Output of the extraction stage for exactly one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub page: String,
    pub sentences: Vec<u8>,
    pub categories: Vec<String>,
    pub images: Images,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTask {
    pub title: String,
    pub images: ImageManifest,
    /// Fetch attempts already made for this task
    pub attempts: u32,
}

impl ImageTask {
    pub fn new(title: String, images: ImageManifest) -> Self {
        Self {
            title,
            images,
            attempts: 0,
        }
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.images.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Reader,
    Extraction,
    ImageDownload,
    Shutdown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Reader => "reader",
            Stage::Extraction => "extraction",
            Stage::ImageDownload => "image_download",
            Stage::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    /// Page title or image identifier the failure belongs to
    pub context: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(stage: Stage, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn reader(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Stage::Reader, title, message)
    }

    pub fn extraction(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Stage::Extraction, title, message)
    }

    pub fn image(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Stage::ImageDownload, title, message)
    }

    pub fn shutdown(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Stage::Shutdown, context, message)
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.context, self.message)
    }
}
