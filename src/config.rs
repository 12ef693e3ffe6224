use crate::error::StartupError;
use std::path::PathBuf;
use std::time::Duration;

/// Capacity of the page channel between the reader and the extraction workers
pub const ARTICLE_CHANNEL_CAPACITY: usize = 2000;

/// Capacity of the processed-record channel feeding the result writer
pub const RESULT_CHANNEL_CAPACITY: usize = 2000;

/// Capacity of the image task channel
pub const IMAGE_CHANNEL_CAPACITY: usize = 10_000;

/// Capacity of the error channel feeding the error writer
pub const ERROR_CHANNEL_CAPACITY: usize = 2000;

pub const EXTRACTION_WORKERS: usize = 5;

pub const IMAGE_WORKERS: usize = 20;

/// How often the status monitor samples channel depths
pub const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on how long any loop blocks before re-reading the shutdown signal
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// First pause after a 429, doubled on every further 429 for the same task
pub const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(10);

pub const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Attempts per image task before a rate-limited task is abandoned
pub const RATE_LIMIT_MAX_ATTEMPTS: u32 = 8;

/// Longest the coordinator waits for in-flight work once the reader is done
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(600);

/// Main article namespace
pub const MAIN_NAMESPACE: i64 = 0;

pub const DEFAULT_IMAGE_DIR: &str = "data/init_images";

pub const DEFAULT_IMAGE_BASE_URL: &str = "https://commons.wikimedia.org/wiki/Special:FilePath/";

pub const USER_AGENT: &str = concat!("wikiflow/", env!("CARGO_PKG_VERSION"));

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Predicate over namespace ids deciding which pages enter the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceFilter {
    Only(Vec<i64>),
    Any,
}

impl NamespaceFilter {
    pub fn main_only() -> Self {
        NamespaceFilter::Only(vec![MAIN_NAMESPACE])
    }

    pub fn accepts(&self, ns: i64) -> bool {
        match self {
            NamespaceFilter::Only(ids) => ids.contains(&ns),
            NamespaceFilter::Any => true,
        }
    }
}

impl Default for NamespaceFilter {
    fn default() -> Self {
        Self::main_only()
    }
}

/// Runtime settings for one pipeline run. Capacities are fixed once the run starts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub namespace_filter: NamespaceFilter,
    pub article_channel_capacity: usize,
    pub result_channel_capacity: usize,
    pub image_channel_capacity: usize,
    pub error_channel_capacity: usize,
    pub extraction_workers: usize,
    pub image_workers: usize,
    pub image_download_enabled: bool,
    pub image_dir: PathBuf,
    pub status_interval: Duration,
    pub poll_interval: Duration,
    pub rate_limit_base_delay: Duration,
    pub rate_limit_max_delay: Duration,
    pub rate_limit_max_attempts: u32,
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            namespace_filter: NamespaceFilter::default(),
            article_channel_capacity: ARTICLE_CHANNEL_CAPACITY,
            result_channel_capacity: RESULT_CHANNEL_CAPACITY,
            image_channel_capacity: IMAGE_CHANNEL_CAPACITY,
            error_channel_capacity: ERROR_CHANNEL_CAPACITY,
            extraction_workers: EXTRACTION_WORKERS,
            image_workers: IMAGE_WORKERS,
            image_download_enabled: false,
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            status_interval: STATUS_INTERVAL,
            poll_interval: POLL_INTERVAL,
            rate_limit_base_delay: RATE_LIMIT_BASE_DELAY,
            rate_limit_max_delay: RATE_LIMIT_MAX_DELAY,
            rate_limit_max_attempts: RATE_LIMIT_MAX_ATTEMPTS,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), StartupError> {
        let positive = [
            ("article channel capacity", self.article_channel_capacity),
            ("result channel capacity", self.result_channel_capacity),
            ("image channel capacity", self.image_channel_capacity),
            ("error channel capacity", self.error_channel_capacity),
            ("extraction workers", self.extraction_workers),
            ("image workers", self.image_workers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(StartupError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(StartupError::InvalidConfig(
                "poll interval must be non-zero".to_string(),
            ));
        }
        if self.rate_limit_max_attempts == 0 {
            return Err(StartupError::InvalidConfig(
                "rate limit attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
