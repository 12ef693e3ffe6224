use std::sync::atomic::{AtomicU64, Ordering};

/// Items sent on a channel but not yet fully handled by its consumer.
///
/// Producers call [`Pending::add`] before sending; consumers call
/// [`Pending::done`] only after every downstream send for the item has been
/// made, so a zero count really means nothing is queued or mid-flight.
#[derive(Default, Debug)]
pub struct Pending(AtomicU64);

impl Pending {
    pub fn add(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn done(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters shared by every stage of a pipeline run
#[derive(Default)]
pub struct PipelineStats {
    pub pages_read: AtomicU64,
    pub records_written: AtomicU64,
    pub errors_written: AtomicU64,
    pub write_failures: AtomicU64,
    pub extraction_failures: AtomicU64,
    pub images_fetched: AtomicU64,
    pub image_failures: AtomicU64,
    pub rate_limit_retries: AtomicU64,
    pub abandoned: AtomicU64,

    pub pending_pages: Pending,
    pub pending_images: Pending,
    pub pending_results: Pending,
    pub pending_errors: Pending,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_pages_read(&self) {
        self.pages_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_records_written(&self) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors_written(&self) {
        self.errors_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_write_failures(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_extraction_failures(&self) {
        self.extraction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_images_fetched(&self) {
        self.images_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_image_failures(&self) {
        self.image_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limit_retries(&self) {
        self.rate_limit_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pages(&self) -> u64 {
        self.pages_read.load(Ordering::Relaxed)
    }

    pub fn records(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_written.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn extraction_failures(&self) -> u64 {
        self.extraction_failures.load(Ordering::Relaxed)
    }

    pub fn images(&self) -> u64 {
        self.images_fetched.load(Ordering::Relaxed)
    }

    pub fn image_failures(&self) -> u64 {
        self.image_failures.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.rate_limit_retries.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// True when no stage holds or awaits any work.
    ///
    /// Counters are read upstream first: a consumer registers its downstream
    /// items before releasing its own, so a zero seen upstream is never
    /// followed by a stale zero further down.
    pub fn is_idle(&self) -> bool {
        self.pending_pages.get() == 0
            && self.pending_images.get() == 0
            && self.pending_results.get() == 0
            && self.pending_errors.get() == 0
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pages_read: self.pages(),
            records_written: self.records(),
            errors_written: self.errors(),
            write_failures: self.write_failures(),
            extraction_failures: self.extraction_failures(),
            images_fetched: self.images(),
            image_failures: self.image_failures(),
            rate_limit_retries: self.retries(),
            abandoned: self.abandoned(),
        }
    }
}

/// Plain copy of the counters at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub pages_read: u64,
    pub records_written: u64,
    pub errors_written: u64,
    pub write_failures: u64,
    pub extraction_failures: u64,
    pub images_fetched: u64,
    pub image_failures: u64,
    pub rate_limit_retries: u64,
    pub abandoned: u64,
}
