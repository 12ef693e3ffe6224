use crate::models::{ErrorRecord, ImageTask, Page, ProcessedRecord};
use crate::shutdown::ShutdownSignal;
use crate::stats::PipelineStats;
use crossbeam_channel::Receiver;
use indicatif::ProgressBar;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelDepths {
    pub articles: usize,
    pub images: usize,
    pub results: usize,
    pub errors: usize,
}

impl ChannelDepths {
    pub fn is_empty(&self) -> bool {
        self.articles == 0 && self.images == 0 && self.results == 0 && self.errors == 0
    }
}

/// Read-only view of every channel's depth. Holds receivers only, so it never
/// keeps a channel open for senders.
pub struct ChannelProbe {
    articles: Receiver<Page>,
    images: Option<Receiver<ImageTask>>,
    results: Receiver<ProcessedRecord>,
    errors: Receiver<ErrorRecord>,
}

impl ChannelProbe {
    pub fn new(
        articles: Receiver<Page>,
        images: Option<Receiver<ImageTask>>,
        results: Receiver<ProcessedRecord>,
        errors: Receiver<ErrorRecord>,
    ) -> Self {
        Self {
            articles,
            images,
            results,
            errors,
        }
    }

    pub fn snapshot(&self) -> ChannelDepths {
        ChannelDepths {
            articles: self.articles.len(),
            images: self.images.as_ref().map_or(0, Receiver::len),
            results: self.results.len(),
            errors: self.errors.len(),
        }
    }
}

pub struct StatusMonitor<'a> {
    probe: &'a ChannelProbe,
    stats: &'a PipelineStats,
    signal: &'a ShutdownSignal,
    interval: Duration,
    poll_interval: Duration,
    progress: Option<ProgressBar>,
}

impl<'a> StatusMonitor<'a> {
    pub fn new(
        probe: &'a ChannelProbe,
        stats: &'a PipelineStats,
        signal: &'a ShutdownSignal,
        interval: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            probe,
            stats,
            signal,
            interval,
            poll_interval,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn status_line(&self) -> String {
        let depths = self.probe.snapshot();
        format!(
            "Queue sizes: articles={} results={} images={} errors={}. Read: {} Written: {}",
            depths.articles,
            depths.results,
            depths.images,
            depths.errors,
            self.stats.pages(),
            self.stats.records(),
        )
    }

    fn report(&self) {
        let depths = self.probe.snapshot();
        info!(
            articles = depths.articles,
            results = depths.results,
            images = depths.images,
            errors = depths.errors,
            read = self.stats.pages(),
            written = self.stats.records(),
            "Pipeline status"
        );
        if let Some(pb) = &self.progress {
            pb.set_message(self.status_line());
            pb.tick();
        }
    }

    /// Reports once per interval until the run terminates.
    pub fn run(&self) {
        let mut next = Instant::now() + self.interval;
        while self.signal.pause(self.poll_interval, self.poll_interval) {
            if Instant::now() >= next {
                self.report();
                next += self.interval;
            }
        }
        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
    }
}
